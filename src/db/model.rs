//! Query inputs and insert payloads used by the repository layer.
//!
//! Entities themselves live in `crate::model`; the structs here only shape
//! what goes into a query.

use crate::model::CandidateStatus;
use crate::stage::Stage;

/// Zero-based page for paged finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub index: u32,
    pub size: u32,
}

impl Page {
    pub fn new(index: u32, size: u32) -> Self {
        Self { index, size }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.index) * i64::from(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpportunityStatus {
    Open,
    Closed,
}

impl OpportunityStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, OpportunityStatus::Closed)
    }
}

#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub candidate_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub partner_id: Option<i64>,
    pub status: CandidateStatus,
    pub all_notifications: bool,
}

impl NewCandidate {
    pub fn new(candidate_number: impl Into<String>) -> Self {
        Self {
            candidate_number: candidate_number.into(),
            first_name: None,
            last_name: None,
            partner_id: None,
            status: CandidateStatus::Active,
            all_notifications: false,
        }
    }
}

/// Opportunity row to create; everything else starts at its column default.
#[derive(Debug, Clone)]
pub struct NewOpportunity {
    pub remote_id: Option<String>,
    pub candidate_id: i64,
    pub job_opp_id: i64,
    pub name: Option<String>,
    pub stage: Stage,
}
