use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Active,
    Employed,
    Ineligible,
    Withdrawn,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Active => "active",
            CandidateStatus::Employed => "employed",
            CandidateStatus::Ineligible => "ineligible",
            CandidateStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CandidateStatus::Active),
            "employed" => Some(CandidateStatus::Employed),
            "ineligible" => Some(CandidateStatus::Ineligible),
            "withdrawn" => Some(CandidateStatus::Withdrawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub candidate_number: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub partner_id: Option<i64>,
    pub status: CandidateStatus,
    /// Opted in to hear about every stage past prospect.
    pub all_notifications: bool,
    pub relocated_country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(n), None) | (None, Some(n)) => n.clone(),
            (None, None) => self.candidate_number.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOpp {
    pub id: i64,
    pub remote_id: String,
    pub name: String,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Local record of one candidate's progression through one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: i64,
    /// CRM id; `None` until the record has been linked.
    pub remote_id: Option<String>,
    pub candidate_id: i64,
    pub job_opp_id: i64,
    pub name: Option<String>,
    pub stage: Stage,
    pub last_active_stage: Option<Stage>,
    pub closed: bool,
    pub won: bool,
    pub next_step: Option<String>,
    pub next_step_due_date: Option<NaiveDate>,
    pub closing_comments: Option<String>,
    pub closing_comments_for_candidate: Option<String>,
    pub employer_feedback: Option<String>,
    /// Optimistic concurrency token, bumped on every save.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateNote {
    pub id: i64,
    pub candidate_id: i64,
    pub title: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPost {
    pub id: i64,
    pub chat_key: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Read-only view of a remote opportunity as the CRM reports it.
///
/// Text fields are passed through verbatim; the due date stays a string
/// because the remote side does not guarantee it parses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub id: String,
    pub name: Option<String>,
    pub parent_job_id: Option<String>,
    pub candidate_number: Option<String>,
    pub stage_name: Option<String>,
    pub is_closed: bool,
    pub is_won: bool,
    pub next_step: Option<String>,
    pub next_step_due_date: Option<String>,
    pub closing_comments: Option<String>,
    pub closing_comments_for_candidate: Option<String>,
    pub employer_feedback: Option<String>,
    pub job_country: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Which trigger a chunk of work was started by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Explicit job list; may create missing local records.
    Full,
    /// Open local opportunities only; never creates.
    Incremental,
    /// Remote records modified since the stored watermark.
    ChangedSince,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
            SyncMode::ChangedSince => "changed_since",
        }
    }

    pub fn creates_missing(&self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::ChangedSince)
    }
}
