use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::model::RemoteSnapshot;

/// One page of a SOQL query response.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse<T> {
    pub total_size: u64,
    pub done: bool,
    pub next_records_url: Option<String>,
    pub records: Vec<T>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ParentJobRef {
    #[serde(rename = "Country__c")]
    pub country: Option<String>,
}

/// Candidate opportunity as returned by the CRM.
#[derive(Deserialize, Debug)]
pub struct OpportunityRecord {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "StageName")]
    pub stage_name: Option<String>,
    #[serde(rename = "IsClosed", default)]
    pub is_closed: bool,
    #[serde(rename = "IsWon", default)]
    pub is_won: bool,
    #[serde(rename = "NextStep")]
    pub next_step: Option<String>,
    #[serde(rename = "Next_Step_Due_Date__c")]
    pub next_step_due_date: Option<String>,
    #[serde(rename = "Closing_Comments__c")]
    pub closing_comments: Option<String>,
    #[serde(rename = "Closing_Comments_For_Candidate__c")]
    pub closing_comments_for_candidate: Option<String>,
    #[serde(rename = "Employer_Feedback__c")]
    pub employer_feedback: Option<String>,
    #[serde(rename = "Parent_Opportunity__c")]
    pub parent_opportunity: Option<String>,
    #[serde(rename = "Parent_Opportunity__r")]
    pub parent: Option<ParentJobRef>,
    #[serde(rename = "Candidate_TC_id__c")]
    pub candidate_number: Option<String>,
    #[serde(rename = "LastModifiedDate")]
    pub last_modified_date: Option<String>,
}

/// CRM timestamps look like `2024-05-01T10:00:00.000+0000`.
pub fn parse_crm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl From<OpportunityRecord> for RemoteSnapshot {
    fn from(r: OpportunityRecord) -> Self {
        let last_modified = r.last_modified_date.as_deref().and_then(|raw| {
            let parsed = parse_crm_timestamp(raw);
            if parsed.is_none() {
                warn!(remote_id = %r.id, value = raw, "unparseable LastModifiedDate");
            }
            parsed
        });
        RemoteSnapshot {
            id: r.id,
            name: r.name,
            parent_job_id: r.parent_opportunity,
            candidate_number: r.candidate_number,
            stage_name: r.stage_name,
            is_closed: r.is_closed,
            is_won: r.is_won,
            next_step: r.next_step,
            next_step_due_date: r.next_step_due_date,
            closing_comments: r.closing_comments,
            closing_comments_for_candidate: r.closing_comments_for_candidate,
            employer_feedback: r.employer_feedback,
            job_country: r.parent.and_then(|p| p.country),
            last_modified,
        }
    }
}
