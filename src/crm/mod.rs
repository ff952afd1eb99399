use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config;
use crate::model::RemoteSnapshot;

pub mod model;

use model::{OpportunityRecord, QueryResponse};

/// Fields fetched for every candidate opportunity.
pub const OPPORTUNITY_FIELDS: &str = "Id,Name,StageName,IsClosed,IsWon,NextStep,Next_Step_Due_Date__c,\
     Closing_Comments__c,Closing_Comments_For_Candidate__c,Employer_Feedback__c,\
     Parent_Opportunity__c,Parent_Opportunity__r.Country__c,Candidate_TC_id__c,LastModifiedDate";

/// Which id column a fetch-by-ids call matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Ids of the candidate opportunities themselves.
    Opportunity,
    /// Ids of parent job opportunities; returns all their candidate opportunities.
    ParentJob,
}

impl IdKind {
    fn column(&self) -> &'static str {
        match self {
            IdKind::Opportunity => "Id",
            IdKind::ParentJob => "Parent_Opportunity__c",
        }
    }
}

#[async_trait]
pub trait CrmService: Send + Sync {
    async fn fetch_snapshots_by_ids(
        &self,
        ids: &[String],
        kind: IdKind,
    ) -> Result<Vec<RemoteSnapshot>>;

    /// Open candidate opportunities modified after `since`, oldest first.
    async fn fetch_snapshots_open_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteSnapshot>>;
}

#[derive(Clone)]
pub struct CrmClient {
    http: Client,
    base_url: Url,
    token: String,
    api_version: String,
    record_type: String,
    max_ids_per_request: usize,
}

impl fmt::Debug for CrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmClient")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl CrmClient {
    pub fn from_config(cfg: &config::Crm) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid crm.base_url")?;
        let http = Client::builder()
            .user_agent("oppsync/0.1")
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token: cfg.access_token.clone(),
            api_version: cfg.api_version.clone(),
            record_type: cfg.candidate_record_type.clone(),
            max_ids_per_request: cfg.max_ids_per_request.max(1),
        })
    }

    pub fn build_query_request(&self, soql: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("services/data/v{}/query", self.api_version))
            .context("invalid CRM base URL")?;
        self.http
            .get(endpoint)
            .query(&[("q", soql)])
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .build()
            .context("failed to build CRM query request")
    }

    async fn send(&self, request: reqwest::Request) -> Result<QueryResponse<OpportunityRecord>> {
        debug!(url = %request.url(), "crm query");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach CRM")?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%body, "rate limited by CRM");
            return Err(anyhow!("received 429 from CRM: {body}"));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, %body, "CRM query failed");
            return Err(anyhow!("crm error {status}: {body}"));
        }
        res.json::<QueryResponse<OpportunityRecord>>()
            .await
            .context("invalid CRM query response")
    }

    /// Runs `soql`, following `nextRecordsUrl` until the result is complete.
    pub async fn query_all(&self, soql: &str) -> Result<Vec<RemoteSnapshot>> {
        let mut page = self.send(self.build_query_request(soql)?).await?;
        let total = page.total_size;
        let mut out = page_buffer(&page);
        loop {
            out.extend(page.records.into_iter().map(RemoteSnapshot::from));
            match (page.done, page.next_records_url) {
                (false, Some(next)) => {
                    let url = self.base_url.join(&next).context("invalid nextRecordsUrl")?;
                    let request = self
                        .http
                        .get(url)
                        .bearer_auth(&self.token)
                        .header("Accept", "application/json")
                        .build()?;
                    page = self.send(request).await?;
                }
                _ => break,
            }
        }
        debug!(total, fetched = out.len(), "crm query complete");
        Ok(out)
    }
}

/// Buffer for a query's results, sized by the records that actually arrived.
/// `totalSize` comes from the server and is only logged.
fn page_buffer<T>(first: &QueryResponse<T>) -> Vec<RemoteSnapshot> {
    Vec::with_capacity(first.records.len())
}

#[async_trait]
impl CrmService for CrmClient {
    async fn fetch_snapshots_by_ids(
        &self,
        ids: &[String],
        kind: IdKind,
    ) -> Result<Vec<RemoteSnapshot>> {
        let mut out = Vec::new();
        for group in ids.chunks(self.max_ids_per_request) {
            let soql = build_query_by_ids(group, kind, &self.record_type);
            out.extend(self.query_all(&soql).await?);
        }
        info!(requested = ids.len(), fetched = out.len(), ?kind, "fetched snapshots");
        Ok(out)
    }

    async fn fetch_snapshots_open_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteSnapshot>> {
        let soql = build_query_open_since(since, &self.record_type);
        let out = self.query_all(&soql).await?;
        info!(%since, fetched = out.len(), "fetched changed snapshots");
        Ok(out)
    }
}

/// Quotes a value as a SOQL string literal.
pub fn soql_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

pub fn build_query_by_ids(ids: &[String], kind: IdKind, record_type: &str) -> String {
    let list = ids
        .iter()
        .map(|id| soql_quote(id))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "SELECT {OPPORTUNITY_FIELDS} FROM Opportunity WHERE {} IN ({list}) AND RecordTypeId = {}",
        kind.column(),
        soql_quote(record_type)
    )
}

pub fn build_query_open_since(since: DateTime<Utc>, record_type: &str) -> String {
    format!(
        "SELECT {OPPORTUNITY_FIELDS} FROM Opportunity WHERE IsClosed = false \
         AND LastModifiedDate > {} AND RecordTypeId = {} ORDER BY LastModifiedDate",
        since.to_rfc3339_opts(SecondsFormat::Secs, true),
        soql_quote(record_type)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn client() -> CrmClient {
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        CrmClient::from_config(&cfg.crm).unwrap()
    }

    #[test]
    fn by_ids_query_quotes_and_filters() {
        let q = build_query_by_ids(
            &["006A".to_string(), "o'brien".to_string()],
            IdKind::Opportunity,
            "012X",
        );
        assert!(q.starts_with("SELECT Id,Name,StageName"));
        assert!(q.contains("WHERE Id IN ('006A','o\\'brien')"));
        assert!(q.ends_with("AND RecordTypeId = '012X'"));

        let q = build_query_by_ids(&["a0J1".to_string()], IdKind::ParentJob, "012X");
        assert!(q.contains("WHERE Parent_Opportunity__c IN ('a0J1')"));
    }

    #[test]
    fn open_since_query_uses_soql_datetime_literal() {
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let q = build_query_open_since(since, "012X");
        assert!(q.contains("IsClosed = false"));
        assert!(q.contains("LastModifiedDate > 2024-05-01T10:00:00Z"));
        assert!(q.ends_with("ORDER BY LastModifiedDate"));
    }

    #[test]
    fn query_request_has_auth_and_encoded_soql() {
        let req = client().build_query_request("SELECT Id FROM Opportunity").unwrap();
        assert_eq!(req.method(), reqwest::Method::GET);
        assert_eq!(req.url().path(), "/services/data/v58.0/query");
        let q: Vec<(String, String)> = req.url().query_pairs().into_owned().collect();
        assert_eq!(q, vec![("q".into(), "SELECT Id FROM Opportunity".into())]);
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert_eq!(auth, "Bearer YOUR_CRM_ACCESS_TOKEN");
    }

    #[test]
    fn record_maps_to_snapshot() {
        let body = r#"{
            "totalSize": 1,
            "done": true,
            "records": [{
                "attributes": {"type": "Opportunity"},
                "Id": "006A",
                "Name": "Jane Doe (1234)-Nurse",
                "StageName": "Relocated",
                "IsClosed": false,
                "IsWon": false,
                "NextStep": null,
                "Next_Step_Due_Date__c": "2024-06-01",
                "Parent_Opportunity__c": "a0J1",
                "Parent_Opportunity__r": {"attributes": {"type": "Opportunity"}, "Country__c": "Canada"},
                "Candidate_TC_id__c": "1234",
                "LastModifiedDate": "2024-05-01T10:00:00.000+0000"
            }]
        }"#;
        let page: QueryResponse<OpportunityRecord> = serde_json::from_str(body).unwrap();
        assert!(page.done);
        let snap = RemoteSnapshot::from(page.records.into_iter().next().unwrap());
        assert_eq!(snap.id, "006A");
        assert_eq!(snap.stage_name.as_deref(), Some("Relocated"));
        assert_eq!(snap.job_country.as_deref(), Some("Canada"));
        assert_eq!(snap.parent_job_id.as_deref(), Some("a0J1"));
        assert_eq!(snap.candidate_number.as_deref(), Some("1234"));
        assert_eq!(
            snap.last_modified,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(snap.next_step, None);
    }

    #[test]
    fn oversized_total_does_not_drive_allocation() {
        let body = r#"{
            "totalSize": 18446744073709551615,
            "done": false,
            "nextRecordsUrl": "/services/data/v58.0/query/01gX-2000",
            "records": [{"Id": "006A", "IsClosed": false, "IsWon": false}]
        }"#;
        let page: QueryResponse<OpportunityRecord> = serde_json::from_str(body).unwrap();
        let buf = page_buffer(&page);
        assert!(buf.capacity() >= 1);
        assert!(buf.capacity() < 64);
    }

    #[test]
    fn bad_timestamp_becomes_none() {
        assert!(model::parse_crm_timestamp("yesterday").is_none());
        assert!(model::parse_crm_timestamp("2024-05-01T10:00:00Z").is_some());
    }
}
