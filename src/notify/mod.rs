//! Chat notifications fired by opportunity changes.
//!
//! Posting is fire-and-forget from the sync's point of view: [`OppNotifier`]
//! logs sink failures and carries on.
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::db::{self, Pool};
use crate::model::{Candidate, JobOpp, Opportunity};
use crate::stage::{StageEffect, StageTransition};

pub mod telegram;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatType {
    JobCreatorSourcePartner,
    CandidateRecruiting,
    CandidateProspect,
}

/// Identity of one chat thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatKey {
    /// Job creator talking to the candidate's source partner.
    JobCreatorSourcePartner { job_id: i64, partner_id: i64 },
    /// Recruiting thread for one candidate on one job.
    CandidateRecruiting { job_id: i64, candidate_id: i64 },
    /// Candidate-facing thread.
    CandidateProspect { candidate_id: i64 },
}

impl ChatKey {
    pub fn chat_type(&self) -> ChatType {
        match self {
            ChatKey::JobCreatorSourcePartner { .. } => ChatType::JobCreatorSourcePartner,
            ChatKey::CandidateRecruiting { .. } => ChatType::CandidateRecruiting,
            ChatKey::CandidateProspect { .. } => ChatType::CandidateProspect,
        }
    }
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatKey::JobCreatorSourcePartner { job_id, partner_id } => {
                write!(f, "job-creator-source-partner:{job_id}:{partner_id}")
            }
            ChatKey::CandidateRecruiting {
                job_id,
                candidate_id,
            } => write!(f, "candidate-recruiting:{job_id}:{candidate_id}"),
            ChatKey::CandidateProspect { candidate_id } => {
                write!(f, "candidate-prospect:{candidate_id}")
            }
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(&self, chat: &ChatKey, message: &str) -> Result<()>;
}

/// Persists posts in the `chat_posts` table.
#[derive(Debug, Clone)]
pub struct ChatPostStore {
    pool: Pool,
}

impl ChatPostStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for ChatPostStore {
    async fn post(&self, chat: &ChatKey, message: &str) -> Result<()> {
        let id = db::insert_chat_post(&self.pool, &chat.to_string(), message).await?;
        debug!(chat = %chat, post_id = id, "chat post stored");
        Ok(())
    }
}

/// Delivers to every inner sink; reports the first failure after trying all.
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl NotificationSink for Fanout {
    async fn post(&self, chat: &ChatKey, message: &str) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.post(chat, message).await {
                warn!(chat = %chat, error = %e, "sink failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn name_and_number(candidate: &Candidate) -> String {
    format!(
        "{} ({})",
        candidate.display_name(),
        candidate.candidate_number
    )
}

fn case_label(opp: &Opportunity, job: &JobOpp) -> String {
    opp.name.clone().unwrap_or_else(|| job.name.clone())
}

/// Posts for a stage change, in delivery order. Empty when the change has no
/// audience.
pub fn render_stage_posts(
    opp: &Opportunity,
    candidate: &Candidate,
    job: &JobOpp,
    transition: StageTransition,
) -> Vec<(ChatKey, String)> {
    let audience = transition.audience(candidate.all_notifications);
    let who = name_and_number(candidate);
    let mut posts = Vec::new();

    let (candidate_msg, recruiting_msg, jcsp_msg) = match transition.effect() {
        StageEffect::None => return posts,
        StageEffect::Closed => {
            let msg = format!(
                "The candidate {who} has been removed for the job '{}' with the reason {}.",
                job.name, transition.to
            );
            (msg.clone(), msg.clone(), msg)
        }
        StageEffect::Accepted => {
            let msg = format!(
                "The candidate {who} has accepted the job offer from '{}'.",
                job.name
            );
            (msg.clone(), msg.clone(), msg)
        }
        StageEffect::StageChanged => (
            format!(
                "Your application for the job '{}' has moved to the stage '{}'.",
                job.name, transition.to
            ),
            String::new(),
            format!(
                "{}: this case for candidate {who} has changed stage from '{}' to '{}'.",
                case_label(opp, job),
                transition.from,
                transition.to
            ),
        ),
    };

    if audience.candidate {
        posts.push((
            ChatKey::CandidateProspect {
                candidate_id: candidate.id,
            },
            candidate_msg,
        ));
    }
    if audience.recruiting {
        posts.push((
            ChatKey::CandidateRecruiting {
                job_id: job.id,
                candidate_id: candidate.id,
            },
            recruiting_msg,
        ));
    }
    if audience.job_creator {
        match candidate.partner_id {
            Some(partner_id) => posts.push((
                ChatKey::JobCreatorSourcePartner {
                    job_id: job.id,
                    partner_id,
                },
                jcsp_msg,
            )),
            None => warn!(
                candidate_id = candidate.id,
                "candidate has no source partner; skipping job creator chat"
            ),
        }
    }
    posts
}

/// Post announcing new next-step details to the job creator chat.
pub fn render_next_step_post(
    opp: &Opportunity,
    candidate: &Candidate,
    job: &JobOpp,
) -> Option<(ChatKey, String)> {
    let partner_id = candidate.partner_id?;
    let due = opp
        .next_step_due_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "none".to_string());
    let msg = format!(
        "{}: the next step details have changed for this case relating to candidate {}.\nNext step: {}\nDue date: {}",
        case_label(opp, job),
        name_and_number(candidate),
        opp.next_step.as_deref().unwrap_or(""),
        due
    );
    Some((
        ChatKey::JobCreatorSourcePartner {
            job_id: job.id,
            partner_id,
        },
        msg,
    ))
}

/// Renders opportunity posts and hands them to a sink.
#[derive(Clone)]
pub struct OppNotifier {
    sink: Arc<dyn NotificationSink>,
}

impl OppNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Returns the number of posts delivered.
    pub async fn notify_stage_change(
        &self,
        opp: &Opportunity,
        candidate: &Candidate,
        job: &JobOpp,
        transition: StageTransition,
    ) -> usize {
        let posts = render_stage_posts(opp, candidate, job, transition);
        self.deliver(opp, posts).await
    }

    pub async fn notify_next_step_change(
        &self,
        opp: &Opportunity,
        candidate: &Candidate,
        job: &JobOpp,
    ) -> usize {
        let posts = render_next_step_post(opp, candidate, job).into_iter().collect();
        self.deliver(opp, posts).await
    }

    async fn deliver(&self, opp: &Opportunity, posts: Vec<(ChatKey, String)>) -> usize {
        let mut delivered = 0;
        for (chat, message) in posts {
            match self.sink.post(&chat, &message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    opp_id = opp.id,
                    remote_id = ?opp.remote_id,
                    chat = %chat,
                    error = %e,
                    "failed to post notification"
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CandidateStatus;
    use crate::stage::Stage;
    use chrono::Utc;

    fn fixtures(all_notifications: bool) -> (Opportunity, Candidate, JobOpp) {
        let now = Utc::now();
        let candidate = Candidate {
            id: 7,
            candidate_number: "1234".into(),
            first_name: Some("Jane".into()),
            last_name: Some("Doe".into()),
            partner_id: Some(3),
            status: CandidateStatus::Active,
            all_notifications,
            relocated_country: None,
            created_at: now,
            updated_at: now,
        };
        let job = JobOpp {
            id: 2,
            remote_id: "a0J1".into(),
            name: "Nurse".into(),
            country: Some("Canada".into()),
            created_at: now,
            updated_at: now,
        };
        let opp = Opportunity {
            id: 1,
            remote_id: Some("006A".into()),
            candidate_id: 7,
            job_opp_id: 2,
            name: Some("Jane Doe (1234)-Nurse".into()),
            stage: Stage::Prospect,
            last_active_stage: None,
            closed: false,
            won: false,
            next_step: Some("Interview".into()),
            next_step_due_date: None,
            closing_comments: None,
            closing_comments_for_candidate: None,
            employer_feedback: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        (opp, candidate, job)
    }

    fn keys(posts: &[(ChatKey, String)]) -> Vec<String> {
        posts.iter().map(|(k, _)| k.to_string()).collect()
    }

    #[test]
    fn chat_keys_render() {
        assert_eq!(
            ChatKey::JobCreatorSourcePartner {
                job_id: 2,
                partner_id: 3
            }
            .to_string(),
            "job-creator-source-partner:2:3"
        );
        assert_eq!(
            ChatKey::CandidateProspect { candidate_id: 7 }.chat_type(),
            ChatType::CandidateProspect
        );
    }

    #[test]
    fn closed_from_prospect_skips_candidate() {
        let (opp, c, j) = fixtures(true);
        let posts = render_stage_posts(
            &opp,
            &c,
            &j,
            StageTransition::new(Stage::Prospect, Stage::NoJobOffer),
        );
        assert_eq!(
            keys(&posts),
            vec!["candidate-recruiting:2:7", "job-creator-source-partner:2:3"]
        );
        assert!(posts[0].1.contains("with the reason No job offer"));
    }

    #[test]
    fn acceptance_reaches_all_three_chats() {
        let (opp, c, j) = fixtures(false);
        let posts = render_stage_posts(
            &opp,
            &c,
            &j,
            StageTransition::new(Stage::Prospect, Stage::Acceptance),
        );
        assert_eq!(posts.len(), 3);
        assert!(posts.iter().all(|(_, m)| m.contains("accepted the job offer")));
    }

    #[test]
    fn stage_change_posts_job_creator_and_gated_candidate() {
        let (opp, c, j) = fixtures(false);
        let t = StageTransition::new(Stage::Prospect, Stage::CvReview);
        assert_eq!(
            keys(&render_stage_posts(&opp, &c, &j, t)),
            vec!["job-creator-source-partner:2:3"]
        );

        let t = StageTransition::new(Stage::CvReview, Stage::Offer);
        let posts = render_stage_posts(&opp, &c, &j, t);
        assert_eq!(
            keys(&posts),
            vec!["candidate-prospect:7", "job-creator-source-partner:2:3"]
        );
        assert!(posts[1].1.contains("from 'CV review' to 'Offer'"));
    }

    #[test]
    fn missing_partner_drops_job_creator_chat() {
        let (opp, mut c, j) = fixtures(true);
        c.partner_id = None;
        let posts = render_stage_posts(
            &opp,
            &c,
            &j,
            StageTransition::new(Stage::Prospect, Stage::MiniIntake),
        );
        assert_eq!(keys(&posts), vec!["candidate-prospect:7"]);
        assert!(render_next_step_post(&opp, &c, &j).is_none());
    }

    #[test]
    fn next_step_post_mentions_due_date() {
        let (opp, c, j) = fixtures(false);
        let (key, msg) = render_next_step_post(&opp, &c, &j).unwrap();
        assert_eq!(key.chat_type(), ChatType::JobCreatorSourcePartner);
        assert!(msg.contains("Next step: Interview"));
        assert!(msg.ends_with("Due date: none"));
    }

    struct Failing;

    #[async_trait]
    impl NotificationSink for Failing {
        async fn post(&self, _chat: &ChatKey, _message: &str) -> Result<()> {
            anyhow::bail!("chat service down")
        }
    }

    #[tokio::test]
    async fn sink_failures_are_absorbed() {
        let (opp, c, j) = fixtures(false);
        let notifier = OppNotifier::new(Arc::new(Failing));
        let delivered = notifier
            .notify_stage_change(
                &opp,
                &c,
                &j,
                StageTransition::new(Stage::Prospect, Stage::Acceptance),
            )
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn fanout_stores_and_reports_failure() {
        let pool = db::init_memory_pool().await.unwrap();
        let fan = Fanout::new()
            .with(Arc::new(ChatPostStore::new(pool.clone())))
            .with(Arc::new(Failing));
        let key = ChatKey::CandidateProspect { candidate_id: 7 };
        assert!(fan.post(&key, "hello").await.is_err());
        let posts = db::list_chat_posts(&pool, Some("candidate-prospect:7"))
            .await
            .unwrap();
        assert_eq!(posts.len(), 1);
    }
}
