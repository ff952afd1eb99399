//! Field-level diff between a remote snapshot and the local opportunity.
//!
//! Every syncable field has exactly one rule below. A rule adds the field to
//! the [`ChangeSet`] only when the remote value is present and differs from
//! the local one; data the remote side got wrong (bad dates, unknown stage
//! names) is logged and left out, never fatal.
use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::model::{Opportunity, RemoteSnapshot};
use crate::stage::{Stage, StageTransition};

/// Format the CRM uses for plain dates.
pub const CRM_DATE_FORMAT: &str = "%Y-%m-%d";

/// Decides whether a remote text value should replace the local one.
pub trait TextComparator: Send + Sync {
    fn differs(&self, remote: &str, local: Option<&str>) -> bool;
}

impl<F> TextComparator for F
where
    F: Fn(&str, Option<&str>) -> bool + Send + Sync,
{
    fn differs(&self, remote: &str, local: Option<&str>) -> bool {
        self(remote, local)
    }
}

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Treats whitespace runs, line endings and leading/trailing space as
/// insignificant, and a missing local value as equal to a blank remote one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedText;

impl NormalizedText {
    pub fn normalize(s: &str) -> String {
        WHITESPACE.replace_all(s.trim(), " ").into_owned()
    }
}

impl TextComparator for NormalizedText {
    fn differs(&self, remote: &str, local: Option<&str>) -> bool {
        let remote = Self::normalize(remote);
        let local = local.map(Self::normalize).unwrap_or_default();
        remote != local
    }
}

/// Sparse set of field updates. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub name: Option<String>,
    pub stage: Option<Stage>,
    pub closed: Option<bool>,
    pub won: Option<bool>,
    pub next_step: Option<String>,
    pub next_step_due_date: Option<NaiveDate>,
    pub closing_comments: Option<String>,
    pub closing_comments_for_candidate: Option<String>,
    pub employer_feedback: Option<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        *self == ChangeSet::default()
    }

    /// Names of the populated fields, for logging.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        let flags = [
            ("stage", self.stage.is_some()),
            ("closed", self.closed.is_some()),
            ("won", self.won.is_some()),
            ("next_step_due_date", self.next_step_due_date.is_some()),
        ];
        for rule in TEXT_RULES {
            if (rule.slot_ref)(self).is_some() {
                out.push(rule.field);
            }
        }
        out.extend(flags.into_iter().filter(|(_, set)| *set).map(|(f, _)| f));
        out
    }

    /// Writes the populated fields into `opp`. Returns the stage transition
    /// when the stage actually changed. An empty set leaves `opp` untouched.
    pub fn apply_to(&self, opp: &mut Opportunity) -> Option<StageTransition> {
        if self.is_empty() {
            return None;
        }
        for rule in TEXT_RULES {
            if let Some(value) = (rule.slot_ref)(self) {
                *(rule.local_mut)(opp) = Some(value.clone());
            }
        }
        if let Some(closed) = self.closed {
            opp.closed = closed;
        }
        if let Some(won) = self.won {
            opp.won = won;
        }
        if let Some(due) = self.next_step_due_date {
            opp.next_step_due_date = Some(due);
        }
        opp.updated_at = Utc::now();

        let to = self.stage?;
        let transition = StageTransition::new(opp.stage, to);
        opp.stage = to;
        if !to.is_closed() {
            opp.last_active_stage = Some(to);
        }
        transition.is_change().then_some(transition)
    }
}

struct TextRule {
    field: &'static str,
    remote: fn(&RemoteSnapshot) -> Option<&str>,
    local: fn(&Opportunity) -> Option<&str>,
    local_mut: fn(&mut Opportunity) -> &mut Option<String>,
    slot: fn(&mut ChangeSet) -> &mut Option<String>,
    slot_ref: fn(&ChangeSet) -> &Option<String>,
}

const TEXT_RULES: &[TextRule] = &[
    TextRule {
        field: "name",
        remote: |r| r.name.as_deref(),
        local: |o| o.name.as_deref(),
        local_mut: |o| &mut o.name,
        slot: |c| &mut c.name,
        slot_ref: |c| &c.name,
    },
    TextRule {
        field: "next_step",
        remote: |r| r.next_step.as_deref(),
        local: |o| o.next_step.as_deref(),
        local_mut: |o| &mut o.next_step,
        slot: |c| &mut c.next_step,
        slot_ref: |c| &c.next_step,
    },
    TextRule {
        field: "closing_comments",
        remote: |r| r.closing_comments.as_deref(),
        local: |o| o.closing_comments.as_deref(),
        local_mut: |o| &mut o.closing_comments,
        slot: |c| &mut c.closing_comments,
        slot_ref: |c| &c.closing_comments,
    },
    TextRule {
        field: "closing_comments_for_candidate",
        remote: |r| r.closing_comments_for_candidate.as_deref(),
        local: |o| o.closing_comments_for_candidate.as_deref(),
        local_mut: |o| &mut o.closing_comments_for_candidate,
        slot: |c| &mut c.closing_comments_for_candidate,
        slot_ref: |c| &c.closing_comments_for_candidate,
    },
    TextRule {
        field: "employer_feedback",
        remote: |r| r.employer_feedback.as_deref(),
        local: |o| o.employer_feedback.as_deref(),
        local_mut: |o| &mut o.employer_feedback,
        slot: |c| &mut c.employer_feedback,
        slot_ref: |c| &c.employer_feedback,
    },
];

#[derive(Clone)]
pub struct SnapshotDiffer {
    text: Arc<dyn TextComparator>,
}

impl Default for SnapshotDiffer {
    fn default() -> Self {
        Self::new(NormalizedText)
    }
}

impl std::fmt::Debug for SnapshotDiffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotDiffer").finish_non_exhaustive()
    }
}

impl SnapshotDiffer {
    pub fn new(text: impl TextComparator + 'static) -> Self {
        Self {
            text: Arc::new(text),
        }
    }

    pub fn diff(&self, remote: &RemoteSnapshot, local: &Opportunity) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for rule in TEXT_RULES {
            if let Some(value) = (rule.remote)(remote) {
                if self.text.differs(value, (rule.local)(local)) {
                    *(rule.slot)(&mut changes) = Some(value.to_string());
                }
            }
        }

        if let Some(name) = remote.stage_name.as_deref() {
            match Stage::from_crm_name(name) {
                Some(stage) if stage != local.stage => changes.stage = Some(stage),
                Some(_) => {}
                None => warn!(
                    remote_id = %remote.id,
                    stage_name = name,
                    "unmapped stage name; keeping local stage"
                ),
            }
        }

        if let Some(raw) = remote.next_step_due_date.as_deref() {
            match parse_crm_date(raw) {
                Some(date) if Some(date) != local.next_step_due_date => {
                    changes.next_step_due_date = Some(date)
                }
                Some(_) => {}
                None => warn!(
                    remote_id = %remote.id,
                    value = raw,
                    "unparseable next step due date; field skipped"
                ),
            }
        }

        // Flags are derived from the stage the record ends up in, so a closed
        // or won flag can never sit on a stage that is neither.
        let effective = changes.stage.unwrap_or(local.stage);
        if remote.is_closed && !effective.is_closed() {
            warn!(
                remote_id = %remote.id,
                stage = effective.as_str(),
                "remote marked closed but stage is open; closed flag not applied"
            );
        }
        let closed = remote.is_closed && effective.is_closed();
        if closed != local.closed {
            changes.closed = Some(closed);
        }
        if remote.is_won && !effective.is_won() {
            warn!(
                remote_id = %remote.id,
                stage = effective.as_str(),
                "remote marked won but stage is not a won stage; won flag not applied"
            );
        }
        let won = remote.is_won && effective.is_won();
        if won != local.won {
            changes.won = Some(won);
        }

        changes
    }
}

/// Parses a CRM date, tolerating a trailing time component.
pub fn parse_crm_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, CRM_DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local() -> Opportunity {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Opportunity {
            id: 1,
            remote_id: Some("006A".into()),
            candidate_id: 10,
            job_opp_id: 20,
            name: Some("Jane Doe (1234)-Nurse".into()),
            stage: Stage::CvReview,
            last_active_stage: Some(Stage::CvReview),
            closed: false,
            won: false,
            next_step: Some("Book interview".into()),
            next_step_due_date: NaiveDate::from_ymd_opt(2024, 3, 1),
            closing_comments: None,
            closing_comments_for_candidate: None,
            employer_feedback: None,
            version: 0,
            created_at: ts,
            updated_at: ts,
        }
    }

    fn remote() -> RemoteSnapshot {
        RemoteSnapshot {
            id: "006A".into(),
            name: Some("Jane Doe (1234)-Nurse".into()),
            stage_name: Some("CV review".into()),
            next_step: Some("Book interview".into()),
            next_step_due_date: Some("2024-03-01".into()),
            ..Default::default()
        }
    }

    #[test]
    fn identical_records_produce_empty_change_set() {
        let changes = SnapshotDiffer::default().diff(&remote(), &local());
        assert!(changes.is_empty(), "{changes:?}");
    }

    #[test]
    fn whitespace_variants_are_not_changes() {
        let mut r = remote();
        r.next_step = Some("  Book\r\n   interview ".into());
        r.closing_comments = Some("   ".into());
        assert!(SnapshotDiffer::default().diff(&r, &local()).is_empty());
    }

    #[test]
    fn comparator_is_pluggable() {
        let strict = SnapshotDiffer::new(|remote: &str, local: Option<&str>| Some(remote) != local);
        let mut r = remote();
        r.next_step = Some("Book interview ".into());
        let changes = strict.diff(&r, &local());
        assert_eq!(changes.next_step.as_deref(), Some("Book interview "));
    }

    #[test]
    fn diff_is_idempotent_without_local_mutation() {
        let mut r = remote();
        r.stage_name = Some("Offer".into());
        r.employer_feedback = Some("Strong".into());
        let differ = SnapshotDiffer::default();
        let l = local();
        assert_eq!(differ.diff(&r, &l), differ.diff(&r, &l));
    }

    #[test]
    fn unmapped_stage_is_left_out() {
        let mut r = remote();
        r.stage_name = Some("Nonexistent Stage".into());
        r.next_step = Some("Call back".into());
        let mut l = local();
        let changes = SnapshotDiffer::default().diff(&r, &l);
        assert_eq!(changes.stage, None);
        assert_eq!(changes.next_step.as_deref(), Some("Call back"));
        assert_eq!(changes.apply_to(&mut l), None);
        assert_eq!(l.stage, Stage::CvReview);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unmapped_stage_logs_a_warning() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let mut r = remote();
        r.stage_name = Some("Nonexistent Stage".into());

        let changes =
            tracing::subscriber::with_default(subscriber, || SnapshotDiffer::default().diff(&r, &local()));
        assert_eq!(changes.stage, None);

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("unmapped stage name"), "{out}");
        assert!(out.contains("Nonexistent Stage"), "{out}");
        assert!(out.contains("006A"), "{out}");
    }

    #[test]
    fn bad_due_date_is_skipped_not_fatal() {
        let mut r = remote();
        r.next_step_due_date = Some("31/12/2024".into());
        r.employer_feedback = Some("Good".into());
        let changes = SnapshotDiffer::default().diff(&r, &local());
        assert_eq!(changes.next_step_due_date, None);
        assert_eq!(changes.employer_feedback.as_deref(), Some("Good"));
    }

    #[test]
    fn due_dates_compare_after_parsing() {
        let mut r = remote();
        r.next_step_due_date = Some("2024-03-01T00:00:00.000+0000".into());
        assert!(SnapshotDiffer::default().diff(&r, &local()).is_empty());
        r.next_step_due_date = Some("2024-04-02".into());
        assert_eq!(
            SnapshotDiffer::default().diff(&r, &local()).next_step_due_date,
            NaiveDate::from_ymd_opt(2024, 4, 2)
        );
    }

    #[test]
    fn closed_flag_requires_closed_stage() {
        let mut r = remote();
        r.is_closed = true;
        let changes = SnapshotDiffer::default().diff(&r, &local());
        assert_eq!(changes.closed, None);

        r.stage_name = Some("No job offer".into());
        let changes = SnapshotDiffer::default().diff(&r, &local());
        assert_eq!(changes.stage, Some(Stage::NoJobOffer));
        assert_eq!(changes.closed, Some(true));
        assert_eq!(changes.won, None);
    }

    #[test]
    fn reopened_stage_clears_closed_flags() {
        let mut l = local();
        l.stage = Stage::DurableSolution;
        l.closed = true;
        l.won = true;
        let mut r = remote();
        r.is_closed = true;
        r.is_won = true;
        let changes = SnapshotDiffer::default().diff(&r, &l);
        assert_eq!(changes.stage, Some(Stage::CvReview));
        assert_eq!(changes.closed, Some(false));
        assert_eq!(changes.won, Some(false));

        changes.apply_to(&mut l);
        assert_eq!(l.stage, Stage::CvReview);
        assert!(!l.closed);
        assert!(!l.won);
    }

    #[test]
    fn closed_record_moved_to_open_stage_is_reopened() {
        let mut l = local();
        l.stage = Stage::NoJobOffer;
        l.closed = true;
        let mut r = remote();
        r.is_closed = true;
        let changes = SnapshotDiffer::default().diff(&r, &l);
        changes.apply_to(&mut l);
        assert_eq!(l.stage, Stage::CvReview);
        assert!(!l.closed, "closed flag must follow the open stage");
    }

    #[test]
    fn apply_tracks_last_active_stage_and_transition() {
        let mut r = remote();
        r.stage_name = Some("Offer".into());
        let mut l = local();
        let changes = SnapshotDiffer::default().diff(&r, &l);
        let t = changes.apply_to(&mut l).unwrap();
        assert_eq!((t.from, t.to), (Stage::CvReview, Stage::Offer));
        assert_eq!(l.last_active_stage, Some(Stage::Offer));

        let mut r = remote();
        r.stage_name = Some("No visa".into());
        r.is_closed = true;
        let changes = SnapshotDiffer::default().diff(&r, &l);
        changes.apply_to(&mut l);
        assert_eq!(l.stage, Stage::NoVisa);
        assert!(l.closed);
        assert_eq!(l.last_active_stage, Some(Stage::Offer));
    }

    #[test]
    fn empty_change_set_leaves_updated_at_alone() {
        let mut l = local();
        let before = l.updated_at;
        assert_eq!(ChangeSet::default().apply_to(&mut l), None);
        assert_eq!(l.updated_at, before);
    }

    #[test]
    fn fields_lists_populated_entries() {
        let changes = ChangeSet {
            name: Some("x".into()),
            stage: Some(Stage::Offer),
            ..Default::default()
        };
        assert_eq!(changes.fields(), vec!["name", "stage"]);
    }
}
