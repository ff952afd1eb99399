//! Ordered opportunity stages and the side effects gated on moving between them.
//!
//! Declaration order is the stage order: every comparison here goes through
//! [`Stage::ordinal`], never through names.
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::model::CandidateStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Prospect,
    MiniIntake,
    FullIntake,
    VisaEligibility,
    CvPreparation,
    CvReview,
    OneWayPreparation,
    OneWayReview,
    TestPreparation,
    Testing,
    TwoWayPreparation,
    TwoWayReview,
    Offer,
    Acceptance,
    ProvincialVisaPreparation,
    ProvincialVisaProcessing,
    VisaPreparation,
    VisaProcessing,
    Relocating,
    Relocated,
    Settled,
    DurableSolution,
    NoJobOffer,
    NoVisa,
    NotFitForRole,
    NotEligibleForVisa,
    NoInterview,
    CandidateRejectsOffer,
    CandidateWithdraws,
    CandidateMistakenProspect,
    NotEligibleForTc,
    RelocatedNoJobOfferPathway,
    JobWithdrawn,
    JobIneligible,
}

impl Stage {
    pub const ALL: [Stage; 34] = [
        Stage::Prospect,
        Stage::MiniIntake,
        Stage::FullIntake,
        Stage::VisaEligibility,
        Stage::CvPreparation,
        Stage::CvReview,
        Stage::OneWayPreparation,
        Stage::OneWayReview,
        Stage::TestPreparation,
        Stage::Testing,
        Stage::TwoWayPreparation,
        Stage::TwoWayReview,
        Stage::Offer,
        Stage::Acceptance,
        Stage::ProvincialVisaPreparation,
        Stage::ProvincialVisaProcessing,
        Stage::VisaPreparation,
        Stage::VisaProcessing,
        Stage::Relocating,
        Stage::Relocated,
        Stage::Settled,
        Stage::DurableSolution,
        Stage::NoJobOffer,
        Stage::NoVisa,
        Stage::NotFitForRole,
        Stage::NotEligibleForVisa,
        Stage::NoInterview,
        Stage::CandidateRejectsOffer,
        Stage::CandidateWithdraws,
        Stage::CandidateMistakenProspect,
        Stage::NotEligibleForTc,
        Stage::RelocatedNoJobOfferPathway,
        Stage::JobWithdrawn,
        Stage::JobIneligible,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Key used for local storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prospect => "prospect",
            Stage::MiniIntake => "miniIntake",
            Stage::FullIntake => "fullIntake",
            Stage::VisaEligibility => "visaEligibility",
            Stage::CvPreparation => "cvPreparation",
            Stage::CvReview => "cvReview",
            Stage::OneWayPreparation => "oneWayPreparation",
            Stage::OneWayReview => "oneWayReview",
            Stage::TestPreparation => "testPreparation",
            Stage::Testing => "testing",
            Stage::TwoWayPreparation => "twoWayPreparation",
            Stage::TwoWayReview => "twoWayReview",
            Stage::Offer => "offer",
            Stage::Acceptance => "acceptance",
            Stage::ProvincialVisaPreparation => "provincialVisaPreparation",
            Stage::ProvincialVisaProcessing => "provincialVisaProcessing",
            Stage::VisaPreparation => "visaPreparation",
            Stage::VisaProcessing => "visaProcessing",
            Stage::Relocating => "relocating",
            Stage::Relocated => "relocated",
            Stage::Settled => "settled",
            Stage::DurableSolution => "durableSolution",
            Stage::NoJobOffer => "noJobOffer",
            Stage::NoVisa => "noVisa",
            Stage::NotFitForRole => "notFitForRole",
            Stage::NotEligibleForVisa => "notEligibleForVisa",
            Stage::NoInterview => "noInterview",
            Stage::CandidateRejectsOffer => "candidateRejectsOffer",
            Stage::CandidateWithdraws => "candidateWithdraws",
            Stage::CandidateMistakenProspect => "candidateMistakenProspect",
            Stage::NotEligibleForTc => "notEligibleForTC",
            Stage::RelocatedNoJobOfferPathway => "relocatedNoJobOfferPathway",
            Stage::JobWithdrawn => "jobWithdrawn",
            Stage::JobIneligible => "jobIneligible",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }

    /// Stage name as the CRM spells it.
    pub fn crm_name(&self) -> &'static str {
        match self {
            Stage::Prospect => "Prospect",
            Stage::MiniIntake => "Mini intake",
            Stage::FullIntake => "Full intake",
            Stage::VisaEligibility => "Visa eligibility",
            Stage::CvPreparation => "CV preparation",
            Stage::CvReview => "CV review",
            Stage::OneWayPreparation => "1 way preparation",
            Stage::OneWayReview => "1 way review",
            Stage::TestPreparation => "Test preparation",
            Stage::Testing => "Testing",
            Stage::TwoWayPreparation => "2 way preparation",
            Stage::TwoWayReview => "2 way review",
            Stage::Offer => "Offer",
            Stage::Acceptance => "Acceptance",
            Stage::ProvincialVisaPreparation => "Provincial visa preparation",
            Stage::ProvincialVisaProcessing => "Provincial visa processing",
            Stage::VisaPreparation => "Visa preparation",
            Stage::VisaProcessing => "Visa processing",
            Stage::Relocating => "Relocating",
            Stage::Relocated => "Relocated",
            Stage::Settled => "Settled",
            Stage::DurableSolution => "Durable solution",
            Stage::NoJobOffer => "No job offer",
            Stage::NoVisa => "No visa",
            Stage::NotFitForRole => "Not fit for role",
            Stage::NotEligibleForVisa => "Not eligible for visa",
            Stage::NoInterview => "No interview",
            Stage::CandidateRejectsOffer => "Candidate rejects offer",
            Stage::CandidateWithdraws => "Candidate withdraws",
            Stage::CandidateMistakenProspect => "Candidate was mistakenly added as prospect",
            Stage::NotEligibleForTc => "Not eligible for TC",
            Stage::RelocatedNoJobOfferPathway => "Relocated (no job offer pathway)",
            Stage::JobWithdrawn => "Job withdrawn",
            Stage::JobIneligible => "Job ineligible",
        }
    }

    /// Maps a free-text CRM stage name onto a stage. Matching ignores case and
    /// surrounding whitespace; anything else unknown yields `None`.
    pub fn from_crm_name(name: &str) -> Option<Self> {
        CRM_NAMES.get(name.trim().to_lowercase().as_str()).copied()
    }

    pub fn is_closed(&self) -> bool {
        *self >= Stage::DurableSolution
    }

    pub fn is_won(&self) -> bool {
        *self == Stage::DurableSolution
    }

    pub fn is_closed_lost(&self) -> bool {
        self.is_closed() && !self.is_won()
    }

    /// The candidate has accepted an offer and the case is still alive (or won).
    pub fn is_employed(&self) -> bool {
        *self > Stage::Acceptance && !self.is_closed_lost()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.crm_name())
    }
}

static CRM_NAMES: Lazy<HashMap<String, Stage>> = Lazy::new(|| {
    Stage::ALL
        .iter()
        .map(|stage| (stage.crm_name().to_lowercase(), *stage))
        .collect()
});

/// Side effect selected for a stage change. Variants are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEffect {
    Closed,
    Accepted,
    StageChanged,
    None,
}

/// Which chats should hear about a stage change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Audience {
    pub job_creator: bool,
    pub recruiting: bool,
    pub candidate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
}

impl StageTransition {
    pub fn new(from: Stage, to: Stage) -> Self {
        Self { from, to }
    }

    pub fn is_change(&self) -> bool {
        self.from != self.to
    }

    pub fn is_forward(&self) -> bool {
        self.to.ordinal() > self.from.ordinal()
    }

    /// Forward move into or past `Relocated` that is not a move to a lost stage.
    pub fn reaches_relocation(&self) -> bool {
        self.is_forward()
            && self.to.ordinal() >= Stage::Relocated.ordinal()
            && !self.to.is_closed_lost()
    }

    pub fn effect(&self) -> StageEffect {
        if !self.is_change() {
            StageEffect::None
        } else if self.to.is_closed() {
            StageEffect::Closed
        } else if self.to == Stage::Acceptance {
            StageEffect::Accepted
        } else if self.is_forward() {
            StageEffect::StageChanged
        } else {
            StageEffect::None
        }
    }

    pub fn audience(&self, all_notifications: bool) -> Audience {
        match self.effect() {
            StageEffect::Closed => Audience {
                job_creator: true,
                recruiting: true,
                candidate: self.from != Stage::Prospect,
            },
            StageEffect::Accepted => Audience {
                job_creator: true,
                recruiting: true,
                candidate: true,
            },
            StageEffect::StageChanged => {
                let last_excluded = if all_notifications {
                    Stage::Prospect
                } else {
                    Stage::CvReview
                };
                Audience {
                    job_creator: true,
                    recruiting: false,
                    candidate: self.to.ordinal() > last_excluded.ordinal(),
                }
            }
            StageEffect::None => Audience::default(),
        }
    }
}

/// Candidate status implied by reaching `stage`, if it differs from `current`.
pub fn auto_status(stage: Stage, current: CandidateStatus) -> Option<CandidateStatus> {
    let wanted = if stage.is_employed() {
        CandidateStatus::Employed
    } else if stage == Stage::NotEligibleForTc {
        CandidateStatus::Ineligible
    } else if stage == Stage::RelocatedNoJobOfferPathway {
        CandidateStatus::Withdrawn
    } else {
        return None;
    };
    (wanted != current).then_some(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_follow_declaration_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal(), i);
        }
        assert!(Stage::Prospect < Stage::CvReview);
        assert!(Stage::Relocating < Stage::Relocated);
    }

    #[test]
    fn storage_keys_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::parse_stage(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse_stage("bogus"), None);
    }

    #[test]
    fn crm_names_are_case_and_space_insensitive() {
        assert_eq!(Stage::from_crm_name("CV review"), Some(Stage::CvReview));
        assert_eq!(Stage::from_crm_name("  cv REVIEW "), Some(Stage::CvReview));
        assert_eq!(Stage::from_crm_name("Nonexistent Stage"), None);
        assert_eq!(Stage::from_crm_name(""), None);
    }

    #[test]
    fn closed_and_won_predicates() {
        assert!(!Stage::Relocated.is_closed());
        assert!(Stage::DurableSolution.is_closed());
        assert!(Stage::DurableSolution.is_won());
        assert!(Stage::NoJobOffer.is_closed_lost());
        assert!(Stage::JobIneligible.is_closed_lost());
        assert!(!Stage::Offer.is_employed());
        assert!(Stage::VisaPreparation.is_employed());
        assert!(!Stage::CandidateWithdraws.is_employed());
    }

    #[test]
    fn closing_always_takes_closed_path() {
        for from in Stage::ALL {
            for to in Stage::ALL.into_iter().filter(|s| s.is_closed() && *s != from) {
                let t = StageTransition::new(from, to);
                assert_eq!(t.effect(), StageEffect::Closed, "{from:?} -> {to:?}");
                assert!(!t.audience(true).candidate || from != Stage::Prospect);
            }
        }
    }

    #[test]
    fn prospect_to_acceptance_notifies_everyone() {
        let t = StageTransition::new(Stage::Prospect, Stage::Acceptance);
        assert_eq!(t.effect(), StageEffect::Accepted);
        assert_eq!(
            t.audience(false),
            Audience {
                job_creator: true,
                recruiting: true,
                candidate: true
            }
        );
    }

    #[test]
    fn closing_from_prospect_skips_candidate_chat() {
        let t = StageTransition::new(Stage::Prospect, Stage::NoInterview);
        let audience = t.audience(true);
        assert!(audience.job_creator && audience.recruiting);
        assert!(!audience.candidate);

        let t = StageTransition::new(Stage::CvReview, Stage::NoInterview);
        assert!(t.audience(false).candidate);
    }

    #[test]
    fn stage_change_candidate_gate_depends_on_opt_in() {
        let early = StageTransition::new(Stage::Prospect, Stage::MiniIntake);
        assert_eq!(early.effect(), StageEffect::StageChanged);
        assert!(early.audience(true).candidate);
        assert!(!early.audience(false).candidate);
        assert!(!early.audience(false).recruiting);

        let later = StageTransition::new(Stage::CvReview, Stage::OneWayPreparation);
        assert!(later.audience(false).candidate);
    }

    #[test]
    fn backward_and_no_op_moves_are_silent() {
        assert_eq!(
            StageTransition::new(Stage::Offer, Stage::CvReview).effect(),
            StageEffect::None
        );
        assert_eq!(
            StageTransition::new(Stage::Offer, Stage::Offer).effect(),
            StageEffect::None
        );
    }

    #[test]
    fn relocation_uses_ordering_and_excludes_lost_stages() {
        assert!(StageTransition::new(Stage::CvReview, Stage::Relocated).reaches_relocation());
        assert!(StageTransition::new(Stage::Relocating, Stage::Settled).reaches_relocation());
        assert!(
            StageTransition::new(Stage::Relocated, Stage::DurableSolution).reaches_relocation()
        );
        assert!(!StageTransition::new(Stage::CvReview, Stage::NoVisa).reaches_relocation());
        assert!(!StageTransition::new(Stage::CvReview, Stage::Relocating).reaches_relocation());
        assert!(!StageTransition::new(Stage::Settled, Stage::Relocated).reaches_relocation());
    }

    #[test]
    fn auto_status_rules() {
        assert_eq!(
            auto_status(Stage::VisaProcessing, CandidateStatus::Active),
            Some(CandidateStatus::Employed)
        );
        assert_eq!(
            auto_status(Stage::VisaProcessing, CandidateStatus::Employed),
            None
        );
        assert_eq!(
            auto_status(Stage::NotEligibleForTc, CandidateStatus::Active),
            Some(CandidateStatus::Ineligible)
        );
        assert_eq!(
            auto_status(Stage::RelocatedNoJobOfferPathway, CandidateStatus::Active),
            Some(CandidateStatus::Withdrawn)
        );
        assert_eq!(auto_status(Stage::CvReview, CandidateStatus::Active), None);
    }
}
