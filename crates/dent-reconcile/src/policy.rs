//! Stage policy: which deal stage an incoming appointment status maps to.

use dent_model::{AppointmentStatus, StageMap};

/// Outcome of the policy: write this stage, or leave the current one alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageDecision {
    Set(String),
    Preserve,
}

/// Map an incoming appointment status onto a deal stage.
///
/// `current` is the deal's stage when known (freshly created deals and
/// deals the CRM returned without a stage count as unknown).
///
/// `Completed` deliberately **preserves** the current stage: "done but
/// unpaid" must not pull a deal back to treatment when a human has already
/// advanced it to an invoice stage. Only when the current stage is unknown
/// does `Completed` fall back to the treatment stage.
pub fn decide(
    stages: &StageMap,
    current: Option<&str>,
    incoming: AppointmentStatus,
) -> StageDecision {
    use AppointmentStatus::*;
    match incoming {
        Planned => StageDecision::Set(stages.new.clone()),
        PatientArrived => StageDecision::Set(stages.contact_made.clone()),
        InProgress => StageDecision::Set(stages.treatment.clone()),
        Completed => match current {
            Some(_) => StageDecision::Preserve,
            None => StageDecision::Set(stages.treatment.clone()),
        },
        CompletedWithInvoice => StageDecision::Set(stages.won.clone()),
        Cancelled => StageDecision::Set(stages.lose.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stages() -> StageMap {
        StageMap::default()
    }

    #[test]
    fn fixed_mappings() {
        let s = stages();
        assert_eq!(
            decide(&s, None, AppointmentStatus::Planned),
            StageDecision::Set("NEW".to_string())
        );
        assert_eq!(
            decide(&s, Some("NEW"), AppointmentStatus::PatientArrived),
            StageDecision::Set("CONTACT_MADE".to_string())
        );
        assert_eq!(
            decide(&s, Some("CONTACT_MADE"), AppointmentStatus::InProgress),
            StageDecision::Set("TREATMENT".to_string())
        );
        assert_eq!(
            decide(&s, Some("TREATMENT"), AppointmentStatus::CompletedWithInvoice),
            StageDecision::Set("WON".to_string())
        );
        assert_eq!(
            decide(&s, Some("TREATMENT"), AppointmentStatus::Cancelled),
            StageDecision::Set("LOSE".to_string())
        );
    }

    #[test]
    fn completed_preserves_known_stage() {
        let s = stages();
        // The manually-advanced case this rule exists for.
        assert_eq!(
            decide(&s, Some("PREPAYMENT_INVOICE"), AppointmentStatus::Completed),
            StageDecision::Preserve
        );
        assert_eq!(
            decide(&s, Some("TREATMENT"), AppointmentStatus::Completed),
            StageDecision::Preserve
        );
    }

    #[test]
    fn completed_with_unknown_stage_falls_back_to_treatment() {
        assert_eq!(
            decide(&stages(), None, AppointmentStatus::Completed),
            StageDecision::Set("TREATMENT".to_string())
        );
    }

    #[test]
    fn renamed_stage_ids_flow_through() {
        let s = StageMap {
            lose: "C1:LOSE".to_string(),
            ..Default::default()
        };
        assert_eq!(
            decide(&s, Some("TREATMENT"), AppointmentStatus::Cancelled),
            StageDecision::Set("C1:LOSE".to_string())
        );
    }
}
