//! Opaque CRM stage identifiers and the protected/final classification.
//!
//! Stage ids are **configuration**, not code: a CRM admin can rename any
//! of them without a recompile. The sync core only ever asks two
//! questions — is this stage final, is it protected — and maps logical
//! statuses onto whatever ids the config binds.

use serde::{Deserialize, Serialize};

/// Logical stage slots bound to concrete CRM stage ids via configuration.
///
/// Final = `won` ∪ `lose`. Protected = final ∪ {`prepayment_invoice`,
/// `final_invoice`, `executing`, `apology`} ∪ `extra_protected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageMap {
    pub new: String,
    pub contact_made: String,
    pub treatment: String,
    pub completed_unpaid: String,
    pub won: String,
    pub lose: String,
    pub prepayment_invoice: String,
    pub final_invoice: String,
    pub executing: String,
    pub apology: String,
    /// Additional CRM-admin-declared protected stage ids.
    pub extra_protected: Vec<String>,
}

impl Default for StageMap {
    fn default() -> Self {
        Self {
            new: "NEW".to_string(),
            contact_made: "CONTACT_MADE".to_string(),
            treatment: "TREATMENT".to_string(),
            completed_unpaid: "COMPLETED_UNPAID".to_string(),
            won: "WON".to_string(),
            lose: "LOSE".to_string(),
            prepayment_invoice: "PREPAYMENT_INVOICE".to_string(),
            final_invoice: "FINAL_INVOICE".to_string(),
            executing: "EXECUTING".to_string(),
            apology: "APOLOGY".to_string(),
            extra_protected: Vec::new(),
        }
    }
}

impl StageMap {
    /// `true` for stages no sync update may ever leave: WON and LOSE.
    pub fn is_final(&self, stage: &str) -> bool {
        stage == self.won || stage == self.lose
    }

    /// `true` for stages whose value a human owns. Includes all finals.
    pub fn is_protected(&self, stage: &str) -> bool {
        self.is_final(stage)
            || stage == self.prepayment_invoice
            || stage == self.final_invoice
            || stage == self.executing
            || stage == self.apology
            || self.extra_protected.iter().any(|s| s == stage)
    }
}
