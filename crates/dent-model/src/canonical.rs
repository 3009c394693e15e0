//! Pure transformation of a source [`Appointment`] into the canonical
//! CRM-bound record.
//!
//! # Invariants
//!
//! - `external_id` is always non-empty (rendered, never read from the row).
//! - `patient_phone` is either empty or `+` followed by digits only.
//! - `source_timestamps_max` is the row's maximum change marker; rows with
//!   no markers are rejected outright.
//!
//! Failures here are data-quality failures: retrying cannot change the
//! input, so they are counted by the scheduler and dropped — never queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::appointment::{Appointment, AppointmentStatus};
use crate::external_id::ExternalId;

/// Phones that normalize to fewer digits than this are treated as absent,
/// which in turn disables all phone-based reconciliation paths.
pub const MIN_PHONE_DIGITS: usize = 10;

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// The transformer's output: everything the reconciler needs, nothing it
/// does not. Serializable because retry-queue items snapshot it to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub external_id: ExternalId,
    pub patient_full_name: String,
    /// Empty, or `+` followed by digits.
    pub patient_phone: String,
    pub doctor_name: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub services_summary: String,
    pub total_amount: Option<f64>,
    pub target_status: AppointmentStatus,
    /// The row's maximum change marker; the cycle's watermark candidate.
    pub source_timestamps_max: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Data-quality error
// ---------------------------------------------------------------------------

/// Why a row was rejected by the transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQualityError {
    /// Patient name is empty or whitespace.
    EmptyPatientName { row_id: i64 },
    /// None of the six change markers is set.
    NoChangeMarkers { row_id: i64 },
}

impl std::fmt::Display for DataQualityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPatientName { row_id } => {
                write!(f, "row {row_id}: empty patient name")
            }
            Self::NoChangeMarkers { row_id } => {
                write!(f, "row {row_id}: no change markers set")
            }
        }
    }
}

impl std::error::Error for DataQualityError {}

// ---------------------------------------------------------------------------
// Phone normalization
// ---------------------------------------------------------------------------

/// Normalize a raw clinic phone to `+` digits-only.
///
/// - Strips every non-digit character.
/// - An 11-digit number with the national `8` trunk prefix becomes `7…`.
/// - Anything shorter than [`MIN_PHONE_DIGITS`] collapses to the empty
///   string, which downstream means "no phone".
pub fn normalize_phone(raw: &str) -> String {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('8') {
        digits.replace_range(0..1, "7");
    }
    if digits.len() < MIN_PHONE_DIGITS {
        return String::new();
    }
    format!("+{digits}")
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// Convert an appointment row into a [`CanonicalRecord`].
pub fn transform(appt: &Appointment) -> Result<CanonicalRecord, DataQualityError> {
    let name = appt.patient_name.trim();
    if name.is_empty() {
        return Err(DataQualityError::EmptyPatientName {
            row_id: appt.row_id,
        });
    }

    let source_timestamps_max = appt
        .markers
        .max()
        .ok_or(DataQualityError::NoChangeMarkers {
            row_id: appt.row_id,
        })?;

    Ok(CanonicalRecord {
        external_id: ExternalId::new(appt.filial_id, appt.row_id),
        patient_full_name: name.to_string(),
        patient_phone: normalize_phone(&appt.patient_phone),
        doctor_name: appt.doctor_name.trim().to_string(),
        planned_start: appt.planned_start,
        services_summary: appt.services.clone().unwrap_or_default(),
        total_amount: appt.total_amount,
        target_status: appt.status,
        source_timestamps_max,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
