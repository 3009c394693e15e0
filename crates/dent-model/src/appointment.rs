//! Source-side appointment row and its change-signal markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status enumeration
// ---------------------------------------------------------------------------

/// Appointment lifecycle status as recorded by the clinic database.
///
/// The numeric codes are the source schema's own; [`AppointmentStatus::from_code`]
/// is the single place they are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Planned,
    PatientArrived,
    InProgress,
    Completed,
    CompletedWithInvoice,
    Cancelled,
}

impl AppointmentStatus {
    /// Map a raw source status code to the enumeration.
    ///
    /// Returns `None` for codes the bridge does not sync (e.g. drafts).
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Planned),
            1 => Some(Self::PatientArrived),
            2 => Some(Self::InProgress),
            3 => Some(Self::Completed),
            4 => Some(Self::CompletedWithInvoice),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::PatientArrived => "patient_arrived",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::CompletedWithInvoice => "completed_with_invoice",
            Self::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Change markers
// ---------------------------------------------------------------------------

/// The six temporal markers the reader uses as the change signal.
///
/// A row is considered changed since a watermark when **any** marker is
/// ≥ the watermark; the row's position in the cycle is its **maximum**
/// marker, so a partially processed cycle can advance the watermark to the
/// last success without skipping rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMarkers {
    pub added_at: Option<DateTime<Utc>>,
    pub changed_at: Option<DateTime<Utc>>,
    pub patient_arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ChangeMarkers {
    /// Maximum of the six markers, ignoring `None`s.
    ///
    /// `None` means the row carries no usable change signal at all; the
    /// transformer rejects such rows as a data-quality failure.
    pub fn max(&self) -> Option<DateTime<Utc>> {
        [
            self.added_at,
            self.changed_at,
            self.patient_arrived_at,
            self.started_at,
            self.ended_at,
            self.cancelled_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

// ---------------------------------------------------------------------------
// Appointment
// ---------------------------------------------------------------------------

/// One appointment row as read from the clinic database.
///
/// Identity is `(filial_id, row_id)`; the CRM-facing join key is rendered
/// by [`crate::ExternalId`]. The services summary and total amount are
/// computed by the reader in the same projection as the row itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Appointment {
    pub filial_id: u8,
    pub row_id: i64,
    pub patient_name: String,
    /// Raw phone as stored by the clinic; normalized by the transformer.
    pub patient_phone: String,
    pub doctor_name: String,
    pub planned_start: Option<DateTime<Utc>>,
    pub status: AppointmentStatus,
    /// Aggregated service description (already joined by the reader).
    pub services: Option<String>,
    pub total_amount: Option<f64>,
    pub markers: ChangeMarkers,
}

// ---------------------------------------------------------------------------
// Treatment plan line
// ---------------------------------------------------------------------------

/// A single service or good on an appointment's treatment plan.
///
/// Consumed only by the plan projector; read-only per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlanLine {
    pub line_id: i64,
    pub name: String,
    pub count: u32,
    pub unit_price: f64,
    pub discount: f64,
}

impl TreatmentPlanLine {
    /// Line total: `unit_price * count - discount`.
    pub fn total(&self) -> f64 {
        self.unit_price * f64::from(self.count) - self.discount
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(s, 0).unwrap()
    }

    #[test]
    fn markers_max_picks_latest() {
        let m = ChangeMarkers {
            added_at: Some(ts(100)),
            changed_at: Some(ts(500)),
            ended_at: Some(ts(300)),
            ..Default::default()
        };
        assert_eq!(m.max(), Some(ts(500)));
    }

    #[test]
    fn markers_max_none_when_empty() {
        assert_eq!(ChangeMarkers::default().max(), None);
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=5 {
            let st = AppointmentStatus::from_code(code).unwrap();
            assert!(!st.as_str().is_empty());
        }
        assert_eq!(AppointmentStatus::from_code(42), None);
    }

    #[test]
    fn plan_line_total_subtracts_discount() {
        let line = TreatmentPlanLine {
            line_id: 1,
            name: "Filling".to_string(),
            count: 2,
            unit_price: 1500.0,
            discount: 500.0,
        };
        assert_eq!(line.total(), 2500.0);
    }
}
