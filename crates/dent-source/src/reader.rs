//! The source boundary trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use dent_model::{Appointment, ExternalId, TreatmentPlanLine};

use crate::SourceError;

/// A fallible, lazily produced sequence of appointments.
pub type AppointmentStream<'a> = BoxStream<'a, Result<Appointment, SourceError>>;

/// Contract for reading changed appointments and their treatment plans.
///
/// Implementations must be object-safe; the scheduler holds an
/// `Arc<dyn AppointmentSource>` so tests can substitute an in-memory fake.
#[async_trait]
pub trait AppointmentSource: Send + Sync {
    /// Stream appointments whose change envelope intersects
    /// `[watermark, now]`, ascending by maximum change marker.
    ///
    /// The comparison against the watermark is inclusive (`>=`): a row
    /// that landed at exactly the stored instant must not be skipped.
    fn read_since(&self, watermark: DateTime<Utc>) -> AppointmentStream<'_>;

    /// Treatment-plan lines for one appointment. Projector only.
    async fn read_plan_lines(
        &self,
        external_id: &ExternalId,
    ) -> Result<Vec<TreatmentPlanLine>, SourceError>;

    /// Startup liveness probe.
    async fn ping(&self) -> bool;
}
