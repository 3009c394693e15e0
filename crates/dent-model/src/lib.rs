//! dent-model
//!
//! Domain types shared by every crate of the sync core: the source-side
//! appointment row, the canonical CRM-bound record produced by the pure
//! transformer, the external-id join key, and the opaque stage map.
//!
//! This crate performs no IO. Everything here is deterministic and unit
//! testable without a database or an HTTP server.

pub mod appointment;
pub mod canonical;
pub mod clock;
pub mod external_id;
pub mod stages;

pub use appointment::{Appointment, AppointmentStatus, ChangeMarkers, TreatmentPlanLine};
pub use canonical::{transform, CanonicalRecord, DataQualityError};
pub use clock::{Clock, FixedClock, SystemClock};
pub use external_id::ExternalId;
pub use stages::StageMap;
