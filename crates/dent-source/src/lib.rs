//! dent-source
//!
//! Read-only access to the clinic appointment database. The boundary is
//! the [`AppointmentSource`] trait: the scheduler and tests hold a
//! `Box<dyn AppointmentSource>` / `Arc<dyn AppointmentSource>` and never
//! see sqlx types.
//!
//! `read_since` must stream — memory does not scale with row count — and
//! must yield rows in ascending order of their maximum change marker, so
//! that a partially completed cycle can still advance the watermark to the
//! last processed row safely.

mod error;
mod postgres;
mod reader;

pub use error::SourceError;
pub use postgres::PgAppointmentSource;
pub use reader::{AppointmentSource, AppointmentStream};
