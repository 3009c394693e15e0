//! dent-plans
//!
//! Projects an appointment's treatment plan into the CRM's plan field.
//! The projector is deliberately cheap to call: rendering is deterministic
//! and hashed, so unchanged plans cost no CRM traffic, and changed plans
//! are throttled to at most one update per appointment per window. Its
//! errors never reach the reconciliation path; callers log them as
//! warnings and move on.

mod projector;
mod render;

pub use projector::{PlanError, PlanProjector, PlanWriter, ProjectOutcome};
pub use render::{plan_hash, render_plan};
