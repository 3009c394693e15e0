//! dent-reconcile
//!
//! The decision core of the bridge: given a canonical record, locate the
//! CRM entities it belongs to, create what is missing, and update what is
//! permitted — without ever overwriting a stage a human owns.
//!
//! The engine talks to the CRM through the object-safe [`CrmPort`] trait,
//! so every decision path is testable against an in-memory fake; the
//! production implementation is the `dent-crm` client.

mod engine;
pub mod policy;
mod port;

pub use engine::{ReconcileError, ReconcileOutcome, Reconciler};
pub use policy::{decide, StageDecision};
pub use port::CrmPort;
