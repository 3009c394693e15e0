//! dent-syncd
//!
//! The daemon: wires configuration, stores, the CRM client, the source
//! reader, the reconciler, and the plan projector into the cycle loop.
//! `main.rs` is intentionally thin; everything testable lives here.

pub mod context;
pub mod metrics;
pub mod scheduler;

pub use context::SyncContext;
pub use metrics::CycleMetrics;
pub use scheduler::Scheduler;
