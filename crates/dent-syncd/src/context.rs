//! Explicit wiring record.
//!
//! Nothing in this workspace reaches for process-wide singletons; the
//! scheduler receives everything it touches — configuration, clock, the
//! source boundary, the CRM port, and the plan writer — through this one
//! record. The clock is injectable so throttle, backoff, and watermark
//! behavior is deterministic under test.

use std::sync::Arc;

use dent_config::SyncSettings;
use dent_model::Clock;
use dent_plans::PlanWriter;
use dent_reconcile::CrmPort;
use dent_source::AppointmentSource;

pub struct SyncContext {
    pub settings: SyncSettings,
    pub clock: Arc<dyn Clock>,
    pub source: Arc<dyn AppointmentSource>,
    pub crm: Arc<dyn CrmPort>,
    pub plan_writer: Arc<dyn PlanWriter>,
}
