//! dent-store
//!
//! Durable single-writer state of the sync core: the watermark file, the
//! retry queue, and the plan-projection cache. All writes go through the
//! same temp-file-and-rename path, so an interrupted write never corrupts
//! the live file; concurrent diagnostic readers at worst see the previous
//! generation.
//!
//! Corruption policy differs per store: watermark and queue are the only
//! record of deferred work, so an unreadable file is fatal
//! ([`StoreError::Corrupt`], exit code 2 upstream); the plan cache is
//! rebuildable and merely costs one redundant CRM update per entry, so a
//! corrupt cache is a warning and a fresh start.

mod atomic;
mod error;
pub mod plan_cache;
pub mod queue;
pub mod watermark;

pub use error::StoreError;
pub use plan_cache::{PlanCache, PlanCacheEntry};
pub use queue::{QueueItem, QueuePolicy, RetryQueue};
pub use watermark::WatermarkStore;
