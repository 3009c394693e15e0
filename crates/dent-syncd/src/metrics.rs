//! Per-cycle counters, emitted as one structured log line per cycle.

use std::time::Duration;

use tracing::info;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleMetrics {
    /// Records the reader yielded this cycle.
    pub attempted: usize,
    /// Records reflected in the CRM (includes adopted and converted).
    pub succeeded: usize,
    /// Records deferred to the retry queue.
    pub enqueued: usize,
    /// Enqueues rejected because the queue was at capacity.
    pub enqueue_rejected: usize,
    /// Rows the transformer dropped.
    pub data_quality_dropped: usize,
    /// Records skipped on auto-bind ambiguity.
    pub skipped_ambiguous: usize,
    /// Retry-queue items that succeeded this cycle.
    pub retried_succeeded: usize,
    /// Retry-queue items that failed again.
    pub retried_failed: usize,
    /// Queue depth at cycle end.
    pub queue_depth: usize,
    /// Plan projections actually written.
    pub plans_applied: usize,
    pub(crate) reconcile_latency_total: Duration,
    pub(crate) reconcile_latency_samples: u32,
}

impl CycleMetrics {
    pub(crate) fn observe_latency(&mut self, elapsed: Duration) {
        self.reconcile_latency_total += elapsed;
        self.reconcile_latency_samples += 1;
    }

    /// A batched reconcile spends one wall-clock span over many records.
    pub(crate) fn observe_batch(&mut self, elapsed: Duration, records: u32) {
        self.reconcile_latency_total += elapsed;
        self.reconcile_latency_samples += records;
    }

    pub fn avg_reconcile_latency(&self) -> Duration {
        if self.reconcile_latency_samples == 0 {
            Duration::ZERO
        } else {
            self.reconcile_latency_total / self.reconcile_latency_samples
        }
    }

    pub fn emit(&self) {
        info!(
            attempted = self.attempted,
            succeeded = self.succeeded,
            enqueued = self.enqueued,
            enqueue_rejected = self.enqueue_rejected,
            data_quality_dropped = self.data_quality_dropped,
            skipped_ambiguous = self.skipped_ambiguous,
            retried_succeeded = self.retried_succeeded,
            retried_failed = self.retried_failed,
            queue_depth = self.queue_depth,
            plans_applied = self.plans_applied,
            avg_reconcile_latency_ms = self.avg_reconcile_latency().as_millis() as u64,
            "cycle complete"
        );
    }
}
