//! The cycle loop.
//!
//! Each cycle: drain due retry items first, stream the reader in
//! `batch_size` chunks through transform + reconcile, advance the
//! watermark over the successes, then fire the plan projector for every
//! record that now has a deal.
//!
//! # Watermark discipline
//!
//! The candidate watermark is the maximum `source_timestamps_max` over the
//! cycle's processed records. Failed records do not block it — they are
//! durably remembered by the retry queue — and a source failure aborts the
//! cycle with the watermark untouched. The persisted value therefore never
//! moves backwards and never skips a row that is not either reflected in
//! the CRM or sitting in the queue.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use tracing::{error, info, warn};

use dent_model::{transform, CanonicalRecord, ExternalId};
use dent_plans::{PlanProjector, ProjectOutcome};
use dent_reconcile::{ReconcileOutcome, Reconciler};
use dent_store::{PlanCache, QueuePolicy, RetryQueue, StoreError, WatermarkStore};

use crate::{CycleMetrics, SyncContext};

// ---------------------------------------------------------------------------
// Init error
// ---------------------------------------------------------------------------

/// Startup failure, split by exit-code class: unreadable persistent state
/// is exit 2, configuration trouble exit 1.
#[derive(Debug)]
pub enum InitError {
    Storage(StoreError),
    Config(String),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Storage(e) => write!(f, "persistent state unusable: {e}"),
            InitError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for InitError {}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    ctx: SyncContext,
    reconciler: Reconciler,
    watermark_store: WatermarkStore,
    watermark: DateTime<Utc>,
    queue: RetryQueue,
    projector: PlanProjector,
}

impl Scheduler {
    pub fn new(ctx: SyncContext) -> Result<Self, InitError> {
        let settings = &ctx.settings;

        let delays = settings
            .crm
            .parsed_retry_delays()
            .map_err(|e| InitError::Config(format!("{e:#}")))?;
        let queue = RetryQueue::open(
            &settings.queue.store_path,
            QueuePolicy {
                capacity: settings.queue.max_queue_size,
                max_attempts: settings.queue.max_retry_attempts,
                delays,
            },
        )
        .map_err(InitError::Storage)?;

        let watermark_store = WatermarkStore::new(watermark_path(&settings.queue.store_path));
        let watermark = watermark_store
            .load()
            .map_err(InitError::Storage)?
            .unwrap_or_else(|| ctx.clock.now() - Duration::days(settings.sync.initial_sync_days));

        let cache =
            PlanCache::open_or_rebuild(&settings.plans.cache_path, settings.plans.max_cache_entries);
        let projector =
            PlanProjector::new(cache, settings.plans.throttle_minutes, Arc::clone(&ctx.clock));

        let reconciler = Reconciler::new(
            Arc::clone(&ctx.crm),
            settings.stages.clone(),
            settings.crm.external_id_field.clone(),
        );

        Ok(Self {
            ctx,
            reconciler,
            watermark_store,
            watermark,
            queue,
            projector,
        })
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Run cycles until `shutdown` resolves. A cycle in flight finishes
    /// before the loop exits, keeping queue and watermark consistent.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        self.startup_probes().await;

        let period = StdDuration::from_secs(self.ctx.settings.sync.interval_minutes * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        if let Err(err) = self.watermark_store.save(self.watermark) {
            warn!(%err, "final watermark save failed (safe: last cycle already persisted)");
        }
        if let Err(err) = self.projector.flush() {
            warn!(%err, "plan cache flush failed (safe: cache is rebuildable)");
        }
        info!("shutdown complete");
    }

    /// Startup liveness: probe both sides, log, and proceed either way —
    /// "source or CRM temporarily down" is a normal cycle-level condition,
    /// not a reason to crash.
    async fn startup_probes(&self) {
        if self.ctx.source.ping().await {
            info!("source reachable");
        } else {
            warn!("source ping failed at startup; cycles will keep retrying");
        }
        if self.ctx.crm.ping().await {
            info!("crm reachable");
        } else {
            warn!("crm ping failed at startup; cycles will keep retrying");
        }
    }

    /// One full pass: queue drain, fresh records, watermark, projections.
    pub async fn run_cycle(&mut self) -> CycleMetrics {
        let mut metrics = CycleMetrics::default();
        let mut plan_targets: Vec<(ExternalId, i64)> = Vec::new();

        self.drain_queue(&mut metrics, &mut plan_targets).await;

        let (source_ok, candidate) = self.sync_fresh(&mut metrics, &mut plan_targets).await;

        if source_ok {
            if let Some(candidate) = candidate {
                if candidate > self.watermark {
                    self.watermark = candidate;
                    if let Err(err) = self.watermark_store.save(self.watermark) {
                        error!(%err, "watermark save failed; rows will be re-read next cycle");
                    }
                }
            }
        }

        self.project_plans(&mut metrics, &plan_targets).await;

        metrics.queue_depth = self.queue.len();
        metrics.emit();
        metrics
    }

    async fn drain_queue(
        &mut self,
        metrics: &mut CycleMetrics,
        plan_targets: &mut Vec<(ExternalId, i64)>,
    ) {
        match self.queue.prune() {
            Ok(dead) => {
                for item in dead {
                    error!(external_id = %item.external_id, attempts = item.attempt_count,
                           last_error = %item.last_error, "retry attempts exhausted, record dead");
                }
            }
            Err(err) => warn!(%err, "queue prune failed"),
        }

        for item in self.queue.due(self.ctx.clock.now()) {
            let started = Instant::now();
            let result = self.reconciler.reconcile_record(&item.record).await;
            metrics.observe_latency(started.elapsed());
            match result {
                Ok(outcome) => {
                    metrics.retried_succeeded += 1;
                    if let Some(deal_id) = outcome.deal_id() {
                        plan_targets.push((item.external_id.clone(), deal_id));
                    }
                    if let Err(err) = self.queue.mark_success(&item.external_id) {
                        warn!(%err, "queue mark_success failed");
                    }
                }
                Err(err) => {
                    metrics.retried_failed += 1;
                    warn!(external_id = %item.external_id, attempt = item.attempt_count + 1,
                          %err, "retry failed");
                    if let Err(err) = self.queue.mark_failure(
                        &item.external_id,
                        self.ctx.clock.now(),
                        &err.to_string(),
                    ) {
                        warn!(%err, "queue mark_failure failed");
                    }
                }
            }
        }
    }

    /// Stream the reader, reconciling in `batch_size` chunks. Returns
    /// whether the source stayed healthy and the watermark candidate.
    async fn sync_fresh(
        &mut self,
        metrics: &mut CycleMetrics,
        plan_targets: &mut Vec<(ExternalId, i64)>,
    ) -> (bool, Option<DateTime<Utc>>) {
        let batch_size = self.ctx.settings.sync.batch_size;
        let source = Arc::clone(&self.ctx.source);
        let mut stream = source.read_since(self.watermark);

        let mut chunk: Vec<CanonicalRecord> = Vec::with_capacity(batch_size);
        let mut candidate: Option<DateTime<Utc>> = None;
        let mut source_ok = true;

        while let Some(row) = stream.next().await {
            match row {
                Err(err) => {
                    warn!(%err, "source stream failed; cycle aborted, watermark untouched");
                    source_ok = false;
                    break;
                }
                Ok(appt) => {
                    metrics.attempted += 1;
                    match transform(&appt) {
                        Err(dq) => {
                            metrics.data_quality_dropped += 1;
                            warn!(%dq, "row dropped (data quality)");
                        }
                        Ok(record) => {
                            chunk.push(record);
                            if chunk.len() >= batch_size {
                                self.flush_chunk(&mut chunk, metrics, &mut candidate, plan_targets)
                                    .await;
                            }
                        }
                    }
                }
            }
        }
        drop(stream);

        if source_ok {
            self.flush_chunk(&mut chunk, metrics, &mut candidate, plan_targets)
                .await;
        }
        (source_ok, candidate)
    }

    async fn flush_chunk(
        &mut self,
        chunk: &mut Vec<CanonicalRecord>,
        metrics: &mut CycleMetrics,
        candidate: &mut Option<DateTime<Utc>>,
        plan_targets: &mut Vec<(ExternalId, i64)>,
    ) {
        if chunk.is_empty() {
            return;
        }
        let records = std::mem::take(chunk);

        let started = Instant::now();
        let results = self.reconciler.reconcile_batch(&records).await;
        metrics.observe_batch(started.elapsed(), records.len() as u32);

        for ((external_id, result), record) in results.into_iter().zip(records) {
            match result {
                Ok(outcome) => {
                    // Processed: the watermark may move past this row.
                    advance(candidate, record.source_timestamps_max);
                    if let ReconcileOutcome::SkippedAmbiguous { .. } = outcome {
                        metrics.skipped_ambiguous += 1;
                    } else {
                        metrics.succeeded += 1;
                        if let Some(deal_id) = outcome.deal_id() {
                            plan_targets.push((external_id, deal_id));
                        }
                    }
                }
                Err(err) => {
                    warn!(external_id = %external_id, %err, "reconcile failed, deferring");
                    match self
                        .queue
                        .enqueue(record, self.ctx.clock.now(), &err.to_string())
                    {
                        Ok(()) => metrics.enqueued += 1,
                        Err(StoreError::Full { capacity }) => {
                            metrics.enqueue_rejected += 1;
                            warn!(external_id = %external_id, capacity,
                                  "retry queue full, record NOT deferred");
                        }
                        Err(err) => {
                            metrics.enqueue_rejected += 1;
                            error!(%err, "queue write failed");
                        }
                    }
                }
            }
        }
    }

    async fn project_plans(&mut self, metrics: &mut CycleMetrics, targets: &[(ExternalId, i64)]) {
        for (external_id, deal_id) in targets {
            let result = self
                .projector
                .project(
                    self.ctx.source.as_ref(),
                    self.ctx.plan_writer.as_ref(),
                    external_id,
                    *deal_id,
                )
                .await;
            match result {
                Ok(ProjectOutcome::Applied) => metrics.plans_applied += 1,
                Ok(_) => {}
                // Projector trouble never propagates to reconciliation.
                Err(err) => warn!(external_id = %external_id, %err, "plan projection failed"),
            }
        }
    }
}

fn advance(candidate: &mut Option<DateTime<Utc>>, ts: DateTime<Utc>) {
    match candidate {
        Some(current) if *current >= ts => {}
        _ => *candidate = Some(ts),
    }
}

fn watermark_path(queue_store_path: &str) -> PathBuf {
    match Path::new(queue_store_path).parent() {
        Some(dir) => dir.join("watermark"),
        None => PathBuf::from("watermark"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
