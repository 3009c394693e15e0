//! The projector: fetch, render, compare, throttle, write, cache.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use dent_crm::{CrmClient, CrmError};
use dent_model::{Clock, ExternalId};
use dent_source::{AppointmentSource, SourceError};
use dent_store::{PlanCache, PlanCacheEntry, StoreError};

use crate::render::{plan_hash, render_plan};

// ---------------------------------------------------------------------------
// Writer seam
// ---------------------------------------------------------------------------

/// The single CRM operation the projector performs.
#[async_trait]
pub trait PlanWriter: Send + Sync {
    async fn write_plan(&self, deal_id: i64, text: &str) -> Result<(), CrmError>;
}

#[async_trait]
impl PlanWriter for CrmClient {
    async fn write_plan(&self, deal_id: i64, text: &str) -> Result<(), CrmError> {
        self.set_plan_text(deal_id, text).await
    }
}

// ---------------------------------------------------------------------------
// Outcome / error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectOutcome {
    /// The plan field was updated and the cache entry replaced.
    Applied,
    /// Rendering is identical to the last applied one; nothing sent.
    Unchanged,
    /// Rendering changed but the throttle window has not elapsed.
    Throttled,
    /// The appointment has no plan lines; nothing to project.
    NoLines,
}

#[derive(Debug)]
pub enum PlanError {
    Source(SourceError),
    Crm(CrmError),
    Store(StoreError),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Source(e) => write!(f, "plan projection source error: {e}"),
            PlanError::Crm(e) => write!(f, "plan projection crm error: {e}"),
            PlanError::Store(e) => write!(f, "plan projection store error: {e}"),
        }
    }
}

impl std::error::Error for PlanError {}

// ---------------------------------------------------------------------------
// Projector
// ---------------------------------------------------------------------------

pub struct PlanProjector {
    cache: PlanCache,
    throttle: Duration,
    clock: Arc<dyn Clock>,
}

impl PlanProjector {
    pub fn new(cache: PlanCache, throttle_minutes: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            throttle: Duration::minutes(throttle_minutes),
            clock,
        }
    }

    /// Reflect one appointment's plan onto its deal, if due.
    ///
    /// At most one CRM call per invocation, and at most one per external id
    /// per throttle window across invocations.
    pub async fn project(
        &mut self,
        source: &dyn AppointmentSource,
        writer: &dyn PlanWriter,
        external_id: &ExternalId,
        deal_id: i64,
    ) -> Result<ProjectOutcome, PlanError> {
        let lines = source
            .read_plan_lines(external_id)
            .await
            .map_err(PlanError::Source)?;
        if lines.is_empty() {
            return Ok(ProjectOutcome::NoLines);
        }

        let text = render_plan(&lines);
        let hash = plan_hash(&text);
        let now = self.clock.now();

        if let Some(entry) = self.cache.get(external_id) {
            if entry.last_hash == hash {
                return Ok(ProjectOutcome::Unchanged);
            }
            // Changed, but the window since the last applied write gates
            // regardless of content.
            if now - entry.last_applied_at < self.throttle {
                return Ok(ProjectOutcome::Throttled);
            }
        }

        writer
            .write_plan(deal_id, &text)
            .await
            .map_err(PlanError::Crm)?;
        self.cache
            .put(PlanCacheEntry {
                external_id: external_id.clone(),
                deal_id,
                last_hash: hash,
                last_applied_at: now,
            })
            .map_err(PlanError::Store)?;
        Ok(ProjectOutcome::Applied)
    }

    /// Persist the cache (shutdown flush).
    pub fn flush(&self) -> Result<(), StoreError> {
        self.cache.flush()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
