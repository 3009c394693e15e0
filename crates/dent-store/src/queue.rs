//! Durable retry queue for records whose CRM sync failed.
//!
//! # Invariants
//!
//! - One item per external id: enqueueing an id that is already queued
//!   replaces the record snapshot but keeps the item's backoff schedule.
//! - At capacity the queue **rejects** new ids rather than evicting old
//!   ones — an old item may be the only record of a failed write.
//! - The store carries a schema version; an unknown version is
//!   [`StoreError::Corrupt`], never migrated in place.
//!
//! Every mutation persists the whole document atomically before returning,
//! so a crash between cycles loses nothing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dent_model::{CanonicalRecord, ExternalId};

use crate::atomic::write_atomic;
use crate::StoreError;

const STORE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// One deferred record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub external_id: ExternalId,
    pub record: CanonicalRecord,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueDocument {
    version: u32,
    items: Vec<QueueItem>,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry policy: capacity cap, attempt cap, and the backoff ladder.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub capacity: usize,
    pub max_attempts: u32,
    /// Backoff delays read in order; the last is reused past the end.
    pub delays: Vec<Duration>,
}

impl QueuePolicy {
    fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        debug_assert!(attempt_count >= 1);
        let idx = ((attempt_count - 1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RetryQueue {
    path: PathBuf,
    policy: QueuePolicy,
    items: BTreeMap<ExternalId, QueueItem>,
}

impl RetryQueue {
    /// Open the queue store, creating an empty queue when no file exists.
    pub fn open(path: impl AsRef<Path>, policy: QueuePolicy) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let items = match fs::read(&path) {
            Ok(bytes) => {
                let doc: QueueDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("queue store: {e}")))?;
                if doc.version != STORE_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "queue store version {} (supported: {STORE_VERSION})",
                        doc.version
                    )));
                }
                doc.items
                    .into_iter()
                    .map(|it| (it.external_id.clone(), it))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::io("read queue store", e)),
        };
        Ok(Self {
            path,
            policy,
            items,
        })
    }

    /// Defer a failed record. First failure of an id schedules the first
    /// backoff delay; an id already queued only has its snapshot and error
    /// refreshed (the existing schedule keeps counting).
    pub fn enqueue(
        &mut self,
        record: CanonicalRecord,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let id = record.external_id.clone();
        if let Some(existing) = self.items.get_mut(&id) {
            existing.record = record;
            existing.last_error = error.to_string();
            return self.persist();
        }
        if self.items.len() >= self.policy.capacity {
            return Err(StoreError::Full {
                capacity: self.policy.capacity,
            });
        }
        let next = now
            + chrono::Duration::from_std(self.policy.delay_for_attempt(1))
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.items.insert(
            id.clone(),
            QueueItem {
                external_id: id,
                record,
                enqueued_at: now,
                attempt_count: 1,
                next_attempt_at: next,
                last_error: error.to_string(),
            },
        );
        self.persist()
    }

    /// Items whose retry is due, in `next_attempt_at` order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut due: Vec<QueueItem> = self
            .items
            .values()
            .filter(|it| it.next_attempt_at <= now && it.attempt_count < self.policy.max_attempts)
            .cloned()
            .collect();
        due.sort_by_key(|it| it.next_attempt_at);
        due
    }

    /// The retried record made it to the CRM; forget it.
    pub fn mark_success(&mut self, id: &ExternalId) -> Result<(), StoreError> {
        if self.items.remove(id).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    /// The retried record failed again: bump the attempt counter and push
    /// `next_attempt_at` out by the ladder delay for this attempt.
    pub fn mark_failure(
        &mut self,
        id: &ExternalId,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        if let Some(item) = self.items.get_mut(id) {
            item.attempt_count += 1;
            let delay = self.policy.delay_for_attempt(item.attempt_count);
            item.next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            item.last_error = error.to_string();
            self.persist()?;
        }
        Ok(())
    }

    /// Drop items that exhausted their attempts, returning them so the
    /// caller can record them as dead.
    pub fn prune(&mut self) -> Result<Vec<QueueItem>, StoreError> {
        let dead_ids: Vec<ExternalId> = self
            .items
            .values()
            .filter(|it| it.attempt_count >= self.policy.max_attempts)
            .map(|it| it.external_id.clone())
            .collect();
        let mut dead = Vec::with_capacity(dead_ids.len());
        for id in dead_ids {
            if let Some(item) = self.items.remove(&id) {
                dead.push(item);
            }
        }
        if !dead.is_empty() {
            self.persist()?;
        }
        Ok(dead)
    }

    pub fn contains(&self, id: &ExternalId) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let doc = QueueDocument {
            version: STORE_VERSION,
            items: self.items.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StoreError::Io(format!("serialize queue store: {e}")))?;
        write_atomic(&self.path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
