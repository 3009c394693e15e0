//! Cache of the last treatment-plan projection applied per external id.
//!
//! Lets the projector skip CRM updates when the rendered plan has not
//! changed, and throttle updates that have. The cache is rebuildable: a
//! corrupt file costs at most one redundant CRM update per appointment, so
//! [`PlanCache::open_or_rebuild`] logs a warning and starts empty instead
//! of failing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use dent_model::ExternalId;

use crate::atomic::write_atomic;
use crate::StoreError;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCacheEntry {
    pub external_id: ExternalId,
    pub deal_id: i64,
    pub last_hash: String,
    pub last_applied_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    entries: Vec<PlanCacheEntry>,
}

#[derive(Debug)]
pub struct PlanCache {
    path: PathBuf,
    max_entries: usize,
    entries: HashMap<ExternalId, PlanCacheEntry>,
}

impl PlanCache {
    /// Strict open; [`StoreError::Corrupt`] on unreadable content.
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) => {
                let doc: CacheDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("plan cache: {e}")))?;
                if doc.version != CACHE_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "plan cache version {} (supported: {CACHE_VERSION})",
                        doc.version
                    )));
                }
                doc.entries
                    .into_iter()
                    .map(|e| (e.external_id.clone(), e))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::io("read plan cache", e)),
        };
        Ok(Self {
            path,
            max_entries,
            entries,
        })
    }

    /// Open, falling back to an empty cache on corruption (warned, not
    /// fatal — the cache is rebuildable state).
    pub fn open_or_rebuild(path: impl AsRef<Path>, max_entries: usize) -> Self {
        let path = path.as_ref();
        match Self::open(path, max_entries) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(path = %path.display(), %err, "plan cache unreadable, rebuilding empty");
                Self {
                    path: path.to_path_buf(),
                    max_entries,
                    entries: HashMap::new(),
                }
            }
        }
    }

    pub fn get(&self, id: &ExternalId) -> Option<&PlanCacheEntry> {
        self.entries.get(id)
    }

    /// Insert or replace an entry, evict past the bound, persist atomically.
    pub fn put(&mut self, entry: PlanCacheEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.external_id.clone(), entry);
        self.evict_if_over_bound();
        self.persist()
    }

    /// Persist the current state (used at shutdown flush).
    pub fn flush(&self) -> Result<(), StoreError> {
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Approximate LRU: past the bound, drop the oldest ~10% by
    /// `last_applied_at` (at least one).
    fn evict_if_over_bound(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let to_drop = (self.max_entries / 10).max(1);
        let mut by_age: Vec<(ExternalId, DateTime<Utc>)> = self
            .entries
            .values()
            .map(|e| (e.external_id.clone(), e.last_applied_at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        for (id, _) in by_age.into_iter().take(to_drop) {
            self.entries.remove(&id);
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        let mut entries: Vec<PlanCacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        let doc = CacheDocument {
            version: CACHE_VERSION,
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StoreError::Io(format!("serialize plan cache: {e}")))?;
        write_atomic(&self.path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
