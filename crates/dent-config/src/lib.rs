//! dent-config
//!
//! Layered YAML configuration for the sync daemon. Later files override
//! earlier files via deep-merge, the merged document is canonicalized and
//! hashed (the hash is logged at startup so an operator can tell which
//! configuration a given run used), then deserialized into typed sections
//! and validated. Any validation failure is fatal at startup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::time::Duration;

use dent_model::StageMap;

mod sections;
pub use sections::{
    CrmConfig, LoggingConfig, PlansConfig, QueueConfig, SourceConfig, SyncSection,
};

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

/// All recognized configuration, one field per section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub source: SourceConfig,
    pub crm: CrmConfig,
    pub sync: SyncSection,
    pub queue: QueueConfig,
    pub plans: PlansConfig,
    pub logging: LoggingConfig,
    pub stages: StageMap,
}

impl SyncSettings {
    /// Validate everything that must hold before the daemon may start.
    pub fn validate(&self) -> Result<()> {
        if self.crm.webhook_url.trim().is_empty() {
            bail!("crm.webhook_url must not be empty");
        }
        if !(self.crm.rate_limit > 0.0) {
            bail!("crm.rate_limit must be positive, got {}", self.crm.rate_limit);
        }
        if self.crm.max_retries == 0 {
            bail!("crm.max_retries must be at least 1");
        }
        // Parse once here so a malformed list fails at startup, not mid-cycle.
        self.crm
            .parsed_retry_delays()
            .context("crm.retry_delays")?;
        if !(1..=5).contains(&self.sync.filial_id) {
            bail!("sync.filial_id must be in 1..=5, got {}", self.sync.filial_id);
        }
        if self.sync.interval_minutes == 0 {
            bail!("sync.interval_minutes must be at least 1");
        }
        if self.sync.batch_size == 0 {
            bail!("sync.batch_size must be at least 1");
        }
        if self.queue.max_queue_size == 0 {
            bail!("queue.max_queue_size must be at least 1");
        }
        if self.queue.max_retry_attempts == 0 {
            bail!("queue.max_retry_attempts must be at least 1");
        }
        if self.queue.store_path.trim().is_empty() {
            bail!("queue.store_path must not be empty");
        }
        if self.plans.cache_path.trim().is_empty() {
            bail!("plans.cache_path must not be empty");
        }
        if self.plans.max_cache_entries == 0 {
            bail!("plans.max_cache_entries must be at least 1");
        }
        Ok(())
    }
}

/// Result of a layered load: typed settings plus the canonical form and
/// its hash for startup logging.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: SyncSettings,
    pub canonical_json: String,
    pub config_hash: String,
}

// ---------------------------------------------------------------------------
// Layered load
// ---------------------------------------------------------------------------

/// Load + merge YAML files in order, canonicalize, hash, deserialize,
/// validate. Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let settings: SyncSettings =
        serde_json::from_value(merged).context("config does not match the expected shape")?;
    settings.validate()?;

    Ok(LoadedConfig {
        settings,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Parse a CSV list of whole seconds ("1,5,15") into durations.
pub(crate) fn parse_delay_csv(csv: &str) -> Result<Vec<Duration>> {
    let mut out = Vec::new();
    for part in csv.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let secs: u64 = part
            .parse()
            .with_context(|| format!("invalid delay '{part}' (whole seconds expected)"))?;
        out.push(Duration::from_secs(secs));
    }
    if out.is_empty() {
        bail!("delay list is empty");
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Merge + canonicalization
// ---------------------------------------------------------------------------

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
