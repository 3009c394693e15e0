//! Typed configuration sections with serde defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::parse_delay_csv;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Connection settings for the clinic database (read-only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub server: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connection_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: 5432,
            database: "clinic".to_string(),
            username: "sync_reader".to_string(),
            password: String::new(),
            connection_timeout_secs: 10,
            query_timeout_secs: 60,
        }
    }
}

impl SourceConfig {
    /// Connection URL for the pool. The password is embedded; never log this.
    pub fn connect_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.server, self.port, self.database
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// CRM
// ---------------------------------------------------------------------------

/// CRM client behavior. The webhook URL embeds the access token; it must
/// never appear in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrmConfig {
    pub webhook_url: String,
    pub max_retries: u32,
    /// CSV of whole seconds, read in order; the last entry is reused when
    /// attempts outnumber it.
    pub retry_delays: String,
    /// Maximum request rate, calls per second.
    pub rate_limit: f64,
    pub request_timeout_secs: u64,
    /// Deal custom field carrying the external id.
    pub external_id_field: String,
    /// Deal custom field carrying the treatment-plan projection.
    pub plan_field: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            max_retries: 3,
            retry_delays: "1,5,15".to_string(),
            rate_limit: 2.0,
            request_timeout_secs: 30,
            external_id_field: "UF_CRM_EXTERNAL_ID".to_string(),
            plan_field: "UF_CRM_TREATMENT_PLAN".to_string(),
        }
    }
}

impl CrmConfig {
    pub fn parsed_retry_delays(&self) -> Result<Vec<Duration>> {
        parse_delay_csv(&self.retry_delays)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Sync cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub interval_minutes: u64,
    /// Records reconciled per batched lookup round.
    pub batch_size: usize,
    /// Initial watermark = now − this many days, on first ever start.
    pub initial_sync_days: i64,
    pub filial_id: u8,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_minutes: 2,
            batch_size: 50,
            initial_sync_days: 30,
            filial_id: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub store_path: String,
    pub max_queue_size: usize,
    pub max_retry_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_path: "state/queue.store".to_string(),
            max_queue_size: 1000,
            max_retry_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan projector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlansConfig {
    pub cache_path: String,
    pub max_cache_entries: usize,
    pub throttle_minutes: i64,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            cache_path: "state/plan_cache.store".to_string(),
            max_cache_entries: 10_000,
            throttle_minutes: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Parsed and validated here; file rotation and personal-data masking are
/// applied by the logging collaborator outside this core. `level` seeds
/// the tracing env-filter default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<String>,
    pub rotation_days: u32,
    pub mask_personal_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            rotation_days: 7,
            mask_personal_data: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_embeds_all_parts() {
        let cfg = SourceConfig {
            server: "db.clinic.local".to_string(),
            port: 5433,
            database: "ident".to_string(),
            username: "reader".to_string(),
            password: "pw".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.connect_url(),
            "postgres://reader:pw@db.clinic.local:5433/ident"
        );
    }

    #[test]
    fn default_retry_ladder_parses() {
        let delays = CrmConfig::default().parsed_retry_delays().unwrap();
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(15));
    }
}
