//! The sync watermark: a single ISO-8601 instant on disk.
//!
//! The reader selects rows whose maximum change marker is **≥** the
//! watermark (inclusive, so a row landing at exactly the stored instant is
//! not skipped), and the scheduler only advances it after every row of a
//! cycle has either succeeded or been durably enqueued.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::atomic::write_atomic;
use crate::StoreError;

pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Read the persisted watermark. `Ok(None)` when no file exists yet
    /// (first ever run); [`StoreError::Corrupt`] when the file exists but
    /// does not parse — that is fatal upstream, not silently reset.
    pub fn load(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read watermark", e)),
        };
        let trimmed = raw.trim();
        let ts = DateTime::parse_from_rfc3339(trimmed)
            .map_err(|e| StoreError::Corrupt(format!("watermark '{trimmed}': {e}")))?;
        Ok(Some(ts.with_timezone(&Utc)))
    }

    /// Persist a new watermark atomically.
    pub fn save(&self, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let line = format!("{}\n", ts.to_rfc3339());
        write_atomic(&self.path, line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missing_file_means_no_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(dir.path().join("watermark"));
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(dir.path().join("watermark"));
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.save(ts).unwrap();
        assert_eq!(store.load().unwrap(), Some(ts));
    }

    #[test]
    fn corrupt_content_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermark");
        fs::write(&path, "yesterday-ish\n").unwrap();
        let err = WatermarkStore::new(&path).load().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn save_overwrites_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = WatermarkStore::new(dir.path().join("watermark"));
        let t1 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(1_700_000_600, 0).unwrap();
        store.save(t1).unwrap();
        store.save(t2).unwrap();
        assert_eq!(store.load().unwrap(), Some(t2));
    }
}
