//! Atomic file replacement: write to a temp file in the target directory,
//! fsync, rename over the live file. A crash at any point leaves the live
//! file either pre- or post-write, never partial.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::StoreError;

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| StoreError::io("create store directory", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| StoreError::io("create temp file", e))?;
    tmp.write_all(bytes)
        .map_err(|e| StoreError::io("write temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("sync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("rename over live file", e.error))?;
    Ok(())
}
