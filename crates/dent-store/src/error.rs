use std::fmt;

/// Errors raised by the persistent stores.
#[derive(Debug)]
pub enum StoreError {
    /// Filesystem failure (read, write, rename).
    Io(String),
    /// The store exists but cannot be interpreted: bad syntax, bad
    /// timestamp, or an unknown schema version. Never auto-migrated.
    Corrupt(String),
    /// The retry queue is at capacity; the enqueue was rejected and no
    /// existing item was evicted.
    Full { capacity: usize },
}

impl StoreError {
    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store io error: {msg}"),
            StoreError::Corrupt(msg) => write!(f, "store corrupt: {msg}"),
            StoreError::Full { capacity } => {
                write!(f, "retry queue full (capacity {capacity}), enqueue rejected")
            }
        }
    }
}

impl std::error::Error for StoreError {}
