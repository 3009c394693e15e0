use std::fmt;

/// Errors from the clinic database boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Connection or query failure. Transient: the scheduler skips the
    /// cycle without advancing the watermark.
    Unavailable(String),
    /// A row came back in a shape the reader cannot interpret.
    Decode(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "source unavailable: {msg}"),
            SourceError::Decode(msg) => write!(f, "source row decode error: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}
