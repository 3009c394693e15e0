use std::fmt;

/// Errors a CRM call may return.
///
/// [`CrmError::is_transient`] is the single classification point: transient
/// errors are retried by the client and, once attempts are exhausted,
/// enqueued; non-transient errors skip retry and go straight to the queue
/// for human inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmError {
    /// Network or transport failure.
    Transport(String),
    /// The per-attempt request timeout elapsed.
    Timeout,
    /// HTTP 5xx from the CRM.
    Server { status: u16 },
    /// The CRM's documented rate-limit-exceeded response.
    RateLimited,
    /// Semantic 4xx / application-level error. Never retried.
    Validation { code: String, description: String },
    /// A response payload could not be interpreted.
    Decode(String),
}

impl CrmError {
    /// `true` when retrying the same call can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrmError::Transport(_) | CrmError::Timeout | CrmError::Server { .. } | CrmError::RateLimited
        )
    }
}

impl fmt::Display for CrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrmError::Transport(msg) => write!(f, "crm transport error: {msg}"),
            CrmError::Timeout => write!(f, "crm request timed out"),
            CrmError::Server { status } => write!(f, "crm server error status={status}"),
            CrmError::RateLimited => write!(f, "crm rate limit exceeded"),
            CrmError::Validation { code, description } => {
                write!(f, "crm validation error {code}: {description}")
            }
            CrmError::Decode(msg) => write!(f, "crm decode error: {msg}"),
        }
    }
}

impl std::error::Error for CrmError {}
