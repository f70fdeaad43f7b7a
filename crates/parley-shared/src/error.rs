use thiserror::Error;

/// Errors crossing the remote interface boundary.
///
/// Every network-facing operation classifies its failure into one of these
/// variants; the owning component decides whether to retry (transient),
/// surface (permanent), drop-and-log (decode) or fold into the merge rule
/// (conflict).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Timeout, connection drop, or any failure worth retrying with backoff.
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Validation or authorization failure. Never retried automatically.
    #[error("Permanent request error: {0}")]
    Permanent(String),

    /// Malformed payload. The offending event/response is dropped and logged.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stale write rejected outright by the remote side.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Timeout helper so every `tokio::time::timeout` wrapper classifies the
    /// same way.
    pub fn timed_out(op: &str) -> Self {
        Self::Transient(format!("{op} timed out"))
    }
}
