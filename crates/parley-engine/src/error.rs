use parley_shared::RemoteError;
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Replica store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote interface failure, already classified.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The store mutex was poisoned by a panicking holder.
    #[error("Replica lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
