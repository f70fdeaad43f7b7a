//! # parley-shared
//!
//! Types shared between the replica store and the sync engine: identifier
//! newtypes, the inbound realtime event model, the remote error taxonomy,
//! and tuning constants.

pub mod constants;
pub mod event;
pub mod types;

mod error;

pub use error::RemoteError;
pub use event::RealtimeEvent;
pub use types::*;
