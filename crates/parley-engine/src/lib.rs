//! # parley-engine
//!
//! The moving parts of the messaging consistency layer: a realtime sync
//! engine that folds the remote change stream into the local replica, an
//! outbox worker that drains optimistic sends with bounded retries, a
//! reconciliation worker that keeps unread counters honest against the
//! server, TTL caches in front of the expensive aggregate reads, and a
//! pagination coordinator that merges history fetches with the live head.
//!
//! Everything is wired together by [`Session::spawn`], which starts the
//! background workers and returns a cloneable [`SessionHandle`] plus a
//! notification stream for the UI/notification collaborators.

pub mod cache;
pub mod notify;
pub mod outbox;
pub mod pagination;
pub mod realtime;
pub mod reconcile;
pub mod remote;
pub mod replica;
pub mod session;
pub mod view;

mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use error::EngineError;
pub use notify::EngineNotification;
pub use remote::{Page, RealtimeTransport, RemoteApi};
pub use replica::Replica;
pub use session::{Session, SessionHandle, SyncConfig};
