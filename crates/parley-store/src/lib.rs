//! # parley-store
//!
//! The local replica of conversation and message state, backed by SQLite.
//!
//! This crate is the single source of local truth for the UI and the only
//! component permitted to mutate persisted conversation/message state. Every
//! write is idempotent: the merge rule is last-writer-wins on timestamp with
//! the message identifier as tie-break, so events can be replayed or applied
//! out of arrival order and the replica converges to the same state.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod participants;
pub mod unread;

mod convert;
mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
