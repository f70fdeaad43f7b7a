//! The consumed remote interface.
//!
//! The engine never owns transport details; it talks to the source of truth
//! through [`RemoteApi`] and receives the change stream through
//! [`RealtimeTransport`]. Methods return `impl Future + Send` so workers stay
//! spawnable for any implementation.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, CorrelationId, MessageId, UserId};
use parley_shared::RemoteError;
use parley_store::{Conversation, Message};
use tokio::sync::mpsc;

/// One page of a cursor-based listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

/// Remote fetch/send endpoints, consumed but not specified internally.
pub trait RemoteApi: Send + Sync + 'static {
    /// Page of the user's conversations, newest activity first.
    fn list_conversations(
        &self,
        user: &UserId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<Page<Conversation>, RemoteError>> + Send;

    /// Page of messages older than the cursor, for history pagination.
    fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<(DateTime<Utc>, MessageId)>,
        limit: u32,
    ) -> impl Future<Output = Result<Page<Message>, RemoteError>> + Send;

    /// Messages strictly newer than `since`, oldest first — the catch-up
    /// fetch after a connectivity gap.
    fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        since: DateTime<Utc>,
        limit: u32,
    ) -> impl Future<Output = Result<Page<Message>, RemoteError>> + Send;

    /// Deliver a message; returns the server-confirmed record.
    fn send_message(
        &self,
        conversation_id: ConversationId,
        body: &str,
        correlation_id: CorrelationId,
    ) -> impl Future<Output = Result<Message, RemoteError>> + Send;

    /// Acknowledge the given messages as read by the current user.
    fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Authoritative unread counts per conversation.
    fn fetch_unread_counts(
        &self,
        user: &UserId,
    ) -> impl Future<Output = Result<HashMap<ConversationId, i64>, RemoteError>> + Send;

    /// Full conversation metadata by id.
    fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> impl Future<Output = Result<Conversation, RemoteError>> + Send;

    /// Full message row by id, for update events that only carry a key.
    fn fetch_message(
        &self,
        message_id: MessageId,
    ) -> impl Future<Output = Result<Message, RemoteError>> + Send;
}

/// The realtime change stream.
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Open a subscription scoped to exactly the given conversations — never
    /// a global feed. Raw frames arrive on the returned channel; the channel
    /// closing signals a disconnect.
    fn connect(
        &self,
        scope: &[ConversationId],
    ) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, RemoteError>> + Send;
}

/// Bound a remote call so a hung request cannot stall its worker. An elapsed
/// timeout classifies as transient.
pub(crate) async fn with_timeout<T>(
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(op, timeout_ms = limit.as_millis() as u64, "remote call timed out");
            Err(RemoteError::timed_out(op))
        }
    }
}
