//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, ConversationKind, CorrelationId, MessageId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A direct or group conversation.
///
/// Conversations are never hard-deleted locally; `archived` is set instead so
/// cached lists cannot dangle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    /// Unique conversation identifier.
    pub id: ConversationId,
    /// Direct (1:1) or group.
    pub kind: ConversationKind,
    /// Display title. Owned by the UI collaborator, only referenced here.
    pub title: Option<String>,
    /// Opaque image reference. Owned by the UI collaborator.
    pub image_ref: Option<String>,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// Monotonic last-activity timestamp used for list ordering.
    pub last_activity_at: DateTime<Utc>,
    /// Soft-delete flag.
    pub archived: bool,
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Membership of one user in one conversation.
///
/// A non-null `left_at` means inactive; the row is retained for historical
/// message attribution and must not receive new-message fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// The conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Sender identifier.
    pub sender_id: UserId,
    /// Message body (text or a structured payload reference).
    pub body: String,
    /// Server-assigned creation timestamp, authoritative for ordering.
    pub created_at: DateTime<Utc>,
    /// `true` while the message only exists locally, awaiting confirmation.
    pub pending: bool,
    /// Set when the message was edited.
    pub edited_at: Option<DateTime<Utc>>,
    /// Set when the message was deleted (soft state; body retained).
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// The timestamp that participates in the last-writer-wins comparison:
    /// the newest of creation, edit, and delete times.
    pub fn revision(&self) -> DateTime<Utc> {
        let mut rev = self.created_at;
        if let Some(e) = self.edited_at {
            rev = rev.max(e);
        }
        if let Some(d) = self.deleted_at {
            rev = rev.max(d);
        }
        rev
    }

    /// Total-order key within a conversation: (creation timestamp, id).
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The incoming record was newer (or new) and was written.
    Applied,
    /// The incoming record was a duplicate or older than the stored row.
    Ignored,
}

impl UpsertOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

// ---------------------------------------------------------------------------
// OutboxEntry
// ---------------------------------------------------------------------------

/// A locally-created message awaiting server acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Client-generated correlation id; also keys the queue.
    pub correlation_id: CorrelationId,
    pub conversation_id: ConversationId,
    /// Provisional message id of the pending replica row.
    pub message_id: MessageId,
    /// Provisional content.
    pub body: String,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Entry is not due before this instant.
    pub next_retry_at: DateTime<Utc>,
    /// Terminal failure: kept for user-initiated retry or dismissal.
    pub failed: bool,
    /// Last delivery error, for the UI's retry affordance.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
