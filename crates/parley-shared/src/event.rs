//! Inbound realtime change events.
//!
//! Events arrive from the remote stream as JSON with an `event_type`
//! discriminant. They are modelled as a tagged enum so that a new event kind
//! is a compile-time-checked addition, never a string comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::types::{ConversationId, MessageId, UserId};

/// A single change event from the remote stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// A message was created.
    Insert(MessageEvent),

    /// A message was edited or had server-side state changed.
    ///
    /// `body` may be absent when the stream only carries the primary key;
    /// such an event must not be applied as a blind overwrite.
    Update(MessageEvent),

    /// A message was deleted. Carries no content by design.
    Delete(DeleteEvent),
}

/// Payload for insert and update events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Payload for delete events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteEvent {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl RealtimeEvent {
    /// Decode a raw stream frame.
    ///
    /// A malformed frame is a [`RemoteError::Decode`]; the caller drops the
    /// event and keeps processing the stream.
    pub fn decode(raw: &[u8]) -> Result<Self, RemoteError> {
        serde_json::from_slice(raw).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Insert(e) | Self::Update(e) => e.conversation_id,
            Self::Delete(e) => e.conversation_id,
        }
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Insert(e) | Self::Update(e) => e.message_id,
            Self::Delete(e) => e.message_id,
        }
    }
}
