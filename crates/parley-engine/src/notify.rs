//! Outbound notifications for the UI and notification collaborators.
//!
//! The engine never talks to the OS notification system itself; it emits
//! typed events on an mpsc channel and a separate component decides what to
//! surface.

use parley_shared::types::{ConnectionPhase, ConversationId, CorrelationId, MessageId};
use serde::Serialize;
use tokio::sync::mpsc;

/// Events emitted by the engine's workers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineNotification {
    /// A conversation gained unread messages the user has not seen.
    NewUnread {
        conversation_id: ConversationId,
        count: i64,
    },

    /// The global badge value changed.
    BadgeChanged { total: i64 },

    /// An optimistic send was acknowledged by the server.
    MessageConfirmed {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        message_id: MessageId,
    },

    /// An optimistic send reached terminal failure; the entry stays visible
    /// for retry or dismissal.
    SendFailed {
        conversation_id: ConversationId,
        correlation_id: CorrelationId,
        error: String,
    },

    /// The realtime connection moved to a new phase.
    ConnectionChanged { phase: ConnectionPhase },
}

/// Cloneable sender half used by every worker.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<EngineNotification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineNotification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Fire-and-forget emit. A full or closed channel is logged, never fatal.
    pub fn emit(&self, notification: EngineNotification) {
        if let Err(e) = self.tx.try_send(notification) {
            tracing::warn!(error = %e, "failed to emit engine notification");
        }
    }
}
