//! Pagination coordinator.
//!
//! Merges cursor-based history fetches with the live-growing head of a
//! conversation. The cursor is the oldest currently-loaded message's
//! (timestamp, id) pair; overlap with realtime delivery is absorbed by the
//! replica's idempotent upsert, so merging a page can never reorder or
//! duplicate what is already there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, MessageId};
use parley_store::Message;
use tracing::debug;

use crate::error::Result;
use crate::remote::{with_timeout, RemoteApi};
use crate::replica::Replica;
use crate::session::SyncConfig;

#[derive(Debug, Clone)]
struct PageState {
    oldest: Option<(DateTime<Utc>, MessageId)>,
    has_more: bool,
}

impl Default for PageState {
    fn default() -> Self {
        Self {
            oldest: None,
            has_more: true,
        }
    }
}

/// Tracks the backward-pagination frontier per conversation.
#[derive(Clone, Default)]
pub struct PaginationCoordinator {
    state: Arc<Mutex<HashMap<ConversationId, PageState>>>,
}

impl PaginationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a page of messages now materialized locally (initial load or
    /// older fetch), moving the cursor to the oldest loaded entry.
    pub fn note_loaded(&self, conversation_id: ConversationId, page: &[Message]) {
        let Some(oldest) = page.first() else {
            return;
        };
        if let Ok(mut state) = self.state.lock() {
            let entry = state.entry(conversation_id).or_default();
            let key = oldest.order_key();
            if entry.oldest.map_or(true, |cur| key < cur) {
                entry.oldest = Some(key);
            }
        }
    }

    /// Record a freshly-fetched initial page along with the server's
    /// "has more" verdict.
    pub fn note_initial(
        &self,
        conversation_id: ConversationId,
        page: &[Message],
        has_more: bool,
    ) {
        self.note_loaded(conversation_id, page);
        if let Ok(mut state) = self.state.lock() {
            state.entry(conversation_id).or_default().has_more = has_more;
        }
    }

    pub fn has_more(&self, conversation_id: ConversationId) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.get(&conversation_id).map(|e| e.has_more))
            .unwrap_or(true)
    }

    /// Forget everything about a conversation. Must be called on an explicit
    /// refresh, otherwise pagination stalls on a stale `has_more = false`.
    pub fn reset(&self, conversation_id: ConversationId) {
        if let Ok(mut state) = self.state.lock() {
            state.remove(&conversation_id);
        }
    }

    /// Fetch the page older than the current cursor and merge it into the
    /// replica. Returns the fetched slice in ascending order.
    pub(crate) async fn load_older<R: RemoteApi>(
        &self,
        replica: &Replica,
        remote: &Arc<R>,
        config: &SyncConfig,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let (cursor, has_more) = {
            let state = self
                .state
                .lock()
                .map_err(|_| crate::error::EngineError::LockPoisoned)?;
            state
                .get(&conversation_id)
                .map(|e| (e.oldest, e.has_more))
                .unwrap_or((None, true))
        };

        if !has_more {
            return Ok(Vec::new());
        }

        let page = with_timeout(
            "list_messages",
            config.network_timeout,
            remote.list_messages(conversation_id, cursor, limit),
        )
        .await?;

        // Idempotent merge; a message already present from realtime delivery
        // is simply ignored.
        replica.with(|db| {
            for message in &page.items {
                db.upsert_message(message)?;
            }
            Ok(())
        })?;

        let mut items = page.items;
        items.sort_by_key(|m| m.order_key());

        if let Ok(mut state) = self.state.lock() {
            let entry = state.entry(conversation_id).or_default();
            entry.has_more = page.has_more;
            if let Some(oldest) = items.first() {
                entry.oldest = Some(oldest.order_key());
            }
        }

        debug!(
            conversation = %conversation_id,
            fetched = items.len(),
            has_more = self.has_more(conversation_id),
            "older page merged"
        );
        Ok(items)
    }
}
