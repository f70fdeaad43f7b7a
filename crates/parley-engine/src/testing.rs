//! In-memory fakes for the remote interface, shared by the engine's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_shared::event::RealtimeEvent;
use parley_shared::types::{ConversationId, ConversationKind, CorrelationId, MessageId, UserId};
use parley_shared::RemoteError;
use parley_store::{Conversation, Message};
use tokio::sync::mpsc;

use crate::remote::{Page, RealtimeTransport, RemoteApi};
use crate::session::SyncConfig;

pub(crate) fn test_config() -> SyncConfig {
    SyncConfig {
        conversation_list_ttl: Duration::from_millis(500),
        message_page_ttl: Duration::from_millis(500),
        flight_timeout: Duration::from_millis(500),
        network_timeout: Duration::from_millis(500),
        outbox_max_attempts: 6,
        outbox_backoff_base: Duration::from_millis(10),
        outbox_backoff_max: Duration::from_millis(50),
        outbox_sweep_interval: Duration::from_millis(25),
        reconnect_backoff_base: Duration::from_millis(10),
        reconnect_backoff_max: Duration::from_millis(50),
        reconcile_interval_live: Duration::from_secs(300),
        reconcile_interval_offline: Duration::from_secs(300),
        reconcile_stale_after: Duration::from_millis(0),
        catch_up_page_limit: 50,
        page_limit: 50,
    }
}

pub(crate) fn conversation(at: DateTime<Utc>) -> Conversation {
    Conversation {
        id: ConversationId::new(),
        kind: ConversationKind::Group,
        title: Some("test".into()),
        image_ref: None,
        created_at: at,
        last_activity_at: at,
        archived: false,
    }
}

pub(crate) fn confirmed(
    conversation_id: ConversationId,
    sender: &str,
    body: &str,
    at: DateTime<Utc>,
) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id,
        sender_id: UserId::from(sender),
        body: body.into(),
        created_at: at,
        pending: false,
        edited_at: None,
        deleted_at: None,
    }
}

/// Poll until `f` holds or a few seconds elapse.
pub(crate) async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Mock remote API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    /// `None` makes `fetch_unread_counts` fail transiently, which keeps the
    /// reconciler from overwriting counters in tests that exercise the fast
    /// path alone.
    unread: Option<HashMap<ConversationId, i64>>,
    offline: bool,
    permanent_send_error: Option<String>,
    send_count: usize,
    marked_read: Vec<(ConversationId, Vec<MessageId>)>,
}

pub(crate) struct MockRemote {
    me: UserId,
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self {
            me,
            state: Mutex::new(MockState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.lock()
            .conversations
            .insert(conversation.id, conversation);
    }

    pub fn add_message(&self, message: Message) {
        self.lock()
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    /// Replace a stored message wholesale (server-side edit).
    pub fn replace_message(&self, message: Message) {
        let mut state = self.lock();
        let list = state.messages.entry(message.conversation_id).or_default();
        list.retain(|m| m.id != message.id);
        list.push(message);
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_unread(&self, counts: HashMap<ConversationId, i64>) {
        self.lock().unread = Some(counts);
    }

    pub fn fail_sends_permanently(&self, error: &str) {
        self.lock().permanent_send_error = Some(error.to_string());
    }

    pub fn clear_send_failure(&self) {
        self.lock().permanent_send_error = None;
    }

    pub fn send_count(&self) -> usize {
        self.lock().send_count
    }

    pub fn marked_read(&self) -> Vec<(ConversationId, Vec<MessageId>)> {
        self.lock().marked_read.clone()
    }

    fn check_online(state: &MockState, op: &str) -> Result<(), RemoteError> {
        if state.offline {
            Err(RemoteError::Transient(format!("{op}: connection refused")))
        } else {
            Ok(())
        }
    }
}

impl RemoteApi for Arc<MockRemote> {
    async fn list_conversations(
        &self,
        _user: &UserId,
        _before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Page<Conversation>, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "list_conversations")?;
        let mut items: Vec<_> = state.conversations.values().cloned().collect();
        items.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        items.truncate(limit as usize);
        Ok(Page {
            items,
            has_more: false,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<(DateTime<Utc>, MessageId)>,
        limit: u32,
    ) -> Result<Page<Message>, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "list_messages")?;
        let mut all: Vec<_> = state
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        all.sort_by_key(|m| m.order_key());
        if let Some(cursor) = before {
            all.retain(|m| m.order_key() < cursor);
        }
        let total = all.len();
        let items: Vec<_> = all.into_iter().rev().take(limit as usize).rev().collect();
        Ok(Page {
            has_more: total > items.len(),
            items,
        })
    }

    async fn list_messages_since(
        &self,
        conversation_id: ConversationId,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Page<Message>, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "list_messages_since")?;
        let mut items: Vec<_> = state
            .messages
            .get(&conversation_id)
            .map(|list| {
                list.iter()
                    .filter(|m| m.created_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by_key(|m| m.order_key());
        let total = items.len();
        items.truncate(limit as usize);
        Ok(Page {
            has_more: total > items.len(),
            items,
        })
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        body: &str,
        _correlation_id: CorrelationId,
    ) -> Result<Message, RemoteError> {
        let mut state = self.lock();
        MockRemote::check_online(&state, "send_message")?;
        if let Some(error) = &state.permanent_send_error {
            return Err(RemoteError::Permanent(error.clone()));
        }
        let message = Message {
            id: MessageId::new(),
            conversation_id,
            sender_id: self.me.clone(),
            body: body.to_string(),
            created_at: Utc::now(),
            pending: false,
            edited_at: None,
            deleted_at: None,
        };
        state
            .messages
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        state.send_count += 1;
        Ok(message)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        MockRemote::check_online(&state, "mark_read")?;
        state
            .marked_read
            .push((conversation_id, message_ids.to_vec()));
        Ok(())
    }

    async fn fetch_unread_counts(
        &self,
        _user: &UserId,
    ) -> Result<HashMap<ConversationId, i64>, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "fetch_unread_counts")?;
        state
            .unread
            .clone()
            .ok_or_else(|| RemoteError::Transient("unread endpoint unavailable".into()))
    }

    async fn fetch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Conversation, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "fetch_conversation")?;
        state
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or_else(|| RemoteError::Permanent("unknown conversation".into()))
    }

    async fn fetch_message(&self, message_id: MessageId) -> Result<Message, RemoteError> {
        let state = self.lock();
        MockRemote::check_online(&state, "fetch_message")?;
        state
            .messages
            .values()
            .flatten()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| RemoteError::Permanent("unknown message".into()))
    }
}

// ---------------------------------------------------------------------------
// Scripted realtime transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    current: Option<mpsc::Sender<Vec<u8>>>,
    offline: bool,
    connects: usize,
    last_scope: Vec<ConversationId>,
}

pub(crate) struct TestTransport {
    state: Mutex<TransportState>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TransportState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.state.lock().expect("transport state poisoned")
    }

    /// Deliver an event frame on the live stream. Returns false when no
    /// subscription is open.
    pub fn push(&self, event: &RealtimeEvent) -> bool {
        let raw = serde_json::to_vec(event).expect("event serializes");
        let state = self.lock();
        match &state.current {
            Some(tx) => tx.try_send(raw).is_ok(),
            None => false,
        }
    }

    /// Push raw bytes, for malformed-frame tests.
    pub fn push_raw(&self, raw: Vec<u8>) -> bool {
        let state = self.lock();
        match &state.current {
            Some(tx) => tx.try_send(raw).is_ok(),
            None => false,
        }
    }

    /// Close the live stream; the worker will reconnect.
    pub fn disconnect(&self) {
        self.lock().current = None;
    }

    pub fn set_offline(&self, offline: bool) {
        let mut state = self.lock();
        state.offline = offline;
        if offline {
            state.current = None;
        }
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn last_scope(&self) -> Vec<ConversationId> {
        self.lock().last_scope.clone()
    }
}

impl RealtimeTransport for Arc<TestTransport> {
    async fn connect(
        &self,
        scope: &[ConversationId],
    ) -> Result<mpsc::Receiver<Vec<u8>>, RemoteError> {
        let mut state = self.lock();
        if state.offline {
            return Err(RemoteError::Transient("subscribe: connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.current = Some(tx);
        state.connects += 1;
        state.last_scope = scope.to_vec();
        Ok(rx)
    }
}
