//! Session wiring.
//!
//! [`Session::spawn`] starts the three background workers (realtime listener,
//! outbox drainer, reconciliation timer) and returns a cloneable
//! [`SessionHandle`] plus the notification stream. All UI-facing reads and
//! writes go through the handle; reads are synchronous against the replica
//! (optionally warmed by the TTL caches), writes go through the outbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_shared::constants;
use parley_shared::types::{
    ConnectionPhase, ConversationId, CorrelationId, MessageId, UserId,
};
use parley_store::{Conversation, Database, Message, OutboxEntry, Participant, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::cache::{Singleflight, TtlCache};
use crate::error::{EngineError, Result};
use crate::notify::{EngineNotification, Notifier};
use crate::outbox::{self, OutboxWorker};
use crate::pagination::PaginationCoordinator;
use crate::realtime::RealtimeWorker;
use crate::reconcile::{ReconcileTrigger, Reconciler};
use crate::remote::{with_timeout, RealtimeTransport, RemoteApi};
use crate::replica::Replica;
use crate::view::ViewState;

/// Tuning knobs. [`Default`] mirrors the production constants; tests shrink
/// the timings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub conversation_list_ttl: Duration,
    pub message_page_ttl: Duration,
    pub flight_timeout: Duration,
    pub network_timeout: Duration,
    pub outbox_max_attempts: u32,
    pub outbox_backoff_base: Duration,
    pub outbox_backoff_max: Duration,
    pub outbox_sweep_interval: Duration,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_max: Duration,
    pub reconcile_interval_live: Duration,
    pub reconcile_interval_offline: Duration,
    pub reconcile_stale_after: Duration,
    pub catch_up_page_limit: u32,
    pub page_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversation_list_ttl: constants::CONVERSATION_LIST_TTL,
            message_page_ttl: constants::MESSAGE_PAGE_TTL,
            flight_timeout: constants::FLIGHT_TIMEOUT,
            network_timeout: constants::NETWORK_TIMEOUT,
            outbox_max_attempts: constants::OUTBOX_MAX_ATTEMPTS,
            outbox_backoff_base: constants::OUTBOX_BACKOFF_BASE,
            outbox_backoff_max: constants::OUTBOX_BACKOFF_MAX,
            outbox_sweep_interval: constants::OUTBOX_SWEEP_INTERVAL,
            reconnect_backoff_base: constants::RECONNECT_BACKOFF_BASE,
            reconnect_backoff_max: constants::RECONNECT_BACKOFF_MAX,
            reconcile_interval_live: constants::RECONCILE_INTERVAL_LIVE,
            reconcile_interval_offline: constants::RECONCILE_INTERVAL_OFFLINE,
            reconcile_stale_after: constants::RECONCILE_STALE_AFTER,
            catch_up_page_limit: constants::CATCH_UP_PAGE_LIMIT,
            page_limit: constants::DEFAULT_PAGE_LIMIT,
        }
    }
}

/// The two aggregate-read caches, owned here and shared with the workers for
/// invalidation only.
pub(crate) struct Caches {
    pub list: TtlCache<UserId, Vec<Conversation>>,
    pub pages: TtlCache<ConversationId, Vec<Message>>,
}

impl Caches {
    fn new(config: &SyncConfig) -> Self {
        Self {
            list: TtlCache::new(config.conversation_list_ttl),
            pages: TtlCache::new(config.message_page_ttl),
        }
    }

    /// Every mutation that touches a conversation invalidates both the
    /// owner's list and that conversation's page.
    pub fn invalidate_for(&self, user: &UserId, conversation_id: ConversationId) {
        self.list.invalidate(user);
        self.pages.invalidate(&conversation_id);
    }
}

/// Key space for in-flight fetch deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FlightKey {
    List(UserId),
    Page(ConversationId),
}

pub struct Session;

impl Session {
    /// Start the engine. Must be called from within a tokio runtime.
    pub fn spawn<R: RemoteApi, T: RealtimeTransport>(
        me: UserId,
        db: Database,
        remote: R,
        transport: T,
        config: SyncConfig,
    ) -> (SessionHandle<R>, mpsc::Receiver<EngineNotification>) {
        let config = Arc::new(config);
        let replica = Replica::new(db);
        let remote = Arc::new(remote);
        let transport = Arc::new(transport);
        let caches = Arc::new(Caches::new(&config));
        let view = ViewState::new();
        let pagination = PaginationCoordinator::new();
        let (notifier, notifications) = Notifier::channel(256);

        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resub_tx, resub_rx) = mpsc::channel(8);
        let (wake_tx, wake_rx) = mpsc::channel(8);
        let (trigger_tx, trigger_rx) = mpsc::channel(16);

        let realtime = RealtimeWorker {
            replica: replica.clone(),
            remote: remote.clone(),
            transport,
            me: me.clone(),
            view: view.clone(),
            notifier: notifier.clone(),
            caches: caches.clone(),
            phase_tx,
            resub_tx: resub_tx.clone(),
            resub_rx,
            shutdown: shutdown_rx.clone(),
            config: config.clone(),
        };
        tokio::spawn(realtime.run());

        let outbox_worker = OutboxWorker {
            replica: replica.clone(),
            remote: remote.clone(),
            me: me.clone(),
            notifier: notifier.clone(),
            caches: caches.clone(),
            wake_rx,
            shutdown: shutdown_rx.clone(),
            config: config.clone(),
        };
        tokio::spawn(outbox_worker.run());

        let reconciler = Reconciler {
            replica: replica.clone(),
            remote: remote.clone(),
            me: me.clone(),
            view: view.clone(),
            notifier: notifier.clone(),
            caches: caches.clone(),
            phase_rx: phase_rx.clone(),
            trigger_rx,
            shutdown: shutdown_rx,
            config: config.clone(),
        };
        tokio::spawn(reconciler.run());

        info!(user = %me, "session spawned");

        let handle = SessionHandle {
            me,
            replica,
            remote,
            caches,
            pagination,
            view,
            notifier,
            flights: Arc::new(Singleflight::new(config.flight_timeout)),
            outbox_wake: wake_tx,
            resub_tx,
            trigger_tx,
            phase_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            config,
        };
        (handle, notifications)
    }
}

/// Cloneable handle for the UI-facing layer.
pub struct SessionHandle<R> {
    me: UserId,
    replica: Replica,
    remote: Arc<R>,
    caches: Arc<Caches>,
    pagination: PaginationCoordinator,
    view: ViewState,
    notifier: Notifier,
    flights: Arc<Singleflight<FlightKey>>,
    outbox_wake: mpsc::Sender<()>,
    resub_tx: mpsc::Sender<()>,
    trigger_tx: mpsc::Sender<ReconcileTrigger>,
    phase_rx: watch::Receiver<ConnectionPhase>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    config: Arc<SyncConfig>,
}

impl<R> Clone for SessionHandle<R> {
    fn clone(&self) -> Self {
        Self {
            me: self.me.clone(),
            replica: self.replica.clone(),
            remote: self.remote.clone(),
            caches: self.caches.clone(),
            pagination: self.pagination.clone(),
            view: self.view.clone(),
            notifier: self.notifier.clone(),
            flights: self.flights.clone(),
            outbox_wake: self.outbox_wake.clone(),
            resub_tx: self.resub_tx.clone(),
            trigger_tx: self.trigger_tx.clone(),
            phase_rx: self.phase_rx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            config: self.config.clone(),
        }
    }
}

impl<R: RemoteApi> SessionHandle<R> {
    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Optimistic send: the pending message is visible in the replica before
    /// this returns; the outbox worker delivers it in the background.
    pub fn enqueue_send(
        &self,
        conversation_id: ConversationId,
        body: &str,
    ) -> Result<CorrelationId> {
        let correlation_id = outbox::enqueue(&self.replica, &self.me, conversation_id, body)?;
        self.caches.invalidate_for(&self.me, conversation_id);
        let _ = self.outbox_wake.try_send(());
        Ok(correlation_id)
    }

    /// Terminal failures awaiting user retry or dismissal.
    pub fn failed_sends(&self) -> Result<Vec<OutboxEntry>> {
        self.replica.with(|db| db.failed_outbox_entries())
    }

    /// Reopen a terminal entry for another round of attempts.
    pub fn retry_send(&self, correlation_id: CorrelationId) -> Result<bool> {
        let reopened = self
            .replica
            .with(|db| db.reset_outbox_entry(correlation_id, Utc::now()))?;
        if reopened {
            let _ = self.outbox_wake.try_send(());
        }
        Ok(reopened)
    }

    /// Drop a terminal entry and soft-delete its provisional message.
    pub fn dismiss_send(&self, correlation_id: CorrelationId) -> Result<bool> {
        let entry = match self.replica.with(|db| db.get_outbox_entry(correlation_id)) {
            Ok(entry) => entry,
            Err(EngineError::Store(StoreError::NotFound)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.replica.with(|db| {
            db.remove_outbox_entry(correlation_id)?;
            db.mark_message_deleted(entry.message_id, Utc::now())?;
            Ok(())
        })?;
        self.caches.invalidate_for(&self.me, entry.conversation_id);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Cached aggregate reads
    // ------------------------------------------------------------------

    /// The user's conversation list, newest activity first.
    ///
    /// Served from the TTL cache when warm; otherwise one deduplicated remote
    /// fetch refreshes the replica. A transient remote failure degrades to
    /// the local replica instead of erroring — reads keep working offline.
    pub async fn conversation_list(&self) -> Result<Vec<Conversation>> {
        if let Some(list) = self.caches.list.get(&self.me) {
            return Ok(list);
        }

        match self.flights.join(FlightKey::List(self.me.clone())).await {
            Some(_guard) => {
                let fetched = with_timeout(
                    "list_conversations",
                    self.config.network_timeout,
                    self.remote
                        .list_conversations(&self.me, None, self.config.page_limit),
                )
                .await;
                match fetched {
                    Ok(page) => {
                        self.replica.with(|db| {
                            for conversation in &page.items {
                                db.upsert_conversation(conversation)?;
                            }
                            Ok(())
                        })?;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "conversation list fetch failed, serving replica");
                    }
                    Err(e) => return Err(e.into()),
                }
                let list = self.replica.with(|db| db.list_conversations())?;
                self.caches.list.put(self.me.clone(), list.clone());
                Ok(list)
            }
            None => {
                if let Some(list) = self.caches.list.get(&self.me) {
                    return Ok(list);
                }
                self.replica.with(|db| db.list_conversations())
            }
        }
    }

    /// The initial (newest) message page of a conversation.
    pub async fn message_page(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        if let Some(page) = self.caches.pages.get(&conversation_id) {
            return Ok(page);
        }

        match self.flights.join(FlightKey::Page(conversation_id)).await {
            Some(_guard) => {
                let fetched = with_timeout(
                    "list_messages",
                    self.config.network_timeout,
                    self.remote
                        .list_messages(conversation_id, None, self.config.page_limit),
                )
                .await;
                match fetched {
                    Ok(page) => {
                        self.replica.with(|db| {
                            for message in &page.items {
                                db.upsert_message(message)?;
                            }
                            Ok(())
                        })?;
                        let mut items = page.items;
                        items.sort_by_key(|m| m.order_key());
                        self.pagination
                            .note_initial(conversation_id, &items, page.has_more);
                    }
                    Err(e) if e.is_transient() => {
                        warn!(error = %e, "message page fetch failed, serving replica");
                    }
                    Err(e) => return Err(e.into()),
                }
                let page = self.replica.with(|db| {
                    db.messages_before(conversation_id, None, self.config.page_limit)
                })?;
                self.pagination.note_loaded(conversation_id, &page);
                self.caches.pages.put(conversation_id, page.clone());
                Ok(page)
            }
            None => {
                if let Some(page) = self.caches.pages.get(&conversation_id) {
                    return Ok(page);
                }
                self.replica.with(|db| {
                    db.messages_before(conversation_id, None, self.config.page_limit)
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Pagination
    // ------------------------------------------------------------------

    /// Load the page older than the current frontier into the replica.
    pub async fn load_older(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.pagination
            .load_older(
                &self.replica,
                &self.remote,
                &self.config,
                conversation_id,
                self.config.page_limit,
            )
            .await
    }

    pub fn has_more_history(&self, conversation_id: ConversationId) -> bool {
        self.pagination.has_more(conversation_id)
    }

    /// Pull-to-refresh equivalent: forget pagination state and the cached
    /// page, then fetch a fresh head.
    pub async fn refresh(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.pagination.reset(conversation_id);
        self.caches.pages.invalidate(&conversation_id);
        self.message_page(conversation_id).await
    }

    // ------------------------------------------------------------------
    // View lifecycle & read state
    // ------------------------------------------------------------------

    /// The conversation detail view became foreground-most. Unread clearing
    /// is driven separately by [`Self::mark_displayed`], which receives the
    /// subset of messages actually materialized on screen.
    pub fn enter_conversation(&self, conversation_id: ConversationId) {
        self.view.enter_conversation(conversation_id);
    }

    pub fn leave_conversation(&self, conversation_id: ConversationId) {
        self.view.leave_conversation(conversation_id);
    }

    pub fn set_app_foreground(&self, foreground: bool) {
        self.view.set_app_foreground(foreground);
        if foreground {
            let _ = self.trigger_tx.try_send(ReconcileTrigger::Foregrounded);
        }
    }

    /// The conversation-list view became visible; reconciles if stale.
    pub fn entered_conversation_list(&self) {
        let _ = self
            .trigger_tx
            .try_send(ReconcileTrigger::EnteredConversationList);
    }

    /// Incremental read-state clearing: only the messages the UI actually
    /// materialized are marked, never a conversation's whole backlog.
    ///
    /// Remote failures surface to the caller; local receipts are kept either
    /// way and the next reconciliation pass squares the counters.
    pub async fn mark_displayed(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<()> {
        let marked = self
            .replica
            .with(|db| db.mark_read(&self.me, message_ids, Utc::now()))?;
        if marked.is_empty() {
            return Ok(());
        }

        // Subtract exactly what was displayed; the counter may cover backlog
        // the replica has not loaded yet, so a local recount would lie.
        let badge = self.replica.with(|db| {
            db.decrement_unread(conversation_id, marked.len() as i64)?;
            db.badge()
        })?;
        self.caches.invalidate_for(&self.me, conversation_id);
        self.notifier
            .emit(EngineNotification::BadgeChanged { total: badge });

        let acked = with_timeout(
            "mark_read",
            self.config.network_timeout,
            self.remote.mark_read(conversation_id, &marked),
        )
        .await;
        let _ = self.trigger_tx.try_send(ReconcileTrigger::AfterMarkRead);
        acked.map_err(EngineError::from)
    }

    // ------------------------------------------------------------------
    // Unread state
    // ------------------------------------------------------------------

    pub fn badge(&self) -> Result<i64> {
        self.replica.with(|db| db.badge())
    }

    pub fn unread_counts(&self) -> Result<HashMap<ConversationId, i64>> {
        self.replica.with(|db| db.unread_counts())
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Soft-delete a message locally (sets `deleted_at` only).
    pub fn delete_local(&self, message_id: MessageId) -> Result<()> {
        let message = self.replica.with(|db| db.get_message(message_id))?;
        self.replica
            .with(|db| db.mark_message_deleted(message_id, Utc::now()).map(|_| ()))?;
        self.caches.pages.invalidate(&message.conversation_id);
        Ok(())
    }

    /// Archive a conversation. The row survives; its counter is dropped and
    /// the subscription scope shrinks on the next resubscribe.
    pub fn archive_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.replica.with(|db| {
            db.set_archived(conversation_id, true)?;
            db.clear_unread(conversation_id)?;
            Ok(())
        })?;
        self.caches.invalidate_for(&self.me, conversation_id);
        let _ = self.resub_tx.try_send(());
        let badge = self.replica.with(|db| db.badge())?;
        self.notifier
            .emit(EngineNotification::BadgeChanged { total: badge });
        Ok(())
    }

    /// Record a membership addition (or re-join).
    pub fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        let conversation_id = participant.conversation_id;
        self.replica.with(|db| db.upsert_participant(participant))?;
        self.caches.invalidate_for(&self.me, conversation_id);
        Ok(())
    }

    /// Record that a user left a conversation; they stop receiving fan-out
    /// but keep their historical attribution.
    pub fn mark_participant_left(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .replica
            .with(|db| db.mark_participant_left(conversation_id, user_id, at))?;
        if changed {
            self.caches.invalidate_for(&self.me, conversation_id);
        }
        Ok(changed)
    }

    /// Participants that have not left the conversation.
    pub fn active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>> {
        self.replica.with(|db| db.active_participants(conversation_id))
    }

    // ------------------------------------------------------------------
    // Introspection & lifecycle
    // ------------------------------------------------------------------

    pub fn connection_phase(&self) -> ConnectionPhase {
        *self.phase_rx.borrow()
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Stop all background workers.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parley_shared::event::{DeleteEvent, MessageEvent, RealtimeEvent};
    use parley_shared::types::ConnectionPhase;

    use crate::testing::{
        confirmed, conversation, test_config, wait_until, MockRemote, TestTransport,
    };

    struct Harness {
        handle: SessionHandle<Arc<MockRemote>>,
        notifications: mpsc::Receiver<EngineNotification>,
        remote: Arc<MockRemote>,
        transport: Arc<TestTransport>,
        me: UserId,
        conv: ConversationId,
    }

    /// Spawn a session over one seeded conversation.
    fn start() -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let me = UserId::from("me");
        let remote = MockRemote::new(me.clone());
        let transport = TestTransport::new();

        let db = Database::open_in_memory().unwrap();
        let conv = conversation(Utc::now());
        db.upsert_conversation(&conv).unwrap();
        remote.add_conversation(conv.clone());

        let (handle, notifications) = Session::spawn(
            me.clone(),
            db,
            remote.clone(),
            transport.clone(),
            test_config(),
        );
        Harness {
            handle,
            notifications,
            remote,
            transport,
            me,
            conv: conv.id,
        }
    }

    fn insert_event(conv: ConversationId, message: &Message) -> RealtimeEvent {
        RealtimeEvent::Insert(MessageEvent {
            conversation_id: conv,
            message_id: message.id,
            sender_id: message.sender_id.clone(),
            timestamp: message.created_at,
            body: Some(message.body.clone()),
        })
    }

    async fn wait_live(h: &Harness) {
        let handle = h.handle.clone();
        wait_until("realtime goes live", || {
            handle.connection_phase() == ConnectionPhase::Live
        })
        .await;
    }

    #[tokio::test]
    async fn offline_send_converges_to_one_confirmed_message() {
        let mut h = start();
        h.remote.set_offline(true);
        h.transport.set_offline(true);

        let correlation = h.handle.enqueue_send(h.conv, "hi").unwrap();

        // Visible immediately, flagged pending.
        let page = h
            .handle
            .replica()
            .with(|db| db.messages_before(h.conv, None, 10))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].pending);

        // Let a couple of attempts fail, then restore connectivity.
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.remote.set_offline(false);
        h.transport.set_offline(false);

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("send confirmed", || {
            let page = handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap();
            page.len() == 1 && !page[0].pending
        })
        .await;

        // The queue is empty and exactly one delivery happened.
        assert!(h.handle.failed_sends().unwrap().is_empty());
        assert_eq!(h.remote.send_count(), 1);

        let notified = drain(&mut h.notifications);
        assert!(notified.iter().any(|n| matches!(
            n,
            EngineNotification::MessageConfirmed { correlation_id, .. }
                if *correlation_id == correlation
        )));
    }

    #[tokio::test]
    async fn duplicate_insert_event_applies_once() {
        let h = start();
        wait_live(&h).await;

        let msg = confirmed(h.conv, "u-2", "hello", Utc::now());
        let event = insert_event(h.conv, &msg);
        assert!(h.transport.push(&event));
        assert!(h.transport.push(&event));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("message applied", || {
            !handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .is_empty()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let page = h
            .handle
            .replica()
            .with(|db| db.messages_before(h.conv, None, 10))
            .unwrap();
        assert_eq!(page.len(), 1);
        // The fast path bumped the counter exactly once.
        assert_eq!(h.handle.badge().unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_does_not_halt_the_stream() {
        let h = start();
        wait_live(&h).await;

        assert!(h.transport.push_raw(b"not json at all".to_vec()));
        let msg = confirmed(h.conv, "u-2", "after the bad frame", Utc::now());
        assert!(h.transport.push(&insert_event(h.conv, &msg)));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("good event still applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 1
        })
        .await;
    }

    #[tokio::test]
    async fn foregrounding_overwrites_badge_from_server() {
        let h = start();

        let other = conversation(Utc::now());
        h.handle
            .replica()
            .with(|db| db.upsert_conversation(&other).map(|_| ()))
            .unwrap();
        h.remote.add_conversation(other.clone());
        h.remote
            .set_unread([(h.conv, 2i64), (other.id, 3i64)].into_iter().collect());

        // No realtime events were seen for the missed messages; the
        // authoritative pass alone must land the badge on 5.
        h.handle.set_app_foreground(true);

        let handle = h.handle.clone();
        wait_until("badge reconciled", || handle.badge().unwrap() == 5).await;
        assert_eq!(h.handle.unread_counts().unwrap()[&h.conv], 2);
        assert_eq!(h.handle.unread_counts().unwrap()[&other.id], 3);
    }

    #[tokio::test]
    async fn incremental_clearing_marks_only_displayed_messages() {
        let h = start();
        let base = Utc::now();

        let all: Vec<Message> = (0..10)
            .map(|i| {
                confirmed(
                    h.conv,
                    "u-2",
                    &format!("m{i}"),
                    base + chrono::Duration::seconds(i),
                )
            })
            .collect();
        h.handle
            .replica()
            .with(|db| {
                for m in &all {
                    db.upsert_message(m)?;
                }
                db.recompute_unread(h.conv, &h.me)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(h.handle.badge().unwrap(), 10);

        // Only the newest 6 are materialized on screen.
        let displayed: Vec<MessageId> = all[4..].iter().map(|m| m.id).collect();
        h.handle.mark_displayed(h.conv, &displayed).await.unwrap();
        assert_eq!(h.handle.badge().unwrap(), 4);

        // The remote side was told about exactly those 6.
        let marked = h.remote.marked_read();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].1.len(), 6);

        // Scrolling loads the rest; the counter reaches zero.
        let rest: Vec<MessageId> = all[..4].iter().map(|m| m.id).collect();
        h.handle.mark_displayed(h.conv, &rest).await.unwrap();
        assert_eq!(h.handle.badge().unwrap(), 0);

        // Replaying the same display report changes nothing.
        h.handle.mark_displayed(h.conv, &displayed).await.unwrap();
        assert_eq!(h.handle.badge().unwrap(), 0);
    }

    #[tokio::test]
    async fn reconnect_catch_up_closes_the_gap_without_duplicates() {
        let h = start();
        wait_live(&h).await;

        let base = Utc::now();
        let a = confirmed(h.conv, "u-2", "before the drop", base);
        h.remote.add_message(a.clone());
        assert!(h.transport.push(&insert_event(h.conv, &a)));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("first message applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 1
        })
        .await;

        // The stream drops; two messages land server-side meanwhile.
        let connects_before = h.transport.connect_count();
        h.transport.disconnect();
        let b = confirmed(h.conv, "u-2", "while offline 1", base + chrono::Duration::seconds(1));
        let c = confirmed(h.conv, "u-2", "while offline 2", base + chrono::Duration::seconds(2));
        h.remote.add_message(b.clone());
        h.remote.add_message(c.clone());

        let transport = h.transport.clone();
        wait_until("reconnected", || {
            transport.connect_count() > connects_before
        })
        .await;

        let handle = h.handle.clone();
        wait_until("catch-up applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 3
        })
        .await;

        let bodies: Vec<String> = h
            .handle
            .replica()
            .with(|db| db.messages_before(h.conv, None, 10))
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(
            bodies,
            vec!["before the drop", "while offline 1", "while offline 2"]
        );
    }

    #[tokio::test]
    async fn permanent_send_failure_goes_terminal_then_retries() {
        let mut h = start();
        h.remote.fail_sends_permanently("body rejected");

        let correlation = h.handle.enqueue_send(h.conv, "bad message").unwrap();

        let handle = h.handle.clone();
        wait_until("entry goes terminal", || {
            handle.failed_sends().unwrap().len() == 1
        })
        .await;

        // No retries for permanent failures: one attempt, one terminal entry.
        assert_eq!(h.remote.send_count(), 0);
        let failed = h.handle.failed_sends().unwrap();
        assert_eq!(failed[0].correlation_id, correlation);
        assert_eq!(failed[0].last_error.as_deref(), Some("Permanent request error: body rejected"));

        let notified = drain(&mut h.notifications);
        assert!(notified
            .iter()
            .any(|n| matches!(n, EngineNotification::SendFailed { .. })));

        // User-initiated retry succeeds once the server accepts the body.
        h.remote.clear_send_failure();
        assert!(h.handle.retry_send(correlation).unwrap());

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("retried send confirmed", || {
            handle.failed_sends().unwrap().is_empty()
                && handle
                    .replica()
                    .with(|db| db.messages_before(conv, None, 10))
                    .unwrap()
                    .iter()
                    .any(|m| !m.pending)
        })
        .await;
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_retry_budget() {
        let h = start();
        h.remote.set_offline(true);
        h.transport.set_offline(true);

        h.handle.enqueue_send(h.conv, "never arrives").unwrap();

        let handle = h.handle.clone();
        wait_until("budget exhausted", || {
            handle.failed_sends().unwrap().len() == 1
        })
        .await;

        let entry = &h.handle.failed_sends().unwrap()[0];
        assert_eq!(entry.attempts + 1, test_config().outbox_max_attempts);
    }

    #[tokio::test]
    async fn actively_viewed_conversation_gains_no_unread() {
        let h = start();
        wait_live(&h).await;

        h.handle.set_app_foreground(true);
        h.handle.enter_conversation(h.conv);

        let msg = confirmed(h.conv, "u-2", "watched live", Utc::now());
        assert!(h.transport.push(&insert_event(h.conv, &msg)));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("message applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 1
        })
        .await;
        assert_eq!(h.handle.badge().unwrap(), 0);

        // Backgrounded: the same flow counts.
        h.handle.set_app_foreground(false);
        let msg2 = confirmed(h.conv, "u-2", "missed", Utc::now());
        assert!(h.transport.push(&insert_event(h.conv, &msg2)));

        let handle = h.handle.clone();
        wait_until("unread bumped", || handle.badge().unwrap() == 1).await;
    }

    #[tokio::test]
    async fn delete_event_never_touches_content() {
        let h = start();
        wait_live(&h).await;

        let msg = confirmed(h.conv, "u-2", "still here", Utc::now());
        assert!(h.transport.push(&insert_event(h.conv, &msg)));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("insert applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 1
        })
        .await;

        let deleted_at = msg.created_at + chrono::Duration::seconds(1);
        assert!(h.transport.push(&RealtimeEvent::Delete(DeleteEvent {
            conversation_id: h.conv,
            message_id: msg.id,
            sender_id: msg.sender_id.clone(),
            timestamp: deleted_at,
        })));

        let handle = h.handle.clone();
        wait_until("delete applied", || {
            handle
                .replica()
                .with(|db| db.get_message(msg.id))
                .unwrap()
                .deleted_at
                .is_some()
        })
        .await;

        let stored = h.handle.replica().with(|db| db.get_message(msg.id)).unwrap();
        assert_eq!(stored.body, "still here");
        assert_eq!(stored.deleted_at, Some(deleted_at));
        // The deleted message no longer counts as unread.
        assert_eq!(h.handle.badge().unwrap(), 0);
    }

    #[tokio::test]
    async fn subscription_scope_grows_with_new_conversations() {
        let h = start();
        wait_live(&h).await;
        assert_eq!(h.transport.last_scope(), vec![h.conv]);

        // A conversation we have never seen locally starts existing
        // server-side; its first message arrives on the stream.
        let newcomer = conversation(Utc::now());
        h.remote.add_conversation(newcomer.clone());
        let msg = confirmed(newcomer.id, "u-3", "first contact", Utc::now());
        assert!(h.transport.push(&insert_event(newcomer.id, &msg)));

        // Metadata is fetched before the message lands, and the stream is
        // reopened with the grown scope.
        let handle = h.handle.clone();
        wait_until("conversation + message applied", || {
            handle
                .replica()
                .with(|db| {
                    Ok(db.conversation_exists(newcomer.id)?
                        && db.messages_before(newcomer.id, None, 10)?.len() == 1)
                })
                .unwrap()
        })
        .await;

        let transport = h.transport.clone();
        wait_until("resubscribed with both conversations", || {
            transport.is_connected() && transport.last_scope().len() == 2
        })
        .await;
    }

    #[tokio::test]
    async fn key_only_update_fetches_the_authoritative_row() {
        let h = start();
        wait_live(&h).await;

        let msg = confirmed(h.conv, "u-2", "original", Utc::now());
        h.remote.add_message(msg.clone());
        assert!(h.transport.push(&insert_event(h.conv, &msg)));

        let handle = h.handle.clone();
        let conv = h.conv;
        wait_until("insert applied", || {
            handle
                .replica()
                .with(|db| db.messages_before(conv, None, 10))
                .unwrap()
                .len()
                == 1
        })
        .await;

        // Server-side edit; the update event carries only the key.
        let edited_at = msg.created_at + chrono::Duration::seconds(5);
        let mut edited = msg.clone();
        edited.body = "edited on the server".into();
        edited.edited_at = Some(edited_at);
        h.remote.replace_message(edited);

        assert!(h.transport.push(&RealtimeEvent::Update(MessageEvent {
            conversation_id: h.conv,
            message_id: msg.id,
            sender_id: msg.sender_id.clone(),
            timestamp: edited_at,
            body: None,
        })));

        let handle = h.handle.clone();
        wait_until("edit applied from authoritative row", || {
            handle
                .replica()
                .with(|db| db.get_message(msg.id))
                .unwrap()
                .body
                == "edited on the server"
        })
        .await;
    }

    fn drain(rx: &mut mpsc::Receiver<EngineNotification>) -> Vec<EngineNotification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }
}
