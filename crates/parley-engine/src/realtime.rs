//! Realtime sync engine.
//!
//! A single worker owns the subscription lifecycle as an explicit state
//! machine — `Disconnected → Connecting → CatchingUp → Live` — and folds
//! every stream event into the replica through the store's idempotent merge.
//! The catch-up fetch after each (re)connection is the one place that closes
//! disconnect gaps; without it, events emitted while offline would be lost.

use std::sync::Arc;

use parley_shared::event::{DeleteEvent, MessageEvent, RealtimeEvent};
use parley_shared::types::{ConnectionPhase, ConversationId, UserId};
use parley_store::{Message, StoreError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::notify::{EngineNotification, Notifier};
use crate::outbox::backoff_with_jitter;
use crate::remote::{with_timeout, RealtimeTransport, RemoteApi};
use crate::replica::Replica;
use crate::session::{Caches, SyncConfig};
use crate::view::ViewState;

/// Background worker owning the realtime subscription.
pub(crate) struct RealtimeWorker<R, T> {
    pub replica: Replica,
    pub remote: Arc<R>,
    pub transport: Arc<T>,
    pub me: UserId,
    pub view: ViewState,
    pub notifier: Notifier,
    pub caches: Arc<Caches>,
    pub phase_tx: watch::Sender<ConnectionPhase>,
    /// Self-signal: the subscription scope grew and the stream must be
    /// reopened. The session handle holds a sender too.
    pub resub_tx: mpsc::Sender<()>,
    pub resub_rx: mpsc::Receiver<()>,
    pub shutdown: watch::Receiver<bool>,
    pub config: Arc<SyncConfig>,
}

impl<R: RemoteApi, T: RealtimeTransport> RealtimeWorker<R, T> {
    pub(crate) async fn run(mut self) {
        info!("realtime worker started");
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.set_phase(ConnectionPhase::Connecting);

            // Fan-out scope: exactly the conversations this user is in.
            let scope = match self.replica.with(|db| db.conversation_ids()) {
                Ok(scope) => scope,
                Err(e) => {
                    warn!(error = %e, "failed to read subscription scope");
                    Vec::new()
                }
            };

            let connected = with_timeout(
                "subscribe",
                self.config.network_timeout,
                self.transport.connect(&scope),
            )
            .await;

            let mut stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "realtime connect failed");
                    self.set_phase(ConnectionPhase::Disconnected);
                    attempt += 1;
                    if self.backoff_sleep(attempt).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_phase(ConnectionPhase::CatchingUp);
            if let Err(e) = self.catch_up(&scope).await {
                warn!(error = %e, "catch-up fetch failed, reconnecting");
                self.set_phase(ConnectionPhase::Disconnected);
                attempt += 1;
                if self.backoff_sleep(attempt).await {
                    break;
                }
                continue;
            }

            attempt = 0;
            self.set_phase(ConnectionPhase::Live);

            let keep_running = loop {
                tokio::select! {
                    _ = self.shutdown.changed() => break false,
                    Some(_) = self.resub_rx.recv() => {
                        debug!("subscription scope changed, reopening stream");
                        break true;
                    }
                    frame = stream.recv() => match frame {
                        Some(raw) => self.handle_frame(raw).await,
                        None => {
                            info!("realtime stream closed");
                            break true;
                        }
                    }
                }
            };

            self.set_phase(ConnectionPhase::Disconnected);
            if !keep_running {
                break;
            }
        }
        info!("realtime worker stopped");
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        if *self.phase_tx.borrow() != phase {
            let _ = self.phase_tx.send(phase);
            self.notifier
                .emit(EngineNotification::ConnectionChanged { phase });
        }
    }

    /// Sleep with backoff; returns `true` when shutdown fired during the wait.
    async fn backoff_sleep(&mut self, attempt: u32) -> bool {
        let delay = backoff_with_jitter(
            self.config.reconnect_backoff_base,
            self.config.reconnect_backoff_max,
            attempt,
        );
        tokio::select! {
            _ = self.shutdown.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Fetch everything newer than the newest locally-confirmed message of
    /// each subscribed conversation and merge it in. Conversations with no
    /// confirmed history are left to the initial page fetch.
    async fn catch_up(&self, scope: &[ConversationId]) -> Result<()> {
        for &conversation_id in scope {
            let Some(mut since) = self
                .replica
                .with(|db| db.newest_confirmed_at(conversation_id))?
            else {
                continue;
            };

            // Bounded page walk; a server that keeps reporting more pages
            // cannot pin the worker in CatchingUp forever.
            for _ in 0..64 {
                let page = with_timeout(
                    "catch_up",
                    self.config.network_timeout,
                    self.remote.list_messages_since(
                        conversation_id,
                        since,
                        self.config.catch_up_page_limit,
                    ),
                )
                .await?;

                let count = page.items.len();
                for message in page.items {
                    since = since.max(message.created_at);
                    self.apply_confirmed_insert(message).await?;
                }
                if !page.has_more || count == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, raw: Vec<u8>) {
        let event = match RealtimeEvent::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                // One bad event must not halt the stream.
                warn!(error = %e, "dropping undecodable realtime frame");
                return;
            }
        };
        if let Err(e) = self.apply_event(event).await {
            warn!(error = %e, "failed to apply realtime event");
        }
    }

    async fn apply_event(&self, event: RealtimeEvent) -> Result<()> {
        match event {
            RealtimeEvent::Insert(ev) => self.apply_insert(ev).await,
            RealtimeEvent::Update(ev) => self.apply_update(ev).await,
            RealtimeEvent::Delete(ev) => self.apply_delete(ev),
        }
    }

    async fn apply_insert(&self, ev: MessageEvent) -> Result<()> {
        // Conversation metadata first: a message row must never reference an
        // unknown conversation.
        self.ensure_conversation(ev.conversation_id).await?;

        let message = match ev.body {
            Some(body) => Message {
                id: ev.message_id,
                conversation_id: ev.conversation_id,
                sender_id: ev.sender_id,
                body,
                created_at: ev.timestamp,
                pending: false,
                edited_at: None,
                deleted_at: None,
            },
            None => {
                with_timeout(
                    "fetch_message",
                    self.config.network_timeout,
                    self.remote.fetch_message(ev.message_id),
                )
                .await?
            }
        };
        self.apply_confirmed_insert(message).await
    }

    /// Shared by the live stream and the catch-up fetch so both paths update
    /// counters and notifications identically.
    async fn apply_confirmed_insert(&self, message: Message) -> Result<()> {
        let conversation_id = message.conversation_id;
        self.ensure_conversation(conversation_id).await?;

        if message.sender_id == self.me {
            return self.apply_own_echo(message);
        }

        let outcome = self.replica.with(|db| {
            let outcome = db.upsert_message(&message)?;
            if outcome.applied() {
                db.touch_conversation(conversation_id, message.created_at)?;
            }
            Ok(outcome)
        })?;

        if !outcome.applied() {
            // Duplicate delivery: nothing changed, so no counter bump either.
            return Ok(());
        }
        self.caches.invalidate_for(&self.me, conversation_id);

        // The predicate is evaluated now, as the event is processed.
        if self.view.is_actively_viewing(conversation_id) {
            return Ok(());
        }

        let (count, badge) = self.replica.with(|db| {
            let count = db.increment_unread(conversation_id)?;
            Ok((count, db.badge()?))
        })?;
        self.notifier.emit(EngineNotification::NewUnread {
            conversation_id,
            count,
        });
        self.notifier
            .emit(EngineNotification::BadgeChanged { total: badge });
        Ok(())
    }

    /// An echo of our own message: settle the matching outbox entry if the
    /// send response has not already done so.
    fn apply_own_echo(&self, message: Message) -> Result<()> {
        let conversation_id = message.conversation_id;
        let matched = self
            .replica
            .with(|db| db.match_pending_echo(&self.me, &message))?;

        let confirmed_entry = match matched {
            Some(entry) => {
                self.replica.with(|db| {
                    db.replace_pending(entry.message_id, &message)?;
                    db.remove_outbox_entry(entry.correlation_id)?;
                    db.touch_conversation(conversation_id, message.created_at)?;
                    Ok(())
                })?;
                Some(entry)
            }
            None => {
                let outcome = self.replica.with(|db| {
                    let outcome = db.upsert_message(&message)?;
                    if outcome.applied() {
                        db.touch_conversation(conversation_id, message.created_at)?;
                    }
                    Ok(outcome)
                })?;
                if !outcome.applied() {
                    return Ok(());
                }
                None
            }
        };

        self.caches.invalidate_for(&self.me, conversation_id);
        if let Some(entry) = confirmed_entry {
            self.notifier.emit(EngineNotification::MessageConfirmed {
                conversation_id,
                correlation_id: entry.correlation_id,
                message_id: message.id,
            });
        }
        Ok(())
    }

    async fn apply_update(&self, ev: MessageEvent) -> Result<()> {
        let existing = self.replica.with(|db| match db.get_message(ev.message_id) {
            Ok(m) => Ok(Some(m)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        })?;

        let incoming = match (ev.body, existing) {
            (Some(body), Some(current)) => Message {
                id: ev.message_id,
                conversation_id: ev.conversation_id,
                sender_id: ev.sender_id,
                body,
                created_at: current.created_at,
                pending: false,
                edited_at: Some(ev.timestamp),
                deleted_at: current.deleted_at,
            },
            // Key-only update, or a row we have never seen: a blind overwrite
            // would corrupt the stored message, so fetch the authoritative row.
            _ => {
                with_timeout(
                    "fetch_message",
                    self.config.network_timeout,
                    self.remote.fetch_message(ev.message_id),
                )
                .await?
            }
        };

        self.ensure_conversation(incoming.conversation_id).await?;
        let outcome = self.replica.with(|db| db.upsert_message(&incoming))?;
        if outcome.applied() {
            self.caches.pages.invalidate(&incoming.conversation_id);
        }
        Ok(())
    }

    /// Deletes get their own path: the payload has no content and must only
    /// ever set `deleted_at`.
    fn apply_delete(&self, ev: DeleteEvent) -> Result<()> {
        let (outcome, was_unread) = self.replica.with(|db| {
            let before = match db.get_message(ev.message_id) {
                Ok(m) => Some(m),
                Err(StoreError::NotFound) => None,
                Err(e) => return Err(e),
            };
            let outcome = db.mark_message_deleted(ev.message_id, ev.timestamp)?;
            let mut was_unread = false;
            if outcome.applied() {
                if let Some(m) = before {
                    was_unread = m.deleted_at.is_none()
                        && !m.pending
                        && m.sender_id != self.me
                        && !db.read_by(m.id)?.contains(&self.me);
                }
            }
            Ok((outcome, was_unread))
        })?;
        if !outcome.applied() {
            return Ok(());
        }

        self.caches.pages.invalidate(&ev.conversation_id);
        if was_unread {
            let badge = self.replica.with(|db| {
                db.decrement_unread(ev.conversation_id, 1)?;
                db.badge()
            })?;
            self.notifier
                .emit(EngineNotification::BadgeChanged { total: badge });
        }
        Ok(())
    }

    async fn ensure_conversation(&self, id: ConversationId) -> Result<()> {
        if self.replica.with(|db| db.conversation_exists(id))? {
            return Ok(());
        }

        let conversation = with_timeout(
            "fetch_conversation",
            self.config.network_timeout,
            self.remote.fetch_conversation(id),
        )
        .await?;
        self.replica
            .with(|db| db.upsert_conversation(&conversation).map(|_| ()))?;
        self.caches.list.invalidate(&self.me);

        // The scope just grew; reopen the stream so the new conversation's
        // events fan out to us.
        let _ = self.resub_tx.try_send(());
        Ok(())
    }
}
