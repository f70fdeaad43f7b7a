//! The optimistic send queue worker.
//!
//! `enqueue` inserts a pending message into the replica and an entry into the
//! outbox table, then returns immediately so the UI reflects the send. The
//! worker owns the queue exclusively: it sweeps for due entries on a timer
//! and on explicit wakes, attempts delivery, and classifies failures —
//! transient ones reschedule with exponential backoff plus jitter up to a
//! bounded attempt budget, permanent ones go terminal at once. Terminal
//! entries stay visible for user retry or dismissal; nothing is silently
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parley_shared::types::{ConversationId, CorrelationId, UserId};
use parley_shared::RemoteError;
use parley_store::{Message, OutboxEntry};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::notify::{EngineNotification, Notifier};
use crate::remote::{with_timeout, RemoteApi};
use crate::replica::Replica;
use crate::session::{Caches, SyncConfig};

/// Exponential backoff with up to 50% added jitter, capped at `max`.
pub(crate) fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp);
    let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
    raw.mul_f64(jitter).min(max)
}

/// Create the pending replica row and queue entry for a new send.
///
/// Runs synchronously on the caller; the returned correlation id is the
/// handle for the eventual confirmation or failure notification.
pub(crate) fn enqueue(
    replica: &Replica,
    me: &UserId,
    conversation_id: ConversationId,
    body: &str,
) -> Result<CorrelationId> {
    let now = Utc::now();
    let entry = OutboxEntry {
        correlation_id: CorrelationId::new(),
        conversation_id,
        message_id: parley_shared::types::MessageId::new(),
        body: body.to_string(),
        attempts: 0,
        next_retry_at: now,
        failed: false,
        last_error: None,
        created_at: now,
    };
    let provisional = Message {
        id: entry.message_id,
        conversation_id,
        sender_id: me.clone(),
        body: body.to_string(),
        created_at: now,
        pending: true,
        edited_at: None,
        deleted_at: None,
    };

    replica.with(|db| {
        db.upsert_message(&provisional)?;
        db.insert_outbox_entry(&entry)?;
        db.touch_conversation(conversation_id, now)?;
        Ok(())
    })?;

    debug!(correlation = %entry.correlation_id, conversation = %conversation_id, "send enqueued");
    Ok(entry.correlation_id)
}

/// Background worker draining the outbox.
pub(crate) struct OutboxWorker<R> {
    pub replica: Replica,
    pub remote: Arc<R>,
    pub me: UserId,
    pub notifier: Notifier,
    pub caches: Arc<Caches>,
    pub wake_rx: mpsc::Receiver<()>,
    pub shutdown: watch::Receiver<bool>,
    pub config: Arc<SyncConfig>,
}

impl<R: RemoteApi> OutboxWorker<R> {
    pub(crate) async fn run(mut self) {
        info!("outbox worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(_) = self.wake_rx.recv() => {}
                _ = tokio::time::sleep(self.config.outbox_sweep_interval) => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.drain().await {
                warn!(error = %e, "outbox drain pass failed");
            }
        }
        info!("outbox worker stopped");
    }

    /// One pass over all currently-due entries.
    async fn drain(&self) -> Result<()> {
        let due = self.replica.with(|db| db.due_outbox_entries(Utc::now()))?;
        for entry in due {
            self.attempt(entry).await?;
        }
        Ok(())
    }

    async fn attempt(&self, entry: OutboxEntry) -> Result<()> {
        let sent = with_timeout(
            "send_message",
            self.config.network_timeout,
            self.remote
                .send_message(entry.conversation_id, &entry.body, entry.correlation_id),
        )
        .await;

        match sent {
            Ok(confirmed) => {
                self.replica.with(|db| {
                    db.replace_pending(entry.message_id, &confirmed)?;
                    db.remove_outbox_entry(entry.correlation_id)?;
                    db.touch_conversation(confirmed.conversation_id, confirmed.created_at)?;
                    Ok(())
                })?;
                self.caches.invalidate_for(&self.me, entry.conversation_id);
                info!(
                    correlation = %entry.correlation_id,
                    message = %confirmed.id,
                    "send confirmed"
                );
                self.notifier.emit(EngineNotification::MessageConfirmed {
                    conversation_id: entry.conversation_id,
                    correlation_id: entry.correlation_id,
                    message_id: confirmed.id,
                });
            }
            Err(e) if e.is_transient() => {
                let attempts = entry.attempts + 1;
                if attempts >= self.config.outbox_max_attempts {
                    self.fail(&entry, &e).await?;
                } else {
                    let delay = backoff_with_jitter(
                        self.config.outbox_backoff_base,
                        self.config.outbox_backoff_max,
                        attempts,
                    );
                    let next = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    warn!(
                        correlation = %entry.correlation_id,
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "send failed, rescheduling"
                    );
                    self.replica.with(|db| {
                        db.reschedule_outbox_entry(
                            entry.correlation_id,
                            attempts,
                            next,
                            &e.to_string(),
                        )
                    })?;
                }
            }
            Err(e) => {
                // Validation/authorization/conflict: retrying cannot help.
                self.fail(&entry, &e).await?;
            }
        }
        Ok(())
    }

    async fn fail(&self, entry: &OutboxEntry, error: &RemoteError) -> Result<()> {
        warn!(
            correlation = %entry.correlation_id,
            error = %error,
            "send reached terminal failure"
        );
        self.replica
            .with(|db| db.mark_outbox_failed(entry.correlation_id, &error.to_string()))?;
        self.notifier.emit(EngineNotification::SendFailed {
            conversation_id: entry.conversation_id,
            correlation_id: entry.correlation_id,
            error: error.to_string(),
        });
        Ok(())
    }
}
