//! Unread reconciliation.
//!
//! The fast path (sync-engine increments) keeps the badge responsive; this
//! worker keeps it honest. On every trigger — foregrounding, entering the
//! conversation list with stale state, completing a mark-read, a periodic
//! timer, or the realtime stream coming back up — it fetches authoritative
//! counts and overwrites local state unconditionally, so counters self-heal
//! after missed events, backgrounding, or multi-device drift.

use std::sync::Arc;

use chrono::Utc;
use parley_shared::types::{ConnectionPhase, UserId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::notify::{EngineNotification, Notifier};
use crate::remote::{with_timeout, RemoteApi};
use crate::replica::Replica;
use crate::session::{Caches, SyncConfig};
use crate::view::ViewState;

/// Event-driven reconciliation reasons, beyond the periodic timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTrigger {
    /// The application moved to the foreground.
    Foregrounded,
    /// The conversation-list view became visible.
    EnteredConversationList,
    /// A mark-read action completed.
    AfterMarkRead,
}

pub(crate) struct Reconciler<R> {
    pub replica: Replica,
    pub remote: Arc<R>,
    pub me: UserId,
    pub view: ViewState,
    pub notifier: Notifier,
    pub caches: Arc<Caches>,
    pub phase_rx: watch::Receiver<ConnectionPhase>,
    pub trigger_rx: mpsc::Receiver<ReconcileTrigger>,
    pub shutdown: watch::Receiver<bool>,
    pub config: Arc<SyncConfig>,
}

impl<R: RemoteApi> Reconciler<R> {
    pub(crate) async fn run(mut self) {
        info!("reconciliation worker started");
        loop {
            // Short interval while the subscription is live, long while it is
            // not; a reconnect below switches back to short immediately.
            let interval = if self.phase_rx.borrow().is_live() {
                self.config.reconcile_interval_live
            } else {
                self.config.reconcile_interval_offline
            };

            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    // The periodic sweep only runs while the app is visible;
                    // foregrounding itself triggers a pass anyway.
                    if self.view.is_app_foreground() {
                        self.reconcile().await;
                    }
                }
                changed = self.phase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if self.phase_rx.borrow().is_live() {
                        debug!("realtime reconnected, reconciling immediately");
                        self.reconcile().await;
                    }
                }
                trigger = self.trigger_rx.recv() => match trigger {
                    None => break,
                    Some(ReconcileTrigger::EnteredConversationList) => {
                        if self.is_stale() {
                            self.reconcile().await;
                        }
                    }
                    Some(_) => self.reconcile().await,
                }
            }
        }
        info!("reconciliation worker stopped");
    }

    fn is_stale(&self) -> bool {
        let last = self
            .replica
            .with(|db| db.last_reconciled_at())
            .unwrap_or(None);
        match last {
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std().unwrap_or_default() >= self.config.reconcile_stale_after
            }
            None => true,
        }
    }

    /// One authoritative pass. Transient failures are just logged — the next
    /// trigger or tick retries.
    async fn reconcile(&self) {
        if let Err(e) = self.try_reconcile().await {
            warn!(error = %e, "unread reconciliation failed");
        }
    }

    async fn try_reconcile(&self) -> Result<()> {
        let counts = with_timeout(
            "fetch_unread_counts",
            self.config.network_timeout,
            self.remote.fetch_unread_counts(&self.me),
        )
        .await?;

        let badge = self.replica.with(|db| {
            db.overwrite_unread_counts(&counts, Utc::now())?;
            db.badge()
        })?;

        self.caches.list.invalidate(&self.me);
        self.notifier
            .emit(EngineNotification::BadgeChanged { total: badge });
        debug!(badge, "unread counters reconciled");
        Ok(())
    }
}
