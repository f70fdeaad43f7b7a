//! Tuning constants for caches, retries, and reconciliation cadence.

use std::time::Duration;

/// TTL for the cached per-user conversation list.
pub const CONVERSATION_LIST_TTL: Duration = Duration::from_secs(60);

/// TTL for the cached initial message page of a conversation.
pub const MESSAGE_PAGE_TTL: Duration = Duration::from_secs(60);

/// How long one in-flight fetch may block followers for the same cache key.
pub const FLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout applied to every remote call made by a worker.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbox retry budget before an entry is promoted to terminal failure.
pub const OUTBOX_MAX_ATTEMPTS: u32 = 8;

/// First outbox retry delay; doubles per attempt up to the cap.
pub const OUTBOX_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Outbox backoff cap.
pub const OUTBOX_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// How often the outbox drain worker sweeps for due entries.
pub const OUTBOX_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Realtime reconnect backoff base / cap.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Reconciliation timer while the realtime subscription is live.
pub const RECONCILE_INTERVAL_LIVE: Duration = Duration::from_secs(60);

/// Reconciliation timer while the realtime subscription is down.
pub const RECONCILE_INTERVAL_OFFLINE: Duration = Duration::from_secs(300);

/// Entering the conversation list re-reconciles if the last pass is older
/// than this.
pub const RECONCILE_STALE_AFTER: Duration = Duration::from_secs(30);

/// Window for matching an optimistic send against a confirmed echo when no
/// correlation id is available. Best effort only.
pub const PENDING_MATCH_WINDOW: Duration = Duration::from_secs(10);

/// Page size used by the catch-up fetch after a reconnect.
pub const CATCH_UP_PAGE_LIMIT: u32 = 200;

/// Default page size for message history fetches.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
