//! v002 -- Outbox queue and unread counters.

use rusqlite::Connection;

/// SQL executed when upgrading from version 1 to version 2.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Outbox (optimistic send queue)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS outbox (
    correlation_id  TEXT PRIMARY KEY NOT NULL,   -- client-generated UUID v4
    conversation_id TEXT NOT NULL,
    message_id      TEXT NOT NULL,               -- provisional messages(id), pending = 1
    body            TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    next_retry_at   TEXT NOT NULL,
    failed          INTEGER NOT NULL DEFAULT 0,  -- 1 = terminal failure, kept for retry/dismiss
    last_error      TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(failed, next_retry_at);

-- ----------------------------------------------------------------
-- Unread counters (derived; written only through the recompute path)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS unread_counts (
    conversation_id TEXT PRIMARY KEY NOT NULL,
    count           INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Sync metadata (last reconciliation timestamp, etc.)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the outbox/unread migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
