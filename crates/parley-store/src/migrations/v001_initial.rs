//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `conversations`, `participants`, `messages`,
//! and `message_reads`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind             TEXT NOT NULL,              -- 'direct' | 'group'
    title            TEXT,
    image_ref        TEXT,                       -- opaque reference owned by the UI layer
    created_at       TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    last_activity_at TEXT NOT NULL,
    archived         INTEGER NOT NULL DEFAULT 0  -- boolean 0/1; rows are never hard-deleted
);

CREATE INDEX IF NOT EXISTS idx_conversations_activity
    ON conversations(archived, last_activity_at DESC);

-- ----------------------------------------------------------------
-- Participants
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    user_id         TEXT NOT NULL,
    joined_at       TEXT NOT NULL,
    left_at         TEXT,                        -- non-null means inactive, row retained

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    conversation_id TEXT NOT NULL,               -- FK -> conversations(id)
    sender_id       TEXT NOT NULL,
    body            TEXT NOT NULL,
    created_at      TEXT NOT NULL,               -- server-assigned, authoritative for ordering
    pending         INTEGER NOT NULL DEFAULT 0,  -- 1 = local-only, awaiting confirmation
    edited_at       TEXT,
    deleted_at      TEXT,                        -- soft delete

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conv_ts
    ON messages(conversation_id, created_at, id);

-- ----------------------------------------------------------------
-- Read receipts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,                    -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
