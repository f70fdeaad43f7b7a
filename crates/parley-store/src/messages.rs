//! CRUD and merge operations for [`Message`] records.
//!
//! All writes are idempotent. The merge rule is last-writer-wins on the
//! record's revision timestamp (newest of created/edited/deleted), with the
//! message id as tie-break, so applying the same event twice or applying two
//! events in either arrival order converges to the same replica state.

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, MessageId, UserId};
use rusqlite::params;

use crate::convert::{opt_ts_col, ts_col, uuid_col};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, UpsertOutcome};

impl Database {
    // ------------------------------------------------------------------
    // Upsert / merge
    // ------------------------------------------------------------------

    /// Insert or merge a message under the last-writer-wins rule.
    ///
    /// A duplicate or older incoming record is ignored. A soft-deleted state
    /// is never resurrected: if the stored row carries `deleted_at` and the
    /// incoming one does not, the tombstone is preserved.
    pub fn upsert_message(&self, message: &Message) -> Result<UpsertOutcome> {
        let existing = match self.get_message(message.id) {
            Ok(m) => Some(m),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e),
        };

        let Some(current) = existing else {
            self.conn().execute(
                "INSERT INTO messages
                     (id, conversation_id, sender_id, body, created_at, pending, edited_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    message.sender_id.as_str(),
                    message.body,
                    message.created_at.to_rfc3339(),
                    message.pending as i64,
                    message.edited_at.map(|t| t.to_rfc3339()),
                    message.deleted_at.map(|t| t.to_rfc3339()),
                ],
            )?;
            return Ok(UpsertOutcome::Applied);
        };

        // A server-confirmed record replaces a pending row with the same id
        // even at an equal revision.
        let confirms_pending = current.pending && !message.pending;
        if !confirms_pending && message.revision() <= current.revision() {
            return Ok(UpsertOutcome::Ignored);
        }

        let merged = Message {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id.clone(),
            body: message.body.clone(),
            created_at: message.created_at,
            pending: message.pending,
            edited_at: message.edited_at.or(current.edited_at),
            deleted_at: message.deleted_at.or(current.deleted_at),
        };

        self.conn().execute(
            "UPDATE messages
             SET conversation_id = ?2, sender_id = ?3, body = ?4, created_at = ?5,
                 pending = ?6, edited_at = ?7, deleted_at = ?8
             WHERE id = ?1",
            params![
                merged.id.to_string(),
                merged.conversation_id.to_string(),
                merged.sender_id.as_str(),
                merged.body,
                merged.created_at.to_rfc3339(),
                merged.pending as i64,
                merged.edited_at.map(|t| t.to_rfc3339()),
                merged.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(UpsertOutcome::Applied)
    }

    /// Soft-delete by id: sets `deleted_at` and touches nothing else.
    ///
    /// A delete for an unknown id is a no-op — delete payloads carry no
    /// content and must never create a row.
    pub fn mark_message_deleted(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?2
             WHERE id = ?1 AND (deleted_at IS NULL OR deleted_at < ?2)",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(if affected > 0 {
            UpsertOutcome::Applied
        } else {
            UpsertOutcome::Ignored
        })
    }

    /// Replace a pending (local-only) row with its server-confirmed message.
    ///
    /// If the confirmed id already exists in the replica (the realtime echo
    /// arrived first), the provisional row is simply dropped.
    pub fn replace_pending(
        &self,
        provisional_id: MessageId,
        confirmed: &Message,
    ) -> Result<UpsertOutcome> {
        if provisional_id != confirmed.id && self.get_message(confirmed.id).is_ok() {
            self.conn().execute(
                "DELETE FROM messages WHERE id = ?1 AND pending = 1",
                params![provisional_id.to_string()],
            )?;
            return self.upsert_message(confirmed);
        }

        let affected = self.conn().execute(
            "UPDATE messages
             SET id = ?2, sender_id = ?3, body = ?4, created_at = ?5, pending = 0
             WHERE id = ?1 AND pending = 1",
            params![
                provisional_id.to_string(),
                confirmed.id.to_string(),
                confirmed.sender_id.as_str(),
                confirmed.body,
                confirmed.created_at.to_rfc3339(),
            ],
        )?;

        if affected == 0 {
            // Provisional row already gone; fall back to a plain merge.
            return self.upsert_message(confirmed);
        }
        Ok(UpsertOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                "SELECT id, conversation_id, sender_id, body, created_at, pending, edited_at, deleted_at
                 FROM messages WHERE id = ?1",
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// A page of messages older than the cursor, returned in ascending
    /// (created_at, id) order. `None` cursor means "newest page".
    pub fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<(DateTime<Utc>, MessageId)>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut messages = match before {
            Some((ts, id)) => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, conversation_id, sender_id, body, created_at, pending, edited_at, deleted_at
                     FROM messages
                     WHERE conversation_id = ?1 AND (created_at, id) < (?2, ?3)
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![
                        conversation_id.to_string(),
                        ts.to_rfc3339(),
                        id.to_string(),
                        limit
                    ],
                    row_to_message,
                )?;
                collect(rows)?
            }
            None => {
                let mut stmt = self.conn().prepare(
                    "SELECT id, conversation_id, sender_id, body, created_at, pending, edited_at, deleted_at
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2",
                )?;
                let rows =
                    stmt.query_map(params![conversation_id.to_string(), limit], row_to_message)?;
                collect(rows)?
            }
        };

        messages.reverse();
        Ok(messages)
    }

    /// Creation timestamp of the newest server-confirmed message, used as the
    /// catch-up watermark after a reconnect.
    pub fn newest_confirmed_at(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<String> = self.conn().query_row(
            "SELECT MAX(created_at) FROM messages
             WHERE conversation_id = ?1 AND pending = 0",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(opt_ts_col(0, ts.as_deref())?)
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Record read receipts for the subset of `ids` that is actually unread
    /// by `user`: confirmed, not deleted, and not sent by `user` themselves.
    ///
    /// Returns the ids newly marked, so the caller can forward exactly those
    /// to the remote side and recompute counters.
    pub fn mark_read(
        &self,
        user: &UserId,
        ids: &[MessageId],
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let mut marked = Vec::new();
        for id in ids {
            let affected = self.conn().execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                 SELECT m.id, ?2, ?3 FROM messages m
                 WHERE m.id = ?1 AND m.sender_id != ?2
                   AND m.pending = 0 AND m.deleted_at IS NULL",
                params![id.to_string(), user.as_str(), at.to_rfc3339()],
            )?;
            if affected > 0 {
                marked.push(*id);
            }
        }
        Ok(marked)
    }

    /// The set of users who have seen a message.
    pub fn read_by(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY read_at ASC",
        )?;
        let rows = stmt.query_map(params![message_id.to_string()], |row| {
            let user: String = row.get(0)?;
            Ok(UserId(user))
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn collect(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Message>>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Map a `rusqlite::Row` to a [`Message`].
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let conv_str: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let body: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let pending: i64 = row.get(5)?;
    let edited_str: Option<String> = row.get(6)?;
    let deleted_str: Option<String> = row.get(7)?;

    Ok(Message {
        id: MessageId(uuid_col(0, &id_str)?),
        conversation_id: ConversationId(uuid_col(1, &conv_str)?),
        sender_id: UserId(sender),
        body,
        created_at: ts_col(4, &created_str)?,
        pending: pending != 0,
        edited_at: opt_ts_col(6, edited_str.as_deref())?,
        deleted_at: opt_ts_col(7, deleted_str.as_deref())?,
    })
}
