//! Persistence for [`OutboxEntry`] records.
//!
//! The queue itself is owned by the outbox worker in the engine crate; this
//! module only stores rows and answers the worker's queries. Entries survive
//! process restarts so a send enqueued before a crash is still drained.

use chrono::{DateTime, Utc};
use parley_shared::constants::PENDING_MATCH_WINDOW;
use parley_shared::types::{ConversationId, CorrelationId, MessageId, UserId};
use rusqlite::params;

use crate::convert::{ts_col, uuid_col};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, OutboxEntry};

impl Database {
    pub fn insert_outbox_entry(&self, entry: &OutboxEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO outbox
                 (correlation_id, conversation_id, message_id, body, attempts,
                  next_retry_at, failed, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.correlation_id.to_string(),
                entry.conversation_id.to_string(),
                entry.message_id.to_string(),
                entry.body,
                entry.attempts,
                entry.next_retry_at.to_rfc3339(),
                entry.failed as i64,
                entry.last_error,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_outbox_entry(&self, id: CorrelationId) -> Result<OutboxEntry> {
        self.conn()
            .query_row(
                "SELECT correlation_id, conversation_id, message_id, body, attempts,
                        next_retry_at, failed, last_error, created_at
                 FROM outbox WHERE correlation_id = ?1",
                params![id.to_string()],
                row_to_entry,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Entries due for a delivery attempt, oldest first.
    pub fn due_outbox_entries(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT correlation_id, conversation_id, message_id, body, attempts,
                    next_retry_at, failed, last_error, created_at
             FROM outbox
             WHERE failed = 0 AND next_retry_at <= ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Terminal failures awaiting user retry or dismissal.
    pub fn failed_outbox_entries(&self) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT correlation_id, conversation_id, message_id, body, attempts,
                    next_retry_at, failed, last_error, created_at
             FROM outbox
             WHERE failed = 1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Push an entry's next attempt into the future after a transient failure.
    pub fn reschedule_outbox_entry(
        &self,
        id: CorrelationId,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE outbox SET attempts = ?2, next_retry_at = ?3, last_error = ?4
             WHERE correlation_id = ?1",
            params![
                id.to_string(),
                attempts,
                next_retry_at.to_rfc3339(),
                last_error
            ],
        )?;
        Ok(())
    }

    /// Promote an entry to terminal failure. It stays visible until the user
    /// retries or dismisses it.
    pub fn mark_outbox_failed(&self, id: CorrelationId, last_error: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE outbox SET failed = 1, last_error = ?2 WHERE correlation_id = ?1",
            params![id.to_string(), last_error],
        )?;
        Ok(())
    }

    /// Reset a terminal entry for a user-initiated retry.
    pub fn reset_outbox_entry(&self, id: CorrelationId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE outbox SET failed = 0, attempts = 0, next_retry_at = ?2, last_error = NULL
             WHERE correlation_id = ?1 AND failed = 1",
            params![id.to_string(), now.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Remove an entry (acknowledged or dismissed). Returns `true` if it existed.
    pub fn remove_outbox_entry(&self, id: CorrelationId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM outbox WHERE correlation_id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Best-effort match of a confirmed echo against a still-pending entry:
    /// same conversation, same (own) sender, byte-equal body, and a creation
    /// time within [`PENDING_MATCH_WINDOW`]. Oldest entry wins.
    ///
    /// Two identical bodies sent close together can mis-pair here; that is a
    /// documented limitation of the fallback — the correlation id path is
    /// authoritative whenever the transport preserves it.
    pub fn match_pending_echo(
        &self,
        me: &UserId,
        confirmed: &Message,
    ) -> Result<Option<OutboxEntry>> {
        if confirmed.sender_id != *me {
            return Ok(None);
        }

        let window = chrono::Duration::from_std(PENDING_MATCH_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let lo = (confirmed.created_at - window).to_rfc3339();
        let hi = (confirmed.created_at + window).to_rfc3339();

        self.conn()
            .query_row(
                "SELECT correlation_id, conversation_id, message_id, body, attempts,
                        next_retry_at, failed, last_error, created_at
                 FROM outbox
                 WHERE failed = 0 AND conversation_id = ?1 AND body = ?2
                   AND created_at BETWEEN ?3 AND ?4
                 ORDER BY created_at ASC
                 LIMIT 1",
                params![
                    confirmed.conversation_id.to_string(),
                    confirmed.body,
                    lo,
                    hi
                ],
                row_to_entry,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Sqlite(other)),
            })
    }
}

/// Map a `rusqlite::Row` to an [`OutboxEntry`].
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let corr_str: String = row.get(0)?;
    let conv_str: String = row.get(1)?;
    let msg_str: String = row.get(2)?;
    let body: String = row.get(3)?;
    let attempts: u32 = row.get(4)?;
    let retry_str: String = row.get(5)?;
    let failed: i64 = row.get(6)?;
    let last_error: Option<String> = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(OutboxEntry {
        correlation_id: CorrelationId(uuid_col(0, &corr_str)?),
        conversation_id: ConversationId(uuid_col(1, &conv_str)?),
        message_id: MessageId(uuid_col(2, &msg_str)?),
        body,
        attempts,
        next_retry_at: ts_col(5, &retry_str)?,
        failed: failed != 0,
        last_error,
        created_at: ts_col(8, &created_str)?,
    })
}
