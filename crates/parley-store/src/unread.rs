//! Unread counters.
//!
//! The `unread_counts` table is derived state. Every write lands through a
//! named path — `recompute_unread` (from the replica itself),
//! `increment_unread` (the sync engine's fast path), `decrement_unread`
//! (display/delete of locally-held messages), or `overwrite_unread_counts`
//! (authoritative server truth) — and the global badge is always
//! `SUM(count)` over the same table, so the per-conversation counts and the
//! badge cannot disagree.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, UserId};
use rusqlite::params;

use crate::convert::{opt_ts_col, uuid_col};
use crate::database::Database;
use crate::error::Result;

/// Key in `sync_meta` for the last authoritative reconciliation instant.
const META_LAST_RECONCILED_AT: &str = "last_reconciled_at";

impl Database {
    /// Recount one conversation's unread messages from the replica: confirmed,
    /// not deleted, not sent by `user`, and without a read receipt from
    /// `user`. Writes the result into `unread_counts` and returns it.
    pub fn recompute_unread(
        &self,
        conversation_id: ConversationId,
        user: &UserId,
    ) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1
               AND m.sender_id != ?2
               AND m.pending = 0
               AND m.deleted_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM message_reads r
                   WHERE r.message_id = m.id AND r.user_id = ?2
               )",
            params![conversation_id.to_string(), user.as_str()],
            |row| row.get(0),
        )?;
        self.set_unread_count(conversation_id, count)?;
        Ok(count)
    }

    /// Fast-path bump after a newly-applied insert that the user is not
    /// actively viewing. Self-heals later through reconciliation.
    pub fn increment_unread(&self, conversation_id: ConversationId) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO unread_counts (conversation_id, count) VALUES (?1, 1)
             ON CONFLICT (conversation_id) DO UPDATE SET count = count + 1",
            params![conversation_id.to_string()],
        )?;
        self.unread_count(conversation_id)
    }

    /// Drop `by` from a conversation's counter, clamped at zero.
    ///
    /// Used when locally-held unread messages are displayed or deleted; the
    /// counter may cover backlog the replica has not even loaded yet, so this
    /// subtracts rather than recounting.
    pub fn decrement_unread(&self, conversation_id: ConversationId, by: i64) -> Result<i64> {
        let count = (self.unread_count(conversation_id)? - by).max(0);
        self.set_unread_count(conversation_id, count)?;
        Ok(count)
    }

    /// Replace all counters with the server's truth.
    ///
    /// Conversations absent from the server map (or archived locally) are
    /// zeroed, so a stale row cannot hold the badge up.
    pub fn overwrite_unread_counts(
        &self,
        counts: &HashMap<ConversationId, i64>,
        reconciled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute("DELETE FROM unread_counts", [])?;

        let mut stmt = self.conn().prepare(
            "INSERT INTO unread_counts (conversation_id, count)
             SELECT ?1, ?2
             WHERE NOT EXISTS (
                 SELECT 1 FROM conversations c WHERE c.id = ?1 AND c.archived = 1
             )",
        )?;
        for (conversation_id, count) in counts {
            if *count > 0 {
                stmt.execute(params![conversation_id.to_string(), count])?;
            }
        }

        self.set_meta(META_LAST_RECONCILED_AT, &reconciled_at.to_rfc3339())?;
        Ok(())
    }

    pub fn unread_count(&self, conversation_id: ConversationId) -> Result<i64> {
        let count: Option<i64> = self
            .conn()
            .query_row(
                "SELECT count FROM unread_counts WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(count.unwrap_or(0))
    }

    /// All non-zero counters.
    pub fn unread_counts(&self) -> Result<HashMap<ConversationId, i64>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT conversation_id, count FROM unread_counts WHERE count > 0")?;
        let rows = stmt.query_map([], |row| {
            let conv_str: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((uuid_col(0, &conv_str)?, count))
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let (conv, count) = row?;
            counts.insert(ConversationId(conv), count);
        }
        Ok(counts)
    }

    /// The global badge: the sum of per-conversation counts, computed in the
    /// same query so the two can never be read inconsistently.
    pub fn badge(&self) -> Result<i64> {
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(count), 0) FROM unread_counts",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Drop a conversation's counter entirely (archival path).
    pub fn clear_unread(&self, conversation_id: ConversationId) -> Result<()> {
        self.set_unread_count(conversation_id, 0)
    }

    pub fn last_reconciled_at(&self) -> Result<Option<DateTime<Utc>>> {
        let value = self.get_meta(META_LAST_RECONCILED_AT)?;
        Ok(opt_ts_col(0, value.as_deref())?)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn set_unread_count(&self, conversation_id: ConversationId, count: i64) -> Result<()> {
        if count <= 0 {
            self.conn().execute(
                "DELETE FROM unread_counts WHERE conversation_id = ?1",
                params![conversation_id.to_string()],
            )?;
        } else {
            self.conn().execute(
                "INSERT INTO unread_counts (conversation_id, count) VALUES (?1, ?2)
                 ON CONFLICT (conversation_id) DO UPDATE SET count = excluded.count",
                params![conversation_id.to_string(), count],
            )?;
        }
        Ok(())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(crate::error::StoreError::Sqlite(other)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_shared::types::{ConversationKind, MessageId};

    use crate::models::{Conversation, Message};

    fn seed_conversation(db: &Database) -> ConversationId {
        let now = Utc::now();
        let c = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            title: None,
            image_ref: None,
            created_at: now,
            last_activity_at: now,
            archived: false,
        };
        db.upsert_conversation(&c).unwrap();
        c.id
    }

    fn msg(conv: ConversationId, sender: &str, body: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id: conv,
            sender_id: UserId::from(sender),
            body: body.into(),
            created_at: at,
            pending: false,
            edited_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn badge_is_always_the_sum_of_counts() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_conversation(&db);
        let b = seed_conversation(&db);

        db.increment_unread(a).unwrap();
        db.increment_unread(a).unwrap();
        db.increment_unread(b).unwrap();

        let counts = db.unread_counts().unwrap();
        let sum: i64 = counts.values().sum();
        assert_eq!(sum, 3);
        assert_eq!(db.badge().unwrap(), sum);
    }

    #[test]
    fn overwrite_replaces_and_stamps() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_conversation(&db);
        let b = seed_conversation(&db);
        db.increment_unread(a).unwrap();

        let now = Utc::now();
        let server: HashMap<_, _> = [(a, 2i64), (b, 3i64)].into_iter().collect();
        db.overwrite_unread_counts(&server, now).unwrap();

        assert_eq!(db.unread_count(a).unwrap(), 2);
        assert_eq!(db.unread_count(b).unwrap(), 3);
        assert_eq!(db.badge().unwrap(), 5);
        assert_eq!(db.last_reconciled_at().unwrap(), Some(now));

        // A second overwrite drops counters the server no longer reports.
        let server: HashMap<_, _> = [(b, 1i64)].into_iter().collect();
        db.overwrite_unread_counts(&server, now + Duration::seconds(1))
            .unwrap();
        assert_eq!(db.unread_count(a).unwrap(), 0);
        assert_eq!(db.badge().unwrap(), 1);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let db = Database::open_in_memory().unwrap();
        let conv = seed_conversation(&db);

        db.increment_unread(conv).unwrap();
        db.increment_unread(conv).unwrap();
        assert_eq!(db.decrement_unread(conv, 1).unwrap(), 1);
        assert_eq!(db.decrement_unread(conv, 5).unwrap(), 0);
        assert_eq!(db.badge().unwrap(), 0);
    }

    #[test]
    fn overwrite_skips_archived_conversations() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_conversation(&db);
        db.set_archived(a, true).unwrap();

        let server: HashMap<_, _> = [(a, 4i64)].into_iter().collect();
        db.overwrite_unread_counts(&server, Utc::now()).unwrap();
        assert_eq!(db.unread_count(a).unwrap(), 0);
    }

    #[test]
    fn recompute_counts_only_visible_unread() {
        let db = Database::open_in_memory().unwrap();
        let conv = seed_conversation(&db);
        let me = UserId::from("me");
        let now = Utc::now();

        let m1 = msg(conv, "u-2", "one", now);
        let m2 = msg(conv, "u-2", "two", now + Duration::seconds(1));
        let mine = msg(conv, "me", "mine", now);
        for m in [&m1, &m2, &mine] {
            db.upsert_message(m).unwrap();
        }

        assert_eq!(db.recompute_unread(conv, &me).unwrap(), 2);

        db.mark_read(&me, &[m1.id], now).unwrap();
        assert_eq!(db.recompute_unread(conv, &me).unwrap(), 1);
        assert_eq!(db.badge().unwrap(), 1);

        db.mark_read(&me, &[m2.id], now).unwrap();
        assert_eq!(db.recompute_unread(conv, &me).unwrap(), 0);
        assert_eq!(db.badge().unwrap(), 0);
    }
}
