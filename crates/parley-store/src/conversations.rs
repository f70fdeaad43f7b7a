//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, ConversationKind};
use rusqlite::params;

use crate::convert::{ts_col, uuid_col};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, UpsertOutcome};

impl Database {
    // ------------------------------------------------------------------
    // Upsert
    // ------------------------------------------------------------------

    /// Insert or update a conversation.
    ///
    /// An incoming record with a `last_activity_at` older than the stored row
    /// is ignored, so replayed or out-of-order metadata fetches cannot move a
    /// conversation backwards in the list.
    pub fn upsert_conversation(&self, conversation: &Conversation) -> Result<UpsertOutcome> {
        match self.get_conversation(conversation.id) {
            Ok(existing) => {
                if conversation.last_activity_at < existing.last_activity_at
                    || *conversation == existing
                {
                    return Ok(UpsertOutcome::Ignored);
                }
                self.conn().execute(
                    "UPDATE conversations
                     SET kind = ?2, title = ?3, image_ref = ?4, created_at = ?5,
                         last_activity_at = ?6, archived = ?7
                     WHERE id = ?1",
                    params![
                        conversation.id.to_string(),
                        conversation.kind.as_str(),
                        conversation.title,
                        conversation.image_ref,
                        conversation.created_at.to_rfc3339(),
                        conversation.last_activity_at.to_rfc3339(),
                        conversation.archived as i64,
                    ],
                )?;
                Ok(UpsertOutcome::Applied)
            }
            Err(StoreError::NotFound) => {
                self.conn().execute(
                    "INSERT INTO conversations
                         (id, kind, title, image_ref, created_at, last_activity_at, archived)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        conversation.id.to_string(),
                        conversation.kind.as_str(),
                        conversation.title,
                        conversation.image_ref,
                        conversation.created_at.to_rfc3339(),
                        conversation.last_activity_at.to_rfc3339(),
                        conversation.archived as i64,
                    ],
                )?;
                Ok(UpsertOutcome::Applied)
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                "SELECT id, kind, title, image_ref, created_at, last_activity_at, archived
                 FROM conversations
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn conversation_exists(&self, id: ConversationId) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM conversations WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// List non-archived conversations, newest activity first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, kind, title, image_ref, created_at, last_activity_at, archived
             FROM conversations
             WHERE archived = 0
             ORDER BY last_activity_at DESC, id DESC",
        )?;

        let rows = stmt.query_map([], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Ids of every locally-known, non-archived conversation (the realtime
    /// subscription scope).
    pub fn conversation_ids(&self) -> Result<Vec<ConversationId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM conversations WHERE archived = 0 ORDER BY id")?;

        let rows = stmt.query_map([], |row| {
            let id_str: String = row.get(0)?;
            Ok(uuid_col(0, &id_str)?)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(ConversationId(row?));
        }
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Move `last_activity_at` forward (never backward).
    pub fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE conversations SET last_activity_at = ?2
             WHERE id = ?1 AND last_activity_at < ?2",
            params![id.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Set or clear the archived flag. Returns `true` if a row changed.
    pub fn set_archived(&self, id: ConversationId, archived: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE conversations SET archived = ?2 WHERE id = ?1",
            params![id.to_string(), archived as i64],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let title: Option<String> = row.get(2)?;
    let image_ref: Option<String> = row.get(3)?;
    let created_str: String = row.get(4)?;
    let activity_str: String = row.get(5)?;
    let archived: i64 = row.get(6)?;

    let kind = ConversationKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown conversation kind: {kind_str}").into(),
        )
    })?;

    Ok(Conversation {
        id: ConversationId(uuid_col(0, &id_str)?),
        kind,
        title,
        image_ref,
        created_at: ts_col(4, &created_str)?,
        last_activity_at: ts_col(5, &activity_str)?,
        archived: archived != 0,
    })
}
