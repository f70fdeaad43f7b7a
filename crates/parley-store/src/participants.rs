//! CRUD operations for [`Participant`] records.
//!
//! Participant rows are never physically removed; leaving a conversation sets
//! `left_at` so historical messages keep their attribution.

use chrono::{DateTime, Utc};
use parley_shared::types::{ConversationId, UserId};
use rusqlite::params;

use crate::convert::{opt_ts_col, ts_col, uuid_col};
use crate::database::Database;
use crate::error::Result;
use crate::models::Participant;

impl Database {
    /// Record a user joining a conversation. Re-joining clears `left_at`.
    pub fn upsert_participant(&self, participant: &Participant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO participants (conversation_id, user_id, joined_at, left_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (conversation_id, user_id)
             DO UPDATE SET joined_at = excluded.joined_at, left_at = excluded.left_at",
            params![
                participant.conversation_id.to_string(),
                participant.user_id.as_str(),
                participant.joined_at.to_rfc3339(),
                participant.left_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Mark a participant as having left. Returns `true` if a row changed.
    ///
    /// The row stays behind for attribution; an inactive participant must not
    /// receive new-message fan-out.
    pub fn mark_participant_left(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE participants SET left_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![
                conversation_id.to_string(),
                user_id.as_str(),
                at.to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Participants that have not left, ordered by join time.
    pub fn active_participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id, user_id, joined_at, left_at
             FROM participants
             WHERE conversation_id = ?1 AND left_at IS NULL
             ORDER BY joined_at ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    pub fn is_active_participant(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
    ) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM participants
             WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![conversation_id.to_string(), user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

/// Map a `rusqlite::Row` to a [`Participant`].
fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let conv_str: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let joined_str: String = row.get(2)?;
    let left_str: Option<String> = row.get(3)?;

    Ok(Participant {
        conversation_id: ConversationId(uuid_col(0, &conv_str)?),
        user_id: UserId(user_id),
        joined_at: ts_col(2, &joined_str)?,
        left_at: opt_ts_col(3, left_str.as_deref())?,
    })
}
