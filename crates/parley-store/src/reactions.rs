use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::models::Reaction;
use parley_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{fmt_ts, uuid_at};

impl Database {
    /// Replace `reaction.user_id`'s reaction on `message` with this one.
    ///
    /// The previous row is deleted and a new one inserted, so the replaced
    /// reaction moves to the end of the list.
    pub fn set_reaction(
        &self,
        message: MessageId,
        reaction: &Reaction,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.in_transaction(|db| {
            db.remove_reaction(message, reaction.user_id)?;
            db.conn().execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.to_string(),
                    reaction.user_id.to_string(),
                    reaction.emoji,
                    fmt_ts(&at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn remove_reaction(&self, message: MessageId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
            params![message.to_string(), user.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Reactions on a message in the order they were (last) set.
    pub fn reactions_for(&self, message: MessageId) -> Result<Vec<Reaction>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, emoji FROM reactions
             WHERE message_id = ?1
             ORDER BY rowid ASC",
        )?;

        let rows = stmt.query_map(params![message.to_string()], |row| {
            Ok(Reaction {
                user_id: UserId(uuid_at(row, 0)?),
                emoji: row.get(1)?,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }
}
