//! CRUD operations for [`Chat`] records.
//!
//! A chat's participant set is stored twice: as rows in
//! `chat_participants` for membership queries, and as a canonical
//! `participant_key` that makes "a chat with exactly these members" unique.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::models::Chat;
use parley_shared::types::{ChatId, MessageId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::rows::{fmt_ts, opt_uuid_at, ts_at, uuid_at};

const CHAT_COLUMNS: &str = "id, is_group, name, admin, last_message, created_at, updated_at";

/// Canonical key for a participant set: sorted, deduplicated, comma-joined.
pub fn participant_key(participants: &[UserId]) -> String {
    let mut ids: Vec<UserId> = participants.to_vec();
    ids.sort();
    ids.dedup();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a chat and its participant rows atomically.
    pub fn insert_chat(&self, chat: &Chat) -> Result<()> {
        self.in_transaction(|db| {
            db.conn().execute(
                "INSERT INTO chats (id, participant_key, is_group, name, admin, last_message,
                                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    chat.id.to_string(),
                    participant_key(&chat.participants),
                    chat.is_group,
                    chat.name,
                    chat.admin.map(|a| a.to_string()),
                    chat.last_message.map(|m| m.to_string()),
                    fmt_ts(&chat.created_at),
                    fmt_ts(&chat.updated_at),
                ],
            )?;

            for participant in &chat.participants {
                db.conn().execute(
                    "INSERT OR IGNORE INTO chat_participants (chat_id, user_id) VALUES (?1, ?2)",
                    params![chat.id.to_string(), participant.to_string()],
                )?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        let mut chat = self
            .conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.to_string()],
                row_to_chat,
            )
            .map_err(not_found)?;
        chat.participants = self.participants_of(id)?;
        Ok(chat)
    }

    /// The chat whose participant set equals `participants` exactly, if any.
    pub fn find_chat_by_participants(&self, participants: &[UserId]) -> Result<Option<Chat>> {
        let found = self.conn().query_row(
            "SELECT id FROM chats WHERE participant_key = ?1",
            params![participant_key(participants)],
            |row| uuid_at(row, 0),
        );
        match found {
            Ok(id) => self.get_chat(ChatId(id)).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Chats containing `user`, most recently active first.
    pub fn chats_for_user(&self, user: UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.is_group, c.name, c.admin, c.last_message, c.created_at, c.updated_at
             FROM chats c
             JOIN chat_participants p ON p.chat_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.updated_at DESC",
        )?;

        let rows = stmt.query_map(params![user.to_string()], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            chats.push(row?);
        }
        for chat in &mut chats {
            chat.participants = self.participants_of(chat.id)?;
        }
        Ok(chats)
    }

    pub fn participants_of(&self, chat: ChatId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM chat_participants WHERE chat_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![chat.to_string()], |row| uuid_at(row, 0))?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(UserId(row?));
        }
        participants.sort();
        Ok(participants)
    }

    pub fn is_participant(&self, chat: ChatId, user: UserId) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM chat_participants WHERE chat_id = ?1 AND user_id = ?2",
            params![chat.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Point the chat at its newest message and bump its activity time.
    pub fn set_last_message(
        &self,
        chat: ChatId,
        message: MessageId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE chats SET last_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![chat.to_string(), message.to_string(), fmt_ts(&at)],
        )?;
        Ok(())
    }
}

/// Participants are filled in by the caller.
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: ChatId(uuid_at(row, 0)?),
        participants: Vec::new(),
        is_group: row.get(1)?,
        name: row.get(2)?,
        admin: opt_uuid_at(row, 3)?.map(UserId),
        last_message: opt_uuid_at(row, 4)?.map(MessageId),
        created_at: ts_at(row, 5)?,
        updated_at: ts_at(row, 6)?,
    })
}
