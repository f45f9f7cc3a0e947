//! CRUD operations for [`Message`] records and their read receipts.

use chrono::{DateTime, Utc};
use rusqlite::params;

use parley_shared::models::{MediaMeta, Message};
use parley_shared::types::{ChatId, MessageId, UserId};

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::rows::{conversion, enum_at, fmt_ts, opt_uuid_at, ts_at, uuid_at};

const MESSAGE_COLUMNS: &str = "id, chat_id, sender, message_type, content, media_meta, reply_to,
                               is_edited, is_deleted, created_at, updated_at";

impl Database {
    /// Insert a message together with its initial readers and reactions.
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let media_meta = message
            .media_meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.in_transaction(|db| {
            db.conn().execute(
                "INSERT INTO messages (id, chat_id, sender, message_type, content, media_meta,
                                       reply_to, is_edited, is_deleted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    message.id.to_string(),
                    message.chat_id.to_string(),
                    message.sender.to_string(),
                    message.message_type.as_str(),
                    message.content,
                    media_meta,
                    message.reply_to.map(|r| r.to_string()),
                    message.is_edited,
                    message.is_deleted,
                    fmt_ts(&message.created_at),
                    fmt_ts(&message.updated_at),
                ],
            )?;

            for reader in &message.read_by {
                db.add_reader(message.id, *reader, message.created_at)?;
            }
            for reaction in &message.reactions {
                db.set_reaction(message.id, reaction, message.created_at)?;
            }
            Ok(())
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)?;
        self.fill_message(&mut message)?;
        Ok(message)
    }

    /// All messages of a chat, oldest first.
    pub fn messages_for_chat(&self, chat: ChatId) -> Result<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ),
            params![chat.to_string()],
        )
    }

    pub fn count_unread(&self, chat: ChatId, reader: UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.chat_id = ?1 AND m.sender <> ?2
               AND NOT EXISTS (SELECT 1 FROM message_reads r
                               WHERE r.message_id = m.id AND r.user_id = ?2)",
            params![chat.to_string(), reader.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Newest message of a chat, if it has any.
    pub fn latest_message(&self, chat: ChatId) -> Result<Option<Message>> {
        let mut found = self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE chat_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            ),
            params![chat.to_string()],
        )?;
        Ok(found.pop())
    }

    /// Record that `reader` has read `message`. Returns `false` if the
    /// receipt already existed.
    pub fn add_reader(&self, message: MessageId, reader: UserId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![message.to_string(), reader.to_string(), fmt_ts(&at)],
        )?;
        Ok(affected > 0)
    }

    pub fn readers_of(&self, message: MessageId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM message_reads
             WHERE message_id = ?1
             ORDER BY read_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![message.to_string()], |row| uuid_at(row, 0))?;

        let mut readers = Vec::new();
        for row in rows {
            readers.push(UserId(row?));
        }
        Ok(readers)
    }

    /// Persist the mutable content fields: content, flags and `updated_at`.
    pub fn update_message_content(&self, message: &Message) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET content = ?2, is_edited = ?3, is_deleted = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                message.id.to_string(),
                message.content,
                message.is_edited,
                message.is_deleted,
                fmt_ts(&message.updated_at),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        for message in &mut messages {
            self.fill_message(message)?;
        }
        Ok(messages)
    }

    fn fill_message(&self, message: &mut Message) -> Result<()> {
        message.read_by = self.readers_of(message.id)?;
        message.reactions = self.reactions_for(message.id)?;
        Ok(())
    }
}

/// Readers and reactions are filled in by the caller.
fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let media_json: Option<String> = row.get(5)?;
    let media_meta = media_json
        .map(|json| serde_json::from_str::<MediaMeta>(&json).map_err(|e| conversion(5, e)))
        .transpose()?;

    Ok(Message {
        id: MessageId(uuid_at(row, 0)?),
        chat_id: ChatId(uuid_at(row, 1)?),
        sender: UserId(uuid_at(row, 2)?),
        message_type: enum_at(row, 3)?,
        content: row.get(4)?,
        media_meta,
        reply_to: opt_uuid_at(row, 6)?.map(MessageId),
        read_by: Vec::new(),
        reactions: Vec::new(),
        is_edited: row.get(7)?,
        is_deleted: row.get(8)?,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}
