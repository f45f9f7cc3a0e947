//! v001 -- Initial schema creation.
//!
//! Creates `users`, `chats` with their participant rows, `messages`, `calls`
//! and `call_logs`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name       TEXT NOT NULL,
    email      TEXT NOT NULL UNIQUE,
    is_online  INTEGER NOT NULL DEFAULT 0,
    last_seen  TEXT,                        -- RFC-3339
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id              TEXT PRIMARY KEY NOT NULL,
    participant_key TEXT NOT NULL UNIQUE,   -- sorted participant ids, comma-joined
    is_group        INTEGER NOT NULL DEFAULT 0,
    name            TEXT,
    admin           TEXT,                   -- nullable user id
    last_message    TEXT,                   -- nullable message id, not enforced
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_participants (
    chat_id TEXT NOT NULL,
    user_id TEXT NOT NULL,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_chat_participants_user
    ON chat_participants(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,
    chat_id      TEXT NOT NULL,
    sender       TEXT NOT NULL,
    message_type TEXT NOT NULL,             -- text | image | video | file | audio
    content      TEXT NOT NULL,
    media_meta   TEXT,                      -- JSON
    reply_to     TEXT,
    is_edited    INTEGER NOT NULL DEFAULT 0,
    is_deleted   INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_created
    ON messages(chat_id, created_at);

-- ----------------------------------------------------------------
-- Calls
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id         TEXT PRIMARY KEY NOT NULL,
    caller     TEXT NOT NULL,
    callee     TEXT NOT NULL,
    call_type  TEXT NOT NULL,               -- voice | video
    status     TEXT NOT NULL,               -- pending | accepted | ended
    room_id    TEXT NOT NULL UNIQUE,
    chat_id    TEXT,                        -- weak reference, never enforced
    started_at TEXT NOT NULL,
    ended_at   TEXT
);

CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_callee ON calls(callee, started_at DESC);

CREATE TABLE IF NOT EXISTS call_logs (
    id            TEXT PRIMARY KEY NOT NULL,
    call_id       TEXT NOT NULL UNIQUE,
    chat_id       TEXT,
    caller        TEXT NOT NULL,
    callee        TEXT NOT NULL,
    call_type     TEXT NOT NULL,
    outcome       TEXT NOT NULL,            -- missed | accepted | rejected
    duration_secs INTEGER NOT NULL DEFAULT 0,
    started_at    TEXT NOT NULL,
    ended_at      TEXT,

    FOREIGN KEY (call_id) REFERENCES calls(id)
);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
