use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Read receipts: one row per (message, reader), never deleted
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- Reactions: at most one per (message, user), replaced on re-react
CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    emoji      TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_message_reads_user ON message_reads(user_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
