//! v001 -- Initial schema creation.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Message log (append-only apart from retention pruning)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation TEXT NOT NULL,               -- group:<room> | dm:<a>:<b>
    sender       TEXT NOT NULL,
    body         TEXT NOT NULL,
    created_at   TEXT NOT NULL                -- RFC-3339, millis, UTC
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation, id DESC);
CREATE INDEX IF NOT EXISTS idx_messages_created_at
    ON messages(created_at);

-- ----------------------------------------------------------------
-- Rooms and membership sets
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    restricted  INTEGER NOT NULL DEFAULT 0,   -- 1 when room_members is the ACL
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_members (
    room_id   TEXT NOT NULL,
    username  TEXT NOT NULL,
    PRIMARY KEY (room_id, username),
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Registered users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    name        TEXT PRIMARY KEY NOT NULL,
    first_seen  TEXT NOT NULL,
    last_seen   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Unread counters
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS unread (
    username      TEXT NOT NULL,
    conversation  TEXT NOT NULL,
    count         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (username, conversation)
);

-- ----------------------------------------------------------------
-- Key/value settings (retention, ...)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY NOT NULL,
    value  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Attachment metadata (bytes live on disk, keyed by BLAKE3 hash)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachments (
    hash        TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    mime        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
