//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `rooms`, `room_members` and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (owned by the account service, read by the chat core)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    nickname     TEXT NOT NULL,
    email        TEXT NOT NULL UNIQUE COLLATE NOCASE,
    phone_number TEXT,
    user_role    TEXT NOT NULL DEFAULT 'user',
    chat_status  TEXT NOT NULL DEFAULT 'offline',
    created_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    room_name   TEXT NOT NULL UNIQUE COLLATE NOCASE,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_members (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id    INTEGER NOT NULL,
    member_id  INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
    FOREIGN KEY (member_id) REFERENCES users(id) ON DELETE CASCADE,
    UNIQUE (room_id, member_id)
);

CREATE INDEX IF NOT EXISTS idx_room_members_member ON room_members(member_id);

-- ----------------------------------------------------------------
-- Messages: addressed to exactly one of a receiver or a room
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    sender       INTEGER NOT NULL,
    receiver     INTEGER,
    room_id      INTEGER,
    content      TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    status       INTEGER NOT NULL DEFAULT 0,  -- 0 unread, 1 read
    media        TEXT,
    created_at   TEXT NOT NULL,
    modified_at  TEXT NOT NULL,

    FOREIGN KEY (sender) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (receiver) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
    CHECK ((receiver IS NULL) <> (room_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, receiver, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_room ON messages(room_id, created_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
