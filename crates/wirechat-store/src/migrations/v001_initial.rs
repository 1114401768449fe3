//! v001 -- Initial schema creation.
//!
//! Creates the four core chat tables: `users`, `rooms`, `room_members`, and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,         -- 3-32 chars, validated in code
    password_hash TEXT NOT NULL,                -- bcrypt; empty for guests
    is_guest      INTEGER NOT NULL DEFAULT 0,   -- boolean 0/1
    session_id    TEXT,                         -- guest session tracking
    created_at    TEXT NOT NULL                 -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_users_session_id ON users(session_id);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    type       TEXT NOT NULL DEFAULT 'public',  -- public | private | direct | channel
    owner_id   INTEGER,                         -- nullable FK -> users(id)
    direct_key TEXT UNIQUE,                     -- dm:<min>:<max> for direct rooms
    created_at TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE SET NULL
);

-- ----------------------------------------------------------------
-- Room membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_members (
    user_id   INTEGER NOT NULL,
    room_id   INTEGER NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (user_id, room_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_room_members_room_id ON room_members(room_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,  -- history cursor; strictly increasing
    room_id    INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    body       TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_id
    ON messages(room_id, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
