//! v003 -- Call signaling records and call privacy settings.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS calls (
    id                TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    type              TEXT NOT NULL,               -- direct | room
    mode              TEXT NOT NULL,               -- livekit
    initiator_user_id INTEGER NOT NULL,
    room_id           INTEGER,                     -- set for room calls
    status            TEXT NOT NULL,               -- ringing | active | ended | failed
    external_room_id  TEXT,                        -- SFU room name
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    ended_at          TEXT,

    FOREIGN KEY (initiator_user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (room_id)           REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_calls_room_id ON calls(room_id);
CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status);

CREATE TABLE IF NOT EXISTS call_participants (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id   TEXT NOT NULL,
    user_id   INTEGER NOT NULL,
    joined_at TEXT,
    left_at   TEXT,
    reason    TEXT,

    UNIQUE (call_id, user_id),
    FOREIGN KEY (call_id) REFERENCES calls(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_call_participants_user_id ON call_participants(user_id);

-- Call privacy: who may place direct calls to this user.
ALTER TABLE users ADD COLUMN allow_calls_from TEXT NOT NULL DEFAULT 'everyone';
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
