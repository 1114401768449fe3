//! v002 -- Friendships.
//!
//! Directed rows: `user_id` sent the request, `friend_id` received it.
//! Acceptance is symmetric; blocking shadows everything else.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS friends (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL,
    friend_id  INTEGER NOT NULL,
    status     TEXT NOT NULL DEFAULT 'pending',  -- pending | accepted | blocked
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    UNIQUE (user_id, friend_id),
    FOREIGN KEY (user_id)   REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_friends_friend_id ON friends(friend_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
