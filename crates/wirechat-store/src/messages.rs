use rusqlite::params;

use crate::database::{column_ts, Database};
use crate::error::Result;
use crate::models::Message;

impl Database {
    /// Persist a message and assign its id.
    ///
    /// Ids come from the AUTOINCREMENT rowid, so they are strictly increasing
    /// per room and double as the history pagination cursor.
    pub fn save_message(&self, msg: &mut Message) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO messages (room_id, user_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                msg.room_id,
                msg.user_id,
                msg.body,
                msg.created_at.to_rfc3339(),
            ],
        )?;
        msg.id = conn.last_insert_rowid();
        Ok(())
    }

    /// Fetch up to `limit` messages from a room in chronological order.
    ///
    /// `before` selects the page of messages with `id < before`; `None`
    /// returns the newest page.
    pub fn list_messages(&self, room_id: i64, limit: u32, before: Option<i64>) -> Result<Vec<Message>> {
        let conn = self.conn();

        let mut messages = match before {
            Some(before_id) => {
                let mut stmt = conn.prepare(
                    "SELECT id, room_id, user_id, body, created_at
                     FROM messages
                     WHERE room_id = ?1 AND id < ?2
                     ORDER BY id DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![room_id, before_id, limit], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, room_id, user_id, body, created_at
                     FROM messages
                     WHERE room_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![room_id, limit], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        // Selected newest-first; flip to chronological.
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let ts_raw: String = row.get(4)?;

    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        body: row.get(3)?,
        created_at: column_ts(4, &ts_raw)?,
    })
}
