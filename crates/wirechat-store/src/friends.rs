use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{column_enum, column_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Friend, FriendStatus};

const FRIEND_COLUMNS: &str = "id, user_id, friend_id, status, created_at, updated_at";

impl Database {
    /// Insert a pending friend request from `user_id` to `friend_id`.
    pub fn create_friend_request(&self, user_id: i64, friend_id: i64) -> Result<Friend> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO friends (user_id, friend_id, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![user_id, friend_id, now],
        )?;
        let id = conn.last_insert_rowid();

        conn.query_row(
            &format!("SELECT {FRIEND_COLUMNS} FROM friends WHERE id = ?1"),
            params![id],
            row_to_friend,
        )
        .map_err(StoreError::from)
    }

    /// Update the status of the directed row `user_id -> friend_id`.
    pub fn update_friend_status(&self, user_id: i64, friend_id: i64, status: FriendStatus) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE friends SET status = ?1, updated_at = ?2
             WHERE user_id = ?3 AND friend_id = ?4",
            params![status.as_str(), Utc::now().to_rfc3339(), user_id, friend_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Find the friendship between two users in either direction.
    pub fn get_friendship(&self, user_id: i64, friend_id: i64) -> Result<Friend> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {FRIEND_COLUMNS} FROM friends
                     WHERE (user_id = ?1 AND friend_id = ?2)
                        OR (user_id = ?2 AND friend_id = ?1)"
                ),
                params![user_id, friend_id],
                row_to_friend,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// List friendships involving a user, optionally filtered by status.
    pub fn list_friends(&self, user_id: i64, status: Option<FriendStatus>) -> Result<Vec<Friend>> {
        let conn = self.conn();
        let mut friends = Vec::new();

        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FRIEND_COLUMNS} FROM friends
                     WHERE (user_id = ?1 OR friend_id = ?1) AND status = ?2
                     ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![user_id, status.as_str()], row_to_friend)?;
                for row in rows {
                    friends.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FRIEND_COLUMNS} FROM friends
                     WHERE user_id = ?1 OR friend_id = ?1
                     ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![user_id], row_to_friend)?;
                for row in rows {
                    friends.push(row?);
                }
            }
        }

        Ok(friends)
    }

    /// Whether two users are accepted friends, in either direction.
    pub fn is_friend(&self, user_id: i64, friend_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM friends
                 WHERE ((user_id = ?1 AND friend_id = ?2)
                     OR (user_id = ?2 AND friend_id = ?1))
                   AND status = 'accepted'",
                params![user_id, friend_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn delete_friendship(&self, user_id: i64, friend_id: i64) -> Result<()> {
        self.conn().execute(
            "DELETE FROM friends WHERE user_id = ?1 AND friend_id = ?2",
            params![user_id, friend_id],
        )?;
        Ok(())
    }
}

fn row_to_friend(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friend> {
    let status_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let updated_raw: String = row.get(5)?;

    Ok(Friend {
        id: row.get(0)?,
        user_id: row.get(1)?,
        friend_id: row.get(2)?,
        status: column_enum(3, &status_raw, FriendStatus::parse)?,
        created_at: column_ts(4, &created_raw)?,
        updated_at: column_ts(5, &updated_raw)?,
    })
}
