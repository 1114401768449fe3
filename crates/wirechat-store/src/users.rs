use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{column_enum, column_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{AllowCallsFrom, User};

const USER_COLUMNS: &str = "id, username, password_hash, is_guest, session_id, allow_calls_from, created_at";

impl Database {
    /// Create a registered user with an already-hashed password.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, password_hash, is_guest, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![username, password_hash, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_user_by_id(id)
    }

    /// Create a temporary guest user tracked by an opaque session id.
    pub fn create_guest_user(&self, session_id: &str) -> Result<User> {
        let prefix = session_id.get(..8).unwrap_or(session_id);
        let username = format!("guest_{prefix}");

        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, password_hash, is_guest, session_id, created_at)
             VALUES (?1, '', 1, ?2, ?3)",
            params![username, session_id, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_user_by_id(id)
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Look up a registered (non-guest) user by name.
    pub fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 AND is_guest = 0"),
                params![username],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_user_by_session_id(&self, session_id: &str) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE session_id = ?1 AND is_guest = 1"),
                params![session_id],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_user_call_settings(&self, user_id: i64) -> Result<AllowCallsFrom> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT allow_calls_from FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(AllowCallsFrom::parse(&raw).unwrap_or(AllowCallsFrom::Everyone))
    }

    pub fn update_user_call_settings(&self, user_id: i64, setting: AllowCallsFrom) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users SET allow_calls_from = ?1 WHERE id = ?2",
            params![setting.as_str(), user_id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Case-insensitive prefix/substring search over registered usernames.
    pub fn search_users(&self, query: &str) -> Result<Vec<User>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE username LIKE ?1 ESCAPE '\\' AND is_guest = 0
             ORDER BY username ASC
             LIMIT 20"
        ))?;

        let rows = stmt.query_map(params![pattern], row_to_user)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let is_guest: i64 = row.get(3)?;
    let allow_raw: String = row.get(5)?;
    let ts_raw: String = row.get(6)?;

    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        is_guest: is_guest != 0,
        session_id: row.get(4)?,
        allow_calls_from: column_enum(5, &allow_raw, AllowCallsFrom::parse)?,
        created_at: column_ts(6, &ts_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn create_and_fetch_user() {
        let (_dir, db) = open_db();

        let user = db.create_user("alice", "hash").unwrap();
        assert!(user.id > 0);
        assert_eq!(user.username, "alice");
        assert!(!user.is_guest);
        assert_eq!(user.allow_calls_from, AllowCallsFrom::Everyone);

        let by_name = db.get_user_by_username("alice").unwrap();
        assert_eq!(by_name, user);
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let (_dir, db) = open_db();

        db.create_user("alice", "hash").unwrap();
        let err = db.create_user("alice", "hash2").unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[test]
    fn guest_users_are_invisible_to_username_lookup() {
        let (_dir, db) = open_db();

        let guest = db.create_guest_user("deadbeefcafe").unwrap();
        assert!(guest.is_guest);
        assert_eq!(guest.username, "guest_deadbeef");

        assert!(matches!(
            db.get_user_by_username("guest_deadbeef"),
            Err(StoreError::NotFound)
        ));
        let by_session = db.get_user_by_session_id("deadbeefcafe").unwrap();
        assert_eq!(by_session.id, guest.id);
    }

    #[test]
    fn call_settings_round_trip() {
        let (_dir, db) = open_db();

        let user = db.create_user("bob", "hash").unwrap();
        assert_eq!(
            db.get_user_call_settings(user.id).unwrap(),
            AllowCallsFrom::Everyone
        );

        db.update_user_call_settings(user.id, AllowCallsFrom::FriendsOnly)
            .unwrap();
        assert_eq!(
            db.get_user_call_settings(user.id).unwrap(),
            AllowCallsFrom::FriendsOnly
        );
    }

    #[test]
    fn search_excludes_guests() {
        let (_dir, db) = open_db();

        db.create_user("carol", "hash").unwrap();
        db.create_guest_user("1234567890ab").unwrap();

        let found = db.search_users("car").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "carol");

        assert!(db.search_users("guest").unwrap().is_empty());
    }
}
