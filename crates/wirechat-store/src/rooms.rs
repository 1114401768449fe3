use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::database::{column_enum, column_ts, Database};
use crate::error::{Result, StoreError};
use crate::models::{Room, RoomType};

const ROOM_COLUMNS: &str = "id, name, type, owner_id, direct_key, created_at";

impl Database {
    pub fn create_room(&self, name: &str, kind: RoomType, owner_id: Option<i64>) -> Result<Room> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO rooms (name, type, owner_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, kind.as_str(), owner_id, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);

        self.get_room_by_id(id)
    }

    pub fn get_room_by_id(&self, id: i64) -> Result<Room> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
                params![id],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_room_by_name(&self, name: &str) -> Result<Room> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE name = ?1"),
                params![name],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn get_room_by_direct_key(&self, direct_key: &str) -> Result<Room> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE direct_key = ?1"),
                params![direct_key],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Rooms visible to a user: every public room plus anything they are a
    /// member or owner of.
    pub fn list_rooms(&self, user_id: i64) -> Result<Vec<Room>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT r.id, r.name, r.type, r.owner_id, r.direct_key, r.created_at
             FROM rooms r
             LEFT JOIN room_members rm ON r.id = rm.room_id
             WHERE r.type = 'public'
                OR rm.user_id = ?1
                OR r.owner_id = ?1
             ORDER BY r.created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], row_to_room)?;
        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    /// Create (or return the existing) direct room between two users.
    ///
    /// The room row and both memberships are inserted in a single
    /// transaction, so `create_direct_room(a, b)` and `create_direct_room(b,
    /// a)` converge on one row keyed by `direct_key`.
    pub fn create_direct_room(&self, direct_key: &str, user1: i64, user2: i64) -> Result<Room> {
        match self.get_room_by_direct_key(direct_key) {
            Ok(room) => return Ok(room),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let now = Utc::now().to_rfc3339();
        let name = format!("dm-{user1}-{user2}");

        let room_id = {
            let mut conn = self.conn();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT INTO rooms (name, type, owner_id, direct_key, created_at)
                 VALUES (?1, 'direct', NULL, ?2, ?3)",
                params![name, direct_key, now],
            )?;
            let room_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO room_members (user_id, room_id, joined_at) VALUES (?1, ?2, ?3)",
                params![user1, room_id, now],
            )?;
            tx.execute(
                "INSERT INTO room_members (user_id, room_id, joined_at) VALUES (?1, ?2, ?3)",
                params![user2, room_id, now],
            )?;

            tx.commit()?;
            room_id
        };

        self.get_room_by_id(room_id)
    }

    pub fn add_member(&self, user_id: i64, room_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO room_members (user_id, room_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, room_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, user_id: i64, room_id: i64) -> Result<()> {
        self.conn().execute(
            "DELETE FROM room_members WHERE user_id = ?1 AND room_id = ?2",
            params![user_id, room_id],
        )?;
        Ok(())
    }

    pub fn is_member(&self, user_id: i64, room_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM room_members WHERE user_id = ?1 AND room_id = ?2",
                params![user_id, room_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Member user ids in insertion order.
    pub fn list_members(&self, room_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM room_members
             WHERE room_id = ?1
             ORDER BY joined_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![room_id], |row| row.get(0))?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let kind_raw: String = row.get(2)?;
    let ts_raw: String = row.get(5)?;

    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: column_enum(2, &kind_raw, RoomType::parse)?,
        owner_id: row.get(3)?,
        direct_key: row.get(4)?,
        created_at: column_ts(5, &ts_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::direct_key;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn seed_users(db: &Database) -> (i64, i64) {
        let a = db.create_user("alice", "hash").unwrap();
        let b = db.create_user("bob", "hash").unwrap();
        (a.id, b.id)
    }

    #[test]
    fn create_and_fetch_room() {
        let (_dir, db) = open_db();
        let (alice, _) = seed_users(&db);

        let room = db
            .create_room("general", RoomType::Public, Some(alice))
            .unwrap();
        assert_eq!(room.kind, RoomType::Public);
        assert_eq!(room.owner_id, Some(alice));

        let by_name = db.get_room_by_name("general").unwrap();
        assert_eq!(by_name, room);
    }

    #[test]
    fn direct_room_converges_for_both_orders() {
        let (_dir, db) = open_db();
        let (alice, bob) = seed_users(&db);

        let key = direct_key(alice, bob);
        let first = db.create_direct_room(&key, alice, bob).unwrap();
        let second = db.create_direct_room(&direct_key(bob, alice), bob, alice).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, RoomType::Direct);

        let members = db.list_members(first.id).unwrap();
        assert!(members.contains(&alice));
        assert!(members.contains(&bob));
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn membership_round_trip() {
        let (_dir, db) = open_db();
        let (alice, bob) = seed_users(&db);

        let room = db
            .create_room("secret", RoomType::Private, Some(alice))
            .unwrap();

        assert!(!db.is_member(bob, room.id).unwrap());
        db.add_member(bob, room.id).unwrap();
        // Duplicate insert is a no-op.
        db.add_member(bob, room.id).unwrap();
        assert!(db.is_member(bob, room.id).unwrap());

        db.remove_member(bob, room.id).unwrap();
        assert!(!db.is_member(bob, room.id).unwrap());
    }

    #[test]
    fn list_rooms_covers_public_membership_and_ownership() {
        let (_dir, db) = open_db();
        let (alice, bob) = seed_users(&db);

        db.create_room("general", RoomType::Public, None).unwrap();
        db.create_room("mine", RoomType::Private, Some(alice))
            .unwrap();
        let joined = db
            .create_room("theirs", RoomType::Private, Some(bob))
            .unwrap();
        db.add_member(alice, joined.id).unwrap();
        db.create_room("hidden", RoomType::Private, Some(bob)).unwrap();

        let rooms = db.list_rooms(alice).unwrap();
        let names: Vec<_> = rooms.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"general"));
        assert!(names.contains(&"mine"));
        assert!(names.contains(&"theirs"));
        assert!(!names.contains(&"hidden"));
    }
}
