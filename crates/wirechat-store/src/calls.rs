use rusqlite::{params, OptionalExtension};

use crate::database::{column_enum, column_ts, column_ts_opt, Database};
use crate::error::{Result, StoreError};
use crate::models::{Call, CallMode, CallParticipant, CallStatus, CallType};

const CALL_COLUMNS: &str = "id, type, mode, initiator_user_id, room_id, status, external_room_id, created_at, updated_at, ended_at";
const PARTICIPANT_COLUMNS: &str = "id, call_id, user_id, joined_at, left_at, reason";

impl Database {
    pub fn create_call(&self, call: &Call) -> Result<()> {
        self.conn().execute(
            "INSERT INTO calls (id, type, mode, initiator_user_id, room_id, status,
                                external_room_id, created_at, updated_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                call.id,
                call.kind.as_str(),
                call.mode.as_str(),
                call.initiator_user_id,
                call.room_id,
                call.status.as_str(),
                call.external_room_id,
                call.created_at.to_rfc3339(),
                call.updated_at.to_rfc3339(),
                call.ended_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn update_call(&self, call: &Call) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE calls
             SET status = ?1, external_room_id = ?2, updated_at = ?3, ended_at = ?4
             WHERE id = ?5",
            params![
                call.status.as_str(),
                call.external_room_id,
                call.updated_at.to_rfc3339(),
                call.ended_at.map(|t| t.to_rfc3339()),
                call.id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn get_call(&self, id: &str) -> Result<Call> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id],
                row_to_call,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Ringing or active calls the user participates in.
    pub fn list_active_calls(&self, user_id: i64) -> Result<Vec<Call>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT c.id, c.type, c.mode, c.initiator_user_id, c.room_id, c.status,
                             c.external_room_id, c.created_at, c.updated_at, c.ended_at
             FROM calls c
             JOIN call_participants cp ON c.id = cp.call_id
             WHERE cp.user_id = ?1 AND c.status IN ('ringing', 'active')
             ORDER BY c.created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], row_to_call)?;
        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    /// The ringing/active call for a room, if any.
    pub fn get_active_call_for_room(&self, room_id: i64) -> Result<Option<Call>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CALL_COLUMNS} FROM calls
                     WHERE room_id = ?1 AND status IN ('ringing', 'active')
                     ORDER BY created_at DESC
                     LIMIT 1"
                ),
                params![room_id],
                row_to_call,
            )
            .optional()?)
    }

    pub fn add_participant(&self, p: &CallParticipant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO call_participants (call_id, user_id, joined_at, left_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                p.call_id,
                p.user_id,
                p.joined_at.map(|t| t.to_rfc3339()),
                p.left_at.map(|t| t.to_rfc3339()),
                p.reason,
            ],
        )?;
        Ok(())
    }

    pub fn update_participant(&self, p: &CallParticipant) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE call_participants
             SET joined_at = ?1, left_at = ?2, reason = ?3
             WHERE call_id = ?4 AND user_id = ?5",
            params![
                p.joined_at.map(|t| t.to_rfc3339()),
                p.left_at.map(|t| t.to_rfc3339()),
                p.reason,
                p.call_id,
                p.user_id,
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn get_participant(&self, call_id: &str, user_id: i64) -> Result<CallParticipant> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {PARTICIPANT_COLUMNS} FROM call_participants
                     WHERE call_id = ?1 AND user_id = ?2"
                ),
                params![call_id, user_id],
                row_to_participant,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    pub fn list_participants(&self, call_id: &str) -> Result<Vec<CallParticipant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM call_participants
             WHERE call_id = ?1
             ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map(params![call_id], row_to_participant)?;
        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }
}

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
    let kind_raw: String = row.get(1)?;
    let mode_raw: String = row.get(2)?;
    let status_raw: String = row.get(5)?;
    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;
    let ended_raw: Option<String> = row.get(9)?;

    Ok(Call {
        id: row.get(0)?,
        kind: column_enum(1, &kind_raw, CallType::parse)?,
        mode: column_enum(2, &mode_raw, CallMode::parse)?,
        initiator_user_id: row.get(3)?,
        room_id: row.get(4)?,
        status: column_enum(5, &status_raw, CallStatus::parse)?,
        external_room_id: row.get(6)?,
        created_at: column_ts(7, &created_raw)?,
        updated_at: column_ts(8, &updated_raw)?,
        ended_at: column_ts_opt(9, ended_raw)?,
    })
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallParticipant> {
    let joined_raw: Option<String> = row.get(3)?;
    let left_raw: Option<String> = row.get(4)?;

    Ok(CallParticipant {
        id: row.get(0)?,
        call_id: row.get(1)?,
        user_id: row.get(2)?,
        joined_at: column_ts_opt(3, joined_raw)?,
        left_at: column_ts_opt(4, left_raw)?,
        reason: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn new_call(initiator: i64) -> Call {
        let now = Utc::now();
        Call {
            id: Uuid::new_v4().to_string(),
            kind: CallType::Direct,
            mode: CallMode::Livekit,
            initiator_user_id: initiator,
            room_id: None,
            status: CallStatus::Ringing,
            external_room_id: Some("wirechat-direct-test".to_string()),
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    #[test]
    fn call_round_trip() {
        let (_dir, db) = open_db();
        let alice = db.create_user("alice", "hash").unwrap();

        let call = new_call(alice.id);
        db.create_call(&call).unwrap();

        let loaded = db.get_call(&call.id).unwrap();
        assert_eq!(loaded.status, CallStatus::Ringing);
        assert_eq!(loaded.external_room_id, call.external_room_id);
        assert!(loaded.ended_at.is_none());
    }

    #[test]
    fn update_persists_status_transition() {
        let (_dir, db) = open_db();
        let alice = db.create_user("alice", "hash").unwrap();

        let mut call = new_call(alice.id);
        db.create_call(&call).unwrap();

        call.status = CallStatus::Ended;
        call.ended_at = Some(Utc::now());
        call.updated_at = Utc::now();
        db.update_call(&call).unwrap();

        let loaded = db.get_call(&call.id).unwrap();
        assert_eq!(loaded.status, CallStatus::Ended);
        assert!(loaded.ended_at.is_some());
    }

    #[test]
    fn participants_round_trip() {
        let (_dir, db) = open_db();
        let alice = db.create_user("alice", "hash").unwrap();
        let bob = db.create_user("bob", "hash").unwrap();

        let call = new_call(alice.id);
        db.create_call(&call).unwrap();

        for user_id in [alice.id, bob.id] {
            db.add_participant(&CallParticipant {
                id: 0,
                call_id: call.id.clone(),
                user_id,
                joined_at: None,
                left_at: None,
                reason: None,
            })
            .unwrap();
        }

        let mut participant = db.get_participant(&call.id, bob.id).unwrap();
        assert!(participant.joined_at.is_none());

        participant.joined_at = Some(Utc::now());
        db.update_participant(&participant).unwrap();
        assert!(db.get_participant(&call.id, bob.id).unwrap().joined_at.is_some());

        assert_eq!(db.list_participants(&call.id).unwrap().len(), 2);
    }

    #[test]
    fn active_call_for_room_lookup() {
        let (_dir, db) = open_db();
        let alice = db.create_user("alice", "hash").unwrap();
        let room = db
            .create_room("team", crate::models::RoomType::Public, Some(alice.id))
            .unwrap();

        assert!(db.get_active_call_for_room(room.id).unwrap().is_none());

        let mut call = new_call(alice.id);
        call.kind = CallType::Room;
        call.room_id = Some(room.id);
        db.create_call(&call).unwrap();

        let active = db.get_active_call_for_room(room.id).unwrap().unwrap();
        assert_eq!(active.id, call.id);

        call.status = CallStatus::Ended;
        call.ended_at = Some(Utc::now());
        db.update_call(&call).unwrap();
        assert!(db.get_active_call_for_room(room.id).unwrap().is_none());
    }

    #[test]
    fn active_calls_exclude_ended() {
        let (_dir, db) = open_db();
        let alice = db.create_user("alice", "hash").unwrap();

        let mut call = new_call(alice.id);
        db.create_call(&call).unwrap();
        db.add_participant(&CallParticipant {
            id: 0,
            call_id: call.id.clone(),
            user_id: alice.id,
            joined_at: None,
            left_at: None,
            reason: None,
        })
        .unwrap();

        assert_eq!(db.list_active_calls(alice.id).unwrap().len(), 1);

        call.status = CallStatus::Ended;
        call.ended_at = Some(Utc::now());
        db.update_call(&call).unwrap();

        assert!(db.list_active_calls(alice.id).unwrap().is_empty());
    }
}
