//! Call lifecycle business rules.
//!
//! Sits between the hub / REST handlers and the store + engine adapter.
//! Status only ever moves forward: `ringing -> active -> ended|failed`.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use wirechat_proto::code;
use wirechat_store::{
    AllowCallsFrom, Call, CallMode, CallParticipant, CallStatus, CallType, Database, StoreError,
};

use crate::engine::{CallEngine, EngineError, JoinInfo};
use crate::friends::{FriendError, FriendService};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot call yourself")]
    CannotCallSelf,

    #[error("user not found")]
    UserNotFound,

    #[error("user does not accept calls from non-friends")]
    CallsNotAllowed,

    #[error("room not found")]
    RoomNotFound,

    #[error("not a member of this room")]
    NotRoomMember,

    #[error("call not found")]
    CallNotFound,

    #[error("call has ended")]
    CallEnded,

    #[error("not a participant in this call")]
    NotParticipant,

    #[error("calls are not available")]
    EngineDisabled,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Friends(#[from] FriendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CallError {
    /// Stable wire code surfaced over the WebSocket session.
    pub fn wire_code(&self) -> &'static str {
        match self {
            CallError::CannotCallSelf | CallError::UserNotFound => code::BAD_REQUEST,
            CallError::CallsNotAllowed => code::CALLS_NOT_ALLOWED,
            CallError::RoomNotFound => code::ROOM_NOT_FOUND,
            CallError::NotRoomMember => code::ACCESS_DENIED,
            CallError::CallNotFound => code::CALL_NOT_FOUND,
            CallError::CallEnded => code::CALL_ENDED,
            CallError::NotParticipant => code::NOT_PARTICIPANT,
            CallError::EngineDisabled => code::CALLS_DISABLED,
            CallError::Engine(_) | CallError::Friends(_) | CallError::Store(_) => {
                code::INTERNAL_ERROR
            }
        }
    }
}

pub struct CallService {
    db: Arc<Database>,
    engine: Option<Arc<dyn CallEngine>>,
    friends: Arc<FriendService>,
}

impl CallService {
    /// `engine` is `None` when the SFU integration is disabled; every
    /// operation that needs media credentials then fails with
    /// [`CallError::EngineDisabled`].
    pub fn new(
        db: Arc<Database>,
        engine: Option<Arc<dyn CallEngine>>,
        friends: Arc<FriendService>,
    ) -> Self {
        Self {
            db,
            engine,
            friends,
        }
    }

    fn engine(&self) -> Result<&Arc<dyn CallEngine>, CallError> {
        self.engine.as_ref().ok_or(CallError::EngineDisabled)
    }

    /// Start a direct call. Enforces the target's call privacy setting.
    pub fn create_direct_call(&self, from_user: i64, to_user: i64) -> Result<Call, CallError> {
        self.engine()?;

        if from_user == to_user {
            return Err(CallError::CannotCallSelf);
        }

        self.db
            .get_user_by_id(to_user)
            .map_err(|_| CallError::UserNotFound)?;

        let setting = self.db.get_user_call_settings(to_user)?;
        if setting == AllowCallsFrom::FriendsOnly && !self.friends.is_friend(from_user, to_user)? {
            return Err(CallError::CallsNotAllowed);
        }

        let mut call = self.new_call(CallType::Direct, from_user, None);
        let external = self.engine()?.create_call(&call)?;
        call.external_room_id = Some(external);

        self.db.create_call(&call)?;
        for user_id in [from_user, to_user] {
            self.db.add_participant(&blank_participant(&call.id, user_id))?;
        }

        tracing::info!(
            call_id = %call.id,
            from_user_id = from_user,
            to_user_id = to_user,
            "direct call created"
        );
        Ok(call)
    }

    /// Start a call in a chat room. The initiator must be a member; other
    /// members are added as participants when they accept or join.
    pub fn create_room_call(&self, initiator: i64, room_id: i64) -> Result<Call, CallError> {
        self.engine()?;

        let room = self
            .db
            .get_room_by_id(room_id)
            .map_err(|_| CallError::RoomNotFound)?;

        if !self.db.is_member(initiator, room.id)? {
            return Err(CallError::NotRoomMember);
        }

        let mut call = self.new_call(CallType::Room, initiator, Some(room.id));
        let external = self.engine()?.create_call(&call)?;
        call.external_room_id = Some(external);

        self.db.create_call(&call)?;
        self.db
            .add_participant(&blank_participant(&call.id, initiator))?;

        tracing::info!(call_id = %call.id, user_id = initiator, room_id, "room call created");
        Ok(call)
    }

    pub fn get_call(&self, call_id: &str) -> Result<Call, CallError> {
        self.db.get_call(call_id).map_err(|_| CallError::CallNotFound)
    }

    /// Mint join credentials, stamping `joined_at` and flipping a ringing
    /// call to active on first join. Room members who are not yet
    /// participants are added late.
    pub fn join_info(&self, call_id: &str, user_id: i64) -> Result<JoinInfo, CallError> {
        self.engine()?;

        let mut call = self.get_call(call_id)?;
        if call.status.is_over() {
            return Err(CallError::CallEnded);
        }

        let mut participant = match self.db.get_participant(call_id, user_id) {
            Ok(p) => p,
            Err(StoreError::NotFound) => {
                let room_id = match (call.kind, call.room_id) {
                    (CallType::Room, Some(room_id)) => room_id,
                    _ => return Err(CallError::NotParticipant),
                };
                if !self.db.is_member(user_id, room_id)? {
                    return Err(CallError::NotParticipant);
                }
                let p = blank_participant(call_id, user_id);
                self.db.add_participant(&p)?;
                self.db.get_participant(call_id, user_id)?
            }
            Err(e) => return Err(e.into()),
        };

        if participant.joined_at.is_none() {
            participant.joined_at = Some(Utc::now());
            if let Err(e) = self.db.update_participant(&participant) {
                tracing::warn!(call_id, user_id, error = %e, "failed to stamp joined_at");
            }
        }

        if call.status == CallStatus::Ringing {
            call.status = CallStatus::Active;
            call.updated_at = Utc::now();
            if let Err(e) = self.db.update_call(&call) {
                tracing::warn!(call_id, error = %e, "failed to mark call active");
            }
        }

        let user = self.db.get_user_by_id(user_id)?;
        Ok(self.engine()?.join_info(&call, user_id, &user.username)?)
    }

    /// End a call for everyone. Idempotent once the call is over.
    pub fn end_call(&self, call_id: &str, by_user: i64) -> Result<(), CallError> {
        let mut call = self.get_call(call_id)?;
        if call.status.is_over() {
            return Ok(());
        }

        if self.db.get_participant(call_id, by_user).is_err() && call.initiator_user_id != by_user {
            return Err(CallError::NotParticipant);
        }

        let now = Utc::now();
        call.status = CallStatus::Ended;
        call.ended_at = Some(now);
        call.updated_at = now;
        self.db.update_call(&call)?;

        if let Some(engine) = &self.engine {
            if let Err(e) = engine.end_call(&call) {
                tracing::warn!(call_id, error = %e, "engine teardown failed");
            }
        }

        tracing::info!(call_id, user_id = by_user, "call ended");
        Ok(())
    }

    /// Decline a ringing call. Ends it and stamps the rejecting participant.
    pub fn reject_call(&self, call_id: &str, by_user: i64, reason: &str) -> Result<(), CallError> {
        let mut call = self.get_call(call_id)?;
        if call.status != CallStatus::Ringing {
            return Err(CallError::CallEnded);
        }

        let mut participant = self
            .db
            .get_participant(call_id, by_user)
            .map_err(|_| CallError::NotParticipant)?;

        let now = Utc::now();
        call.status = CallStatus::Ended;
        call.ended_at = Some(now);
        call.updated_at = now;
        self.db.update_call(&call)?;

        participant.left_at = Some(now);
        if !reason.is_empty() {
            participant.reason = Some(reason.to_string());
        }
        if let Err(e) = self.db.update_participant(&participant) {
            tracing::warn!(call_id, user_id = by_user, error = %e, "failed to stamp rejection");
        }

        Ok(())
    }

    /// Mark a participant as gone; the call ends once everyone has left.
    pub fn leave_call(&self, call_id: &str, user_id: i64) -> Result<(), CallError> {
        let mut participant = self
            .db
            .get_participant(call_id, user_id)
            .map_err(|_| CallError::NotParticipant)?;

        let now = Utc::now();
        participant.left_at = Some(now);
        participant.reason = Some("left".to_string());
        self.db.update_participant(&participant)?;

        let participants = self.db.list_participants(call_id)?;
        let all_left = participants.iter().all(|p| p.left_at.is_some());
        if all_left {
            if let Ok(mut call) = self.db.get_call(call_id) {
                if !call.status.is_over() {
                    call.status = CallStatus::Ended;
                    call.ended_at = Some(now);
                    call.updated_at = now;
                    if let Err(e) = self.db.update_call(&call) {
                        tracing::warn!(call_id, error = %e, "failed to end drained call");
                    }
                }
            }
        }

        Ok(())
    }

    pub fn list_active_calls(&self, user_id: i64) -> Result<Vec<Call>, CallError> {
        Ok(self.db.list_active_calls(user_id)?)
    }

    pub fn participants(&self, call_id: &str) -> Result<Vec<CallParticipant>, CallError> {
        Ok(self.db.list_participants(call_id)?)
    }

    pub fn target_username(&self, user_id: i64) -> Result<String, CallError> {
        let user = self
            .db
            .get_user_by_id(user_id)
            .map_err(|_| CallError::UserNotFound)?;
        Ok(user.username)
    }

    pub fn room_members(&self, room_id: i64) -> Result<Vec<i64>, CallError> {
        Ok(self.db.list_members(room_id)?)
    }

    pub fn room_name(&self, room_id: i64) -> Result<String, CallError> {
        let room = self
            .db
            .get_room_by_id(room_id)
            .map_err(|_| CallError::RoomNotFound)?;
        Ok(room.name)
    }

    fn new_call(&self, kind: CallType, initiator: i64, room_id: Option<i64>) -> Call {
        let now = Utc::now();
        Call {
            id: Uuid::new_v4().to_string(),
            kind,
            mode: CallMode::Livekit,
            initiator_user_id: initiator,
            room_id,
            status: CallStatus::Ringing,
            external_room_id: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }
}

fn blank_participant(call_id: &str, user_id: i64) -> CallParticipant {
    CallParticipant {
        id: 0,
        call_id: call_id.to_string(),
        user_id,
        joined_at: None,
        left_at: None,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirechat_store::RoomType;

    /// Engine stub that mints predictable room names and tokens.
    struct FakeEngine;

    impl CallEngine for FakeEngine {
        fn create_call(&self, call: &Call) -> Result<String, EngineError> {
            Ok(format!("fake-{}", call.id))
        }

        fn end_call(&self, _call: &Call) -> Result<(), EngineError> {
            Ok(())
        }

        fn join_info(
            &self,
            call: &Call,
            user_id: i64,
            _username: &str,
        ) -> Result<JoinInfo, EngineError> {
            let room = call
                .external_room_id
                .clone()
                .ok_or(EngineError::MissingExternalRoom)?;
            Ok(JoinInfo {
                url: "ws://fake".to_string(),
                token: "fake-token".to_string(),
                room_name: room,
                identity: format!("user-{user_id}"),
            })
        }
    }

    fn open_service() -> (tempfile::TempDir, Arc<Database>, CallService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let friends = Arc::new(FriendService::new(db.clone()));
        let service = CallService::new(db.clone(), Some(Arc::new(FakeEngine)), friends);
        (dir, db, service)
    }

    fn seed_users(db: &Database) -> (i64, i64) {
        let a = db.create_user("alice", "hash").unwrap();
        let b = db.create_user("bob", "hash").unwrap();
        (a.id, b.id)
    }

    #[test]
    fn direct_call_creates_call_and_participants() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let call = service.create_direct_call(alice, bob).unwrap();
        assert_eq!(call.status, CallStatus::Ringing);
        assert_eq!(call.kind, CallType::Direct);
        assert_eq!(call.external_room_id.as_deref(), Some(format!("fake-{}", call.id).as_str()));

        let participants = service.participants(&call.id).unwrap();
        assert_eq!(participants.len(), 2);
        assert!(participants.iter().all(|p| p.joined_at.is_none()));
    }

    #[test]
    fn self_call_and_unknown_target_are_rejected() {
        let (_dir, db, service) = open_service();
        let (alice, _) = seed_users(&db);

        assert!(matches!(
            service.create_direct_call(alice, alice),
            Err(CallError::CannotCallSelf)
        ));
        assert!(matches!(
            service.create_direct_call(alice, 999),
            Err(CallError::UserNotFound)
        ));
    }

    #[test]
    fn friends_only_blocks_strangers() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        db.update_user_call_settings(bob, AllowCallsFrom::FriendsOnly)
            .unwrap();
        assert!(matches!(
            service.create_direct_call(alice, bob),
            Err(CallError::CallsNotAllowed)
        ));

        db.create_friend_request(alice, bob).unwrap();
        db.update_friend_status(alice, bob, wirechat_store::FriendStatus::Accepted)
            .unwrap();
        service.create_direct_call(alice, bob).unwrap();
    }

    #[test]
    fn join_activates_and_stamps_participant() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let call = service.create_direct_call(alice, bob).unwrap();
        let info = service.join_info(&call.id, bob).unwrap();
        assert_eq!(info.identity, format!("user-{bob}"));

        let reloaded = service.get_call(&call.id).unwrap();
        assert_eq!(reloaded.status, CallStatus::Active);
        assert!(db.get_participant(&call.id, bob).unwrap().joined_at.is_some());
    }

    #[test]
    fn room_call_requires_membership_and_late_adds_joiners() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let room = db.create_room("team", RoomType::Private, Some(alice)).unwrap();
        db.add_member(alice, room.id).unwrap();

        assert!(matches!(
            service.create_room_call(bob, room.id),
            Err(CallError::NotRoomMember)
        ));

        let call = service.create_room_call(alice, room.id).unwrap();
        assert_eq!(service.participants(&call.id).unwrap().len(), 1);

        // Bob is not yet a participant; joining fails until he is a member.
        assert!(matches!(
            service.join_info(&call.id, bob),
            Err(CallError::NotParticipant)
        ));

        db.add_member(bob, room.id).unwrap();
        service.join_info(&call.id, bob).unwrap();
        assert_eq!(service.participants(&call.id).unwrap().len(), 2);
    }

    #[test]
    fn reject_only_from_ringing() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let call = service.create_direct_call(alice, bob).unwrap();
        service.join_info(&call.id, bob).unwrap(); // ringing -> active

        assert!(matches!(
            service.reject_call(&call.id, bob, "busy"),
            Err(CallError::CallEnded)
        ));

        let second = service.create_direct_call(alice, bob).unwrap();
        service.reject_call(&second.id, bob, "busy").unwrap();

        let reloaded = service.get_call(&second.id).unwrap();
        assert_eq!(reloaded.status, CallStatus::Ended);
        assert!(reloaded.ended_at.is_some());
        let participant = db.get_participant(&second.id, bob).unwrap();
        assert_eq!(participant.reason.as_deref(), Some("busy"));
    }

    #[test]
    fn end_call_is_idempotent() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let call = service.create_direct_call(alice, bob).unwrap();
        service.end_call(&call.id, alice).unwrap();

        let first = service.get_call(&call.id).unwrap();
        assert_eq!(first.status, CallStatus::Ended);
        let ended_at = first.ended_at.unwrap();

        // Second end is a no-op with unchanged timestamps.
        service.end_call(&call.id, alice).unwrap();
        let second = service.get_call(&call.id).unwrap();
        assert_eq!(second.ended_at.unwrap(), ended_at);
    }

    #[test]
    fn end_call_requires_participation() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);
        let carol = db.create_user("carol", "hash").unwrap();

        let call = service.create_direct_call(alice, bob).unwrap();
        assert!(matches!(
            service.end_call(&call.id, carol.id),
            Err(CallError::NotParticipant)
        ));
    }

    #[test]
    fn call_ends_when_everyone_leaves() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        let call = service.create_direct_call(alice, bob).unwrap();
        service.leave_call(&call.id, alice).unwrap();
        assert_eq!(service.get_call(&call.id).unwrap().status, CallStatus::Ringing);

        service.leave_call(&call.id, bob).unwrap();
        let reloaded = service.get_call(&call.id).unwrap();
        assert_eq!(reloaded.status, CallStatus::Ended);
        assert!(reloaded.ended_at.is_some());
    }

    #[test]
    fn disabled_engine_surfaces_calls_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let friends = Arc::new(FriendService::new(db.clone()));
        let service = CallService::new(db.clone(), None, friends);
        let (alice, bob) = seed_users(&db);

        let err = service.create_direct_call(alice, bob).unwrap_err();
        assert!(matches!(err, CallError::EngineDisabled));
        assert_eq!(err.wire_code(), code::CALLS_DISABLED);
    }
}
