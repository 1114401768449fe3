//! Friend relationship rules on top of the store.

use std::sync::Arc;

use thiserror::Error;

use wirechat_store::{Database, Friend, FriendStatus, StoreError};

#[derive(Debug, Error)]
pub enum FriendError {
    #[error("cannot send friend request to yourself")]
    CannotFriendSelf,

    #[error("already friends")]
    AlreadyFriends,

    #[error("friend request already exists")]
    RequestAlreadyExists,

    #[error("friend request not found")]
    RequestNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("user is not blocked")]
    NotBlocked,

    #[error("you are blocked by this user")]
    BlockedByTarget,

    #[error("unblock user first before sending friend request")]
    TargetBlocked,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct FriendService {
    db: Arc<Database>,
}

impl FriendService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Send a friend request from one user to another.
    pub fn send_request(&self, from_user: i64, to_user: i64) -> Result<Friend, FriendError> {
        if from_user == to_user {
            return Err(FriendError::CannotFriendSelf);
        }

        self.db
            .get_user_by_id(to_user)
            .map_err(|_| FriendError::UserNotFound)?;

        match self.db.get_friendship(from_user, to_user) {
            Ok(existing) => match existing.status {
                FriendStatus::Accepted => return Err(FriendError::AlreadyFriends),
                FriendStatus::Pending => return Err(FriendError::RequestAlreadyExists),
                FriendStatus::Blocked => {
                    if existing.user_id == to_user {
                        return Err(FriendError::BlockedByTarget);
                    }
                    return Err(FriendError::TargetBlocked);
                }
            },
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(self.db.create_friend_request(from_user, to_user)?)
    }

    /// Accept a pending request that was sent to `user_id`.
    pub fn accept_request(&self, user_id: i64, from_user: i64) -> Result<(), FriendError> {
        let existing = self
            .db
            .get_friendship(from_user, user_id)
            .map_err(|_| FriendError::RequestNotFound)?;

        if existing.status != FriendStatus::Pending || existing.friend_id != user_id {
            return Err(FriendError::RequestNotFound);
        }

        self.db
            .update_friend_status(existing.user_id, existing.friend_id, FriendStatus::Accepted)?;
        Ok(())
    }

    /// Reject (delete) a pending request that was sent to `user_id`.
    pub fn reject_request(&self, user_id: i64, from_user: i64) -> Result<(), FriendError> {
        let existing = self
            .db
            .get_friendship(from_user, user_id)
            .map_err(|_| FriendError::RequestNotFound)?;

        if existing.status != FriendStatus::Pending || existing.friend_id != user_id {
            return Err(FriendError::RequestNotFound);
        }

        self.db
            .delete_friendship(existing.user_id, existing.friend_id)?;
        Ok(())
    }

    /// Block a user, replacing any existing relation.
    pub fn block_user(&self, user_id: i64, target: i64) -> Result<(), FriendError> {
        if user_id == target {
            return Err(FriendError::CannotFriendSelf);
        }

        self.db
            .get_user_by_id(target)
            .map_err(|_| FriendError::UserNotFound)?;

        match self.db.get_friendship(user_id, target) {
            Ok(existing) if existing.user_id == user_id => {
                self.db
                    .update_friend_status(user_id, target, FriendStatus::Blocked)?;
                return Ok(());
            }
            Ok(existing) => {
                // The relation is theirs; replace it with our block row.
                self.db
                    .delete_friendship(existing.user_id, existing.friend_id)?;
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        self.db.create_friend_request(user_id, target)?;
        self.db
            .update_friend_status(user_id, target, FriendStatus::Blocked)?;
        Ok(())
    }

    /// Remove a block previously placed by `user_id`.
    pub fn unblock_user(&self, user_id: i64, target: i64) -> Result<(), FriendError> {
        let existing = self
            .db
            .get_friendship(user_id, target)
            .map_err(|_| FriendError::NotBlocked)?;

        if existing.status != FriendStatus::Blocked || existing.user_id != user_id {
            return Err(FriendError::NotBlocked);
        }

        self.db.delete_friendship(user_id, target)?;
        Ok(())
    }

    /// All accepted friendships involving a user.
    pub fn list_friends(&self, user_id: i64) -> Result<Vec<Friend>, FriendError> {
        Ok(self.db.list_friends(user_id, Some(FriendStatus::Accepted))?)
    }

    /// Incoming pending requests for a user.
    pub fn list_pending(&self, user_id: i64) -> Result<Vec<Friend>, FriendError> {
        let all = self.db.list_friends(user_id, Some(FriendStatus::Pending))?;
        Ok(all.into_iter().filter(|f| f.friend_id == user_id).collect())
    }

    pub fn is_friend(&self, user_id: i64, friend_id: i64) -> Result<bool, FriendError> {
        Ok(self.db.is_friend(user_id, friend_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_service() -> (tempfile::TempDir, Arc<Database>, FriendService) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let service = FriendService::new(db.clone());
        (dir, db, service)
    }

    fn seed_users(db: &Database) -> (i64, i64) {
        let a = db.create_user("alice", "hash").unwrap();
        let b = db.create_user("bob", "hash").unwrap();
        (a.id, b.id)
    }

    #[test]
    fn request_then_accept() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        service.send_request(alice, bob).unwrap();
        assert!(!service.is_friend(alice, bob).unwrap());

        // Only the recipient can accept.
        assert!(matches!(
            service.accept_request(alice, bob),
            Err(FriendError::RequestNotFound)
        ));

        service.accept_request(bob, alice).unwrap();
        assert!(service.is_friend(alice, bob).unwrap());
        assert!(service.is_friend(bob, alice).unwrap());
    }

    #[test]
    fn duplicate_and_self_requests_are_rejected() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        assert!(matches!(
            service.send_request(alice, alice),
            Err(FriendError::CannotFriendSelf)
        ));

        service.send_request(alice, bob).unwrap();
        assert!(matches!(
            service.send_request(alice, bob),
            Err(FriendError::RequestAlreadyExists)
        ));

        service.accept_request(bob, alice).unwrap();
        assert!(matches!(
            service.send_request(bob, alice),
            Err(FriendError::AlreadyFriends)
        ));
    }

    #[test]
    fn reject_deletes_the_request() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        service.send_request(alice, bob).unwrap();
        service.reject_request(bob, alice).unwrap();

        // A fresh request is possible again afterwards.
        service.send_request(alice, bob).unwrap();
    }

    #[test]
    fn block_shadows_and_unblock_restores() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        service.send_request(alice, bob).unwrap();
        service.accept_request(bob, alice).unwrap();

        service.block_user(alice, bob).unwrap();
        assert!(!service.is_friend(alice, bob).unwrap());
        assert!(matches!(
            service.send_request(bob, alice),
            Err(FriendError::BlockedByTarget)
        ));

        service.unblock_user(alice, bob).unwrap();
        service.send_request(bob, alice).unwrap();
    }

    #[test]
    fn pending_list_is_incoming_only() {
        let (_dir, db, service) = open_service();
        let (alice, bob) = seed_users(&db);

        service.send_request(alice, bob).unwrap();

        assert!(service.list_pending(alice).unwrap().is_empty());
        let incoming = service.list_pending(bob).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].user_id, alice);
    }
}
