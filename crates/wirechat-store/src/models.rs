use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered or guest user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_guest: bool,
    /// Session tracking id for guest users.
    pub session_id: Option<String>,
    pub allow_calls_from: AllowCallsFrom,
    pub created_at: DateTime<Utc>,
}

/// Who may place direct calls to a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllowCallsFrom {
    Everyone,
    FriendsOnly,
}

impl AllowCallsFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowCallsFrom::Everyone => "everyone",
            AllowCallsFrom::FriendsOnly => "friends_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "everyone" => Some(AllowCallsFrom::Everyone),
            "friends_only" => Some(AllowCallsFrom::FriendsOnly),
            _ => None,
        }
    }
}

/// Access class of a persisted room.
///
/// `Channel` is reserved and never joinable over the WebSocket surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomType {
    Public,
    Private,
    Direct,
    Channel,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::Public => "public",
            RoomType::Private => "private",
            RoomType::Direct => "direct",
            RoomType::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(RoomType::Public),
            "private" => Some(RoomType::Private),
            "direct" => Some(RoomType::Direct),
            "channel" => Some(RoomType::Channel),
            _ => None,
        }
    }
}

/// A persisted chat room. Orthogonal to the hub's in-memory presence rooms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RoomType,
    /// None for public rooms created without an owner.
    pub owner_id: Option<i64>,
    /// For direct rooms: `dm:<min_user_id>:<max_user_id>`.
    pub direct_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Compose the deduplication key for a direct room between two users.
pub fn direct_key(a: i64, b: i64) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm:{lo}:{hi}")
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub room_id: i64,
    pub user_id: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Friendship state machine: a pending request either becomes accepted or is
/// deleted; blocked rows shadow any other relation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    Pending,
    Accepted,
    Blocked,
}

impl FriendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendStatus::Pending => "pending",
            FriendStatus::Accepted => "accepted",
            FriendStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FriendStatus::Pending),
            "accepted" => Some(FriendStatus::Accepted),
            "blocked" => Some(FriendStatus::Blocked),
            _ => None,
        }
    }
}

/// A directed friendship row. `user_id` is the requester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friend {
    pub id: i64,
    pub user_id: i64,
    pub friend_id: i64,
    pub status: FriendStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Direct,
    Room,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Direct => "direct",
            CallType::Room => "room",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(CallType::Direct),
            "room" => Some(CallType::Room),
            _ => None,
        }
    }
}

/// Media backend for a call. Only LiveKit today.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    Livekit,
}

impl CallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMode::Livekit => "livekit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "livekit" => Some(CallMode::Livekit),
            _ => None,
        }
    }
}

/// Call lifecycle. Progresses `ringing -> active -> ended|failed`, never
/// backwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(CallStatus::Ringing),
            "active" => Some(CallStatus::Active),
            "ended" => Some(CallStatus::Ended),
            "failed" => Some(CallStatus::Failed),
            _ => None,
        }
    }

    pub fn is_over(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Failed)
    }
}

/// A voice/video call signaling record. Media is carried by the external SFU.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Call {
    /// UUID, assigned by the calls service.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CallType,
    pub mode: CallMode,
    pub initiator_user_id: i64,
    pub room_id: Option<i64>,
    pub status: CallStatus,
    /// Name of the media room at the external SFU.
    pub external_room_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A user's membership in a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallParticipant {
    pub id: i64,
    pub call_id: String,
    pub user_id: i64,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_is_order_independent() {
        assert_eq!(direct_key(7, 13), direct_key(13, 7));
        assert_eq!(direct_key(7, 13), "dm:7:13");
    }

    #[test]
    fn enum_string_round_trips() {
        for kind in [
            RoomType::Public,
            RoomType::Private,
            RoomType::Direct,
            RoomType::Channel,
        ] {
            assert_eq!(RoomType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RoomType::parse("secret"), None);

        for status in [
            CallStatus::Ringing,
            CallStatus::Active,
            CallStatus::Ended,
            CallStatus::Failed,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
    }
}
