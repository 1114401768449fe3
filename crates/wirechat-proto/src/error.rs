use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable wire error codes. These are part of the protocol contract and must
/// not change without a protocol version bump.
pub mod code {
    pub const UNSUPPORTED_VERSION: &str = "unsupported_version";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const ROOM_NOT_FOUND: &str = "room_not_found";
    pub const ALREADY_JOINED: &str = "already_joined";
    pub const NOT_IN_ROOM: &str = "not_in_room";
    pub const ACCESS_DENIED: &str = "access_denied";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const CALLS_DISABLED: &str = "calls_disabled";
    pub const CALL_NOT_FOUND: &str = "call_not_found";
    pub const CALL_ENDED: &str = "call_ended";
    pub const NOT_PARTICIPANT: &str = "not_participant";
    pub const NOT_FRIENDS: &str = "not_friends";
    pub const CALLS_NOT_ALLOWED: &str = "calls_not_allowed";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// An error delivered to the client inside an `{"type":"error"}` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub code: String,
    pub msg: String,
}

impl WireError {
    pub fn new(code: &str, msg: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(code::BAD_REQUEST, msg)
    }

    pub fn internal() -> Self {
        Self::new(code::INTERNAL_ERROR, "internal server error")
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.msg)
    }
}

impl std::error::Error for WireError {}
