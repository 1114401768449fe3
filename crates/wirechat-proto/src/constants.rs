/// Wire protocol version. Clients announce theirs in `hello`; the server
/// rejects anything else with `unsupported_version`.
pub const PROTOCOL_VERSION: i32 = 1;

/// Inbound envelope types.
pub const IN_HELLO: &str = "hello";
pub const IN_JOIN: &str = "join";
pub const IN_LEAVE: &str = "leave";
pub const IN_MSG: &str = "msg";
pub const IN_CALL_INVITE: &str = "call.invite";
pub const IN_CALL_ACCEPT: &str = "call.accept";
pub const IN_CALL_REJECT: &str = "call.reject";
pub const IN_CALL_JOIN: &str = "call.join";
pub const IN_CALL_LEAVE: &str = "call.leave";
pub const IN_CALL_END: &str = "call.end";

/// Outbound event tags.
pub const EV_MESSAGE: &str = "message";
pub const EV_USER_JOINED: &str = "user_joined";
pub const EV_USER_LEFT: &str = "user_left";
pub const EV_HISTORY: &str = "history";
pub const EV_CALL_INCOMING: &str = "call.incoming";
pub const EV_CALL_RINGING: &str = "call.ringing";
pub const EV_CALL_ACCEPTED: &str = "call.accepted";
pub const EV_CALL_REJECTED: &str = "call.rejected";
pub const EV_CALL_JOIN_INFO: &str = "call.join-info";
pub const EV_CALL_PARTICIPANT_JOINED: &str = "call.participant-joined";
pub const EV_CALL_PARTICIPANT_LEFT: &str = "call.participant-left";
pub const EV_CALL_ENDED: &str = "call.ended";

/// Call types accepted in `call.invite`.
pub const CALL_TYPE_DIRECT: &str = "direct";
pub const CALL_TYPE_ROOM: &str = "room";
