//! JSON envelopes exchanged over the WebSocket session.
//!
//! Inbound frames are `{"type": "<tag>", "data": {..}}`; outbound frames are
//! either `{"type": "event", "event": "<tag>", "data": {..}}` or
//! `{"type": "error", "error": {"code", "msg"}}`. Payload fields follow the
//! original protocol bit-for-bit: absent fields decode to their zero values
//! and are validated (not rejected) by the codec layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;

/// Envelope for messages coming from the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Inbound {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }
}

/// `hello` payload. Every field is optional; an empty token with
/// `jwt_required` off selects guest mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloData {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub protocol: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

/// `join` / `leave` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomData {
    #[serde(default)]
    pub room: String,
}

/// `msg` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgData {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub text: String,
}

/// `call.invite` payload. `call_type` selects which target field applies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallInviteData {
    #[serde(default)]
    pub call_type: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub to_user_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub room_id: i64,
}

/// Payload shared by `call.accept|reject|join|leave|end`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallActionData {
    #[serde(default)]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Envelope for messages sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Outbound {
    /// Build an `event` frame. Serialization of the payload is infallible for
    /// the event structs below, so failures collapse to a null body.
    pub fn event<T: Serialize>(tag: &str, data: &T) -> Self {
        Self {
            kind: "event".to_string(),
            event: tag.to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            error: None,
        }
    }

    pub fn error(err: WireError) -> Self {
        Self {
            kind: "error".to_string(),
            event: String::new(),
            data: Value::Null,
            error: Some(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// `message` event body. `ts` is Unix seconds; `id = 0` marks an ephemeral
/// (guest or unpersisted) message with no history cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: i64,
    pub room: String,
    pub user: String,
    pub text: String,
    pub ts: i64,
}

/// `user_joined` / `user_left` event body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub room: String,
    pub user: String,
}

/// `history` event body, unicast to a joiner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEvent {
    pub room: String,
    pub messages: Vec<MessageEvent>,
}

/// `call.incoming` event body, routed to invited users.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallIncomingEvent {
    pub call_id: String,
    pub call_type: String,
    pub from_user_id: i64,
    pub from_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
}

/// `call.ringing` event body, unicast to the initiator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRingingEvent {
    pub call_id: String,
    pub call_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<i64>,
}

/// `call.accepted` / `call.participant-joined` / `call.participant-left`
/// event body: which user did what to which call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallPeerEvent {
    pub call_id: String,
    pub user_id: i64,
    pub user: String,
}

/// `call.rejected` event body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRejectedEvent {
    pub call_id: String,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// `call.join-info` event body: credentials for the external media room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallJoinInfoEvent {
    pub call_id: String,
    pub url: String,
    pub token: String,
    pub room_name: String,
    pub identity: String,
}

/// `call.ended` event body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallEndedEvent {
    pub call_id: String,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;

    #[test]
    fn inbound_round_trip() {
        let raw = r#"{"type":"msg","data":{"room":"general","text":"hi"}}"#;
        let env: Inbound = serde_json::from_str(raw).unwrap();
        assert_eq!(env.kind, "msg");

        let encoded = serde_json::to_string(&env).unwrap();
        let again: Inbound = serde_json::from_str(&encoded).unwrap();
        assert_eq!(env, again);
    }

    #[test]
    fn inbound_missing_data_defaults_to_null() {
        let env: Inbound = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert!(env.data.is_null());
    }

    #[test]
    fn hello_fields_default_to_zero_values() {
        let hello: HelloData = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(hello.protocol, 0);
        assert!(hello.token.is_empty());
        assert!(hello.user.is_empty());
    }

    #[test]
    fn outbound_event_shape() {
        let out = Outbound::event(
            crate::constants::EV_MESSAGE,
            &MessageEvent {
                id: 7,
                room: "general".into(),
                user: "alice".into(),
                text: "hi".into(),
                ts: 1700000000,
            },
        );
        let json: Value = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "message");
        assert_eq!(json["data"]["id"], 7);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn outbound_error_shape() {
        let out = Outbound::error(WireError::new(code::RATE_LIMITED, "too many messages"));
        let json: Value = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["code"], "rate_limited");
        assert!(json.get("event").is_none());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn outbound_round_trip() {
        let out = Outbound::error(WireError::bad_request("room is required"));
        let encoded = serde_json::to_string(&out).unwrap();
        let again: Outbound = serde_json::from_str(&encoded).unwrap();
        assert_eq!(out, again);
    }
}
