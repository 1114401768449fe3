//! Bidirectional mapping between wire envelopes and hub commands/events.
//!
//! Field validation happens here, at decode time: a structurally broken
//! payload yields a protocol error that is round-tripped as a single error
//! frame without touching the hub.

use chrono::Utc;

use wirechat_proto::constants::{
    self, CALL_TYPE_DIRECT, CALL_TYPE_ROOM, EV_CALL_ACCEPTED, EV_CALL_ENDED, EV_CALL_INCOMING,
    EV_CALL_JOIN_INFO, EV_CALL_PARTICIPANT_JOINED, EV_CALL_PARTICIPANT_LEFT, EV_CALL_REJECTED,
    EV_CALL_RINGING, EV_HISTORY, EV_MESSAGE, EV_USER_JOINED, EV_USER_LEFT,
};
use wirechat_proto::envelope::{HistoryEvent, MessageEvent, PresenceEvent};
use wirechat_proto::{
    code, CallActionData, CallInviteData, Inbound, MsgData, Outbound, RoomData, WireError,
};

use crate::hub::{CallTarget, ChatMessage, Command, Event};
use crate::session::Identity;

/// Decode a non-`hello` inbound envelope into a hub command.
pub fn inbound_to_command(inbound: &Inbound, sender: &Identity) -> Result<Command, WireError> {
    match inbound.kind.as_str() {
        constants::IN_JOIN => {
            let data: RoomData = parse_payload(inbound)?;
            require_room(&data.room)?;
            Ok(Command::JoinRoom { room: data.room })
        }
        constants::IN_LEAVE => {
            let data: RoomData = parse_payload(inbound)?;
            require_room(&data.room)?;
            Ok(Command::LeaveRoom { room: data.room })
        }
        constants::IN_MSG => {
            let data: MsgData = parse_payload(inbound)?;
            require_room(&data.room)?;
            Ok(Command::SendMessage {
                room: data.room.clone(),
                message: ChatMessage {
                    id: 0,
                    room: data.room,
                    from: sender.username.clone(),
                    text: data.text,
                    created_at: Utc::now(),
                },
            })
        }
        constants::IN_CALL_INVITE => {
            let data: CallInviteData = parse_payload(inbound)?;
            let target = match data.call_type.as_str() {
                CALL_TYPE_DIRECT => {
                    if data.to_user_id == 0 {
                        return Err(WireError::bad_request("to_user_id is required"));
                    }
                    CallTarget::Direct {
                        to_user_id: data.to_user_id,
                    }
                }
                CALL_TYPE_ROOM => {
                    if data.room_id == 0 {
                        return Err(WireError::bad_request("room_id is required"));
                    }
                    CallTarget::Room {
                        room_id: data.room_id,
                    }
                }
                _ => {
                    return Err(WireError::bad_request("call_type must be direct or room"));
                }
            };
            Ok(Command::CallInvite { target })
        }
        constants::IN_CALL_ACCEPT => {
            let data = call_action(inbound)?;
            Ok(Command::CallAccept {
                call_id: data.call_id,
            })
        }
        constants::IN_CALL_REJECT => {
            let data = call_action(inbound)?;
            Ok(Command::CallReject {
                call_id: data.call_id,
                reason: data.reason,
            })
        }
        constants::IN_CALL_JOIN => {
            let data = call_action(inbound)?;
            Ok(Command::CallJoin {
                call_id: data.call_id,
            })
        }
        constants::IN_CALL_LEAVE => {
            let data = call_action(inbound)?;
            Ok(Command::CallLeave {
                call_id: data.call_id,
            })
        }
        constants::IN_CALL_END => {
            let data = call_action(inbound)?;
            Ok(Command::CallEnd {
                call_id: data.call_id,
            })
        }
        _ => Err(WireError::new(code::INVALID_MESSAGE, "unknown message type")),
    }
}

/// Encode a hub event into its outbound envelope.
pub fn outbound_from_event(event: &Event) -> Outbound {
    match event {
        Event::Message { message } => Outbound::event(EV_MESSAGE, &message_event(message)),
        Event::UserJoined { room, user } => Outbound::event(
            EV_USER_JOINED,
            &PresenceEvent {
                room: room.clone(),
                user: user.clone(),
            },
        ),
        Event::UserLeft { room, user } => Outbound::event(
            EV_USER_LEFT,
            &PresenceEvent {
                room: room.clone(),
                user: user.clone(),
            },
        ),
        Event::History { room, messages } => Outbound::event(
            EV_HISTORY,
            &HistoryEvent {
                room: room.clone(),
                messages: messages.iter().map(message_event).collect(),
            },
        ),
        Event::CallIncoming(ev) => Outbound::event(EV_CALL_INCOMING, ev),
        Event::CallRinging(ev) => Outbound::event(EV_CALL_RINGING, ev),
        Event::CallAccepted(ev) => Outbound::event(EV_CALL_ACCEPTED, ev),
        Event::CallRejected(ev) => Outbound::event(EV_CALL_REJECTED, ev),
        Event::CallJoinInfo(ev) => Outbound::event(EV_CALL_JOIN_INFO, ev),
        Event::CallParticipantJoined(ev) => Outbound::event(EV_CALL_PARTICIPANT_JOINED, ev),
        Event::CallParticipantLeft(ev) => Outbound::event(EV_CALL_PARTICIPANT_LEFT, ev),
        Event::CallEnded(ev) => Outbound::event(EV_CALL_ENDED, ev),
        Event::Error(err) => Outbound::error(err.clone()),
    }
}

fn message_event(message: &ChatMessage) -> MessageEvent {
    MessageEvent {
        id: message.id,
        room: message.room.clone(),
        user: message.from.clone(),
        text: message.text.clone(),
        ts: message.created_at.timestamp(),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(inbound: &Inbound) -> Result<T, WireError> {
    serde_json::from_value(inbound.data.clone())
        .map_err(|_| WireError::bad_request("invalid payload"))
}

fn call_action(inbound: &Inbound) -> Result<CallActionData, WireError> {
    let data: CallActionData = parse_payload(inbound)?;
    if data.call_id.is_empty() {
        return Err(WireError::bad_request("call_id is required"));
    }
    Ok(data)
}

fn require_room(room: &str) -> Result<(), WireError> {
    if room.is_empty() {
        return Err(WireError::bad_request("room is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> Identity {
        Identity {
            user_id: 7,
            username: "alice".to_string(),
            is_guest: false,
        }
    }

    fn inbound(kind: &str, data: serde_json::Value) -> Inbound {
        Inbound::new(kind, data)
    }

    #[test]
    fn join_and_leave_decode() {
        let cmd = inbound_to_command(&inbound("join", json!({"room": "general"})), &sender()).unwrap();
        assert_eq!(
            cmd,
            Command::JoinRoom {
                room: "general".to_string()
            }
        );

        let cmd = inbound_to_command(&inbound("leave", json!({"room": "general"})), &sender()).unwrap();
        assert_eq!(
            cmd,
            Command::LeaveRoom {
                room: "general".to_string()
            }
        );
    }

    #[test]
    fn missing_room_is_bad_request() {
        for kind in ["join", "leave", "msg"] {
            let err = inbound_to_command(&inbound(kind, json!({})), &sender()).unwrap_err();
            assert_eq!(err.code, code::BAD_REQUEST);
        }
    }

    #[test]
    fn msg_carries_sender_and_timestamp() {
        let cmd = inbound_to_command(
            &inbound("msg", json!({"room": "general", "text": "hi"})),
            &sender(),
        )
        .unwrap();

        match cmd {
            Command::SendMessage { room, message } => {
                assert_eq!(room, "general");
                assert_eq!(message.from, "alice");
                assert_eq!(message.text, "hi");
                assert_eq!(message.id, 0);
                assert!(message.created_at.timestamp() > 0);
            }
            other => panic!("expected SendMessage, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        let err = inbound_to_command(&inbound("dance", json!({})), &sender()).unwrap_err();
        assert_eq!(err.code, code::INVALID_MESSAGE);
    }

    #[test]
    fn malformed_payload_is_bad_request() {
        let err = inbound_to_command(&inbound("join", json!("not-an-object")), &sender()).unwrap_err();
        assert_eq!(err.code, code::BAD_REQUEST);
    }

    #[test]
    fn call_invite_validates_target() {
        let cmd = inbound_to_command(
            &inbound("call.invite", json!({"call_type": "direct", "to_user_id": 13})),
            &sender(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::CallInvite {
                target: CallTarget::Direct { to_user_id: 13 }
            }
        );

        let err = inbound_to_command(
            &inbound("call.invite", json!({"call_type": "direct"})),
            &sender(),
        )
        .unwrap_err();
        assert_eq!(err.code, code::BAD_REQUEST);

        let err = inbound_to_command(
            &inbound("call.invite", json!({"call_type": "conference", "room_id": 1})),
            &sender(),
        )
        .unwrap_err();
        assert_eq!(err.code, code::BAD_REQUEST);
    }

    #[test]
    fn call_actions_require_call_id() {
        for kind in [
            "call.accept",
            "call.reject",
            "call.join",
            "call.leave",
            "call.end",
        ] {
            let err = inbound_to_command(&inbound(kind, json!({})), &sender()).unwrap_err();
            assert_eq!(err.code, code::BAD_REQUEST, "{kind}");
        }

        let cmd = inbound_to_command(
            &inbound("call.reject", json!({"call_id": "c1", "reason": "busy"})),
            &sender(),
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::CallReject {
                call_id: "c1".to_string(),
                reason: "busy".to_string()
            }
        );
    }

    #[test]
    fn message_event_encodes_unix_seconds() {
        let message = ChatMessage {
            id: 9,
            room: "general".to_string(),
            from: "alice".to_string(),
            text: "hi".to_string(),
            created_at: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let out = outbound_from_event(&Event::Message { message });
        let json = serde_json::to_value(&out).unwrap();

        assert_eq!(json["type"], "event");
        assert_eq!(json["event"], "message");
        assert_eq!(json["data"]["id"], 9);
        assert_eq!(json["data"]["user"], "alice");
        assert_eq!(json["data"]["ts"], 1_700_000_000);
    }

    #[test]
    fn error_event_encodes_error_frame() {
        let out = outbound_from_event(&Event::Error(WireError::new(
            code::RATE_LIMITED,
            "too many messages",
        )));
        let json = serde_json::to_value(&out).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["code"], "rate_limited");
    }
}
