//! Call engine adapter.
//!
//! Abstracts the external media SFU behind [`CallEngine`]: the calls service
//! asks it for an external room name at call creation, for per-participant
//! join credentials, and for teardown at call end. The media plane itself
//! never touches this server.

use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use wirechat_store::Call;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("call has no external room")]
    MissingExternalRoom,

    #[error("generate token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Credentials a participant needs to join the media room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinInfo {
    /// SFU WebSocket URL (e.g. `ws://localhost:7880`).
    pub url: String,
    /// Access token scoped to the external room.
    pub token: String,
    /// External room name.
    pub room_name: String,
    /// Participant identity inside the room, `user-<id>`.
    pub identity: String,
}

/// Media backend seam between the calls service and the SFU.
pub trait CallEngine: Send + Sync {
    /// Allocate the media room for a call and return its external id.
    fn create_call(&self, call: &Call) -> Result<String, EngineError>;

    /// Tear down the media room.
    fn end_call(&self, call: &Call) -> Result<(), EngineError>;

    /// Mint join credentials for one participant.
    fn join_info(&self, call: &Call, user_id: i64, username: &str) -> Result<JoinInfo, EngineError>;
}

/// [`CallEngine`] backed by LiveKit.
pub struct LiveKitEngine {
    api_key: String,
    api_secret: String,
    ws_url: String,
}

/// LiveKit access-token claims: standard JWT registered claims plus the
/// `video` grant block.
#[derive(Serialize)]
struct LiveKitClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    name: &'a str,
    nbf: i64,
    exp: i64,
    video: VideoGrant<'a>,
}

#[derive(Serialize)]
struct VideoGrant<'a> {
    #[serde(rename = "roomJoin")]
    room_join: bool,
    room: &'a str,
}

impl LiveKitEngine {
    pub fn new(api_key: String, api_secret: String, ws_url: String) -> Self {
        Self {
            api_key,
            api_secret,
            ws_url,
        }
    }
}

impl CallEngine for LiveKitEngine {
    /// LiveKit creates rooms on demand when the first participant connects,
    /// so allocation is just picking the name: `wirechat-<type>-<call_id>`.
    fn create_call(&self, call: &Call) -> Result<String, EngineError> {
        Ok(format!("wirechat-{}-{}", call.kind.as_str(), call.id))
    }

    /// Rooms auto-expire once empty; deleting eagerly would need the LiveKit
    /// server API, which the dev deployment does not expose.
    fn end_call(&self, _call: &Call) -> Result<(), EngineError> {
        Ok(())
    }

    fn join_info(&self, call: &Call, user_id: i64, username: &str) -> Result<JoinInfo, EngineError> {
        let room = call
            .external_room_id
            .as_deref()
            .ok_or(EngineError::MissingExternalRoom)?;

        let identity = format!("user-{user_id}");
        let now = chrono::Utc::now();

        let claims = LiveKitClaims {
            iss: &self.api_key,
            sub: &identity,
            name: username,
            nbf: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
            video: VideoGrant {
                room_join: true,
                room,
            },
        };

        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.api_secret.as_bytes()),
        )?;

        Ok(JoinInfo {
            url: self.ws_url.clone(),
            token,
            room_name: room.to_string(),
            identity,
        })
    }
}
