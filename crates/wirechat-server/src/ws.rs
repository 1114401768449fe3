//! WebSocket session adapter.
//!
//! `GET /ws` upgrades the connection, registers a session with the hub, and
//! runs a reader and a writer in parallel. The reader enforces the idle
//! deadline, the handshake, JWT gating, per-session command quotas, and
//! join-time access control before forwarding commands to the hub; the
//! writer drains the session's event outbox and keeps the transport alive
//! with pings. Both halves share one sink, since the reader round-trips
//! protocol error frames directly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use wirechat_proto::envelope::HelloData;
use wirechat_proto::{code, constants, Inbound, Outbound, WireError, PROTOCOL_VERSION};
use wirechat_store::{RoomType, StoreError};

use crate::api::AppState;
use crate::codec::{inbound_to_command, outbound_from_event};
use crate::hub::{Command, Event};
use crate::rate_limit::CommandQuota;
use crate::session::{new_session_id, Identity, Session};

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
const CLOSE_INTERNAL: u16 = 1011;

type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// How a session ended when it did not end cleanly.
struct CloseStatus {
    status: u16,
    reason: String,
}

impl CloseStatus {
    fn internal(reason: impl Into<String>) -> Self {
        Self {
            status: CLOSE_INTERNAL,
            reason: reason.into(),
        }
    }
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    // Any Origin is accepted; tightening is a deployment concern.
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, commands_rx, events_rx) = Session::new(new_session_id(), Identity::default());
    state.hub.register(session.clone(), commands_rx);

    tracing::info!(session_id = %session.id, "ws connected");

    let (sink, stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let cancel = state.shutdown.child_token();

    let writer = tokio::spawn(write_loop(
        sink.clone(),
        events_rx,
        session.clone(),
        state.config.ping_interval,
        cancel.clone(),
    ));

    let read_result = read_loop(stream, sink.clone(), session.clone(), state.clone(), cancel.clone()).await;

    cancel.cancel();
    let _ = writer.await;
    state.hub.unregister(session.id.clone());

    let (status, reason) = match &read_result {
        Ok(()) => (CLOSE_NORMAL, "closing".to_string()),
        Err(close) => {
            tracing::warn!(
                session_id = %session.id,
                status = close.status,
                reason = %close.reason,
                "ws connection closed with error"
            );
            (close.status, close.reason.clone())
        }
    };

    let close_frame = Message::Close(Some(CloseFrame {
        code: status,
        reason: reason.clone().into(),
    }));
    let _ = sink.lock().await.send(close_frame).await;

    tracing::info!(session_id = %session.id, status, reason = %reason, "ws disconnected");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    sink: SharedSink,
    session: Arc<Session>,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), CloseStatus> {
    let config = &state.config;
    let mut join_quota = CommandQuota::new(config.rate_limit_join_per_min);
    let mut msg_quota = CommandQuota::new(config.rate_limit_msg_per_min);
    let mut authenticated = !config.jwt_required;

    let idle = config.client_idle_timeout;
    let mut deadline = tokio::time::Instant::now() + idle;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = tokio::time::timeout_at(deadline, stream.next()) => frame,
        };

        let message = match frame {
            Err(_) => return Err(CloseStatus::internal("idle timeout")),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => {
                return match classify_transport_error(&e) {
                    Some(close) => Err(close),
                    None => Ok(()),
                };
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return Ok(()),
            // Keepalive traffic does not extend the JSON idle deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                return Err(CloseStatus::internal("binary frames are not supported"));
            }
        };

        deadline = tokio::time::Instant::now() + idle;

        let inbound: Inbound = match serde_json::from_str(&text) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "malformed envelope");
                return Err(CloseStatus::internal("malformed envelope"));
            }
        };

        if inbound.kind == constants::IN_HELLO {
            match handle_hello(&inbound, &session, &state) {
                Ok(()) => authenticated = true,
                Err(err) => {
                    tracing::warn!(session_id = %session.id, code = %err.code, "handshake rejected");
                    send_error(&sink, err).await?;
                }
            }
            continue;
        }

        let command = match inbound_to_command(&inbound, &session.identity()) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(
                    session_id = %session.id,
                    kind = %inbound.kind,
                    code = %err.code,
                    "protocol error"
                );
                send_error(&sink, err).await?;
                continue;
            }
        };

        if config.jwt_required && !authenticated {
            send_error(
                &sink,
                WireError::new(code::UNAUTHORIZED, "hello with valid token required"),
            )
            .await?;
            continue;
        }

        let within_quota = match &command {
            Command::JoinRoom { .. } => join_quota.allow(),
            Command::SendMessage { .. } => msg_quota.allow(),
            _ => true,
        };
        if !within_quota {
            send_error(
                &sink,
                WireError::new(code::RATE_LIMITED, "too many requests"),
            )
            .await?;
            continue;
        }

        if let Command::JoinRoom { room } = &command {
            if let Some(err) = check_join_access(&state, &session, room) {
                send_error(&sink, err).await?;
                continue;
            }
        }

        // Blocks when the inbox is full; bounded by the read deadline above.
        if !session.push_command(command).await {
            return Ok(());
        }
    }
}

/// Apply the `hello` handshake to the session. May be repeated; each success
/// overwrites the session's identity.
fn handle_hello(inbound: &Inbound, session: &Arc<Session>, state: &AppState) -> Result<(), WireError> {
    let hello: HelloData = serde_json::from_value(inbound.data.clone())
        .map_err(|_| WireError::bad_request("invalid payload"))?;

    if hello.protocol != 0 && hello.protocol != PROTOCOL_VERSION {
        return Err(WireError::new(
            code::UNSUPPORTED_VERSION,
            "unsupported protocol version",
        ));
    }

    if !hello.token.is_empty() {
        match state.auth.validate(&hello.token) {
            Ok(claims) => {
                session.set_identity(Identity {
                    user_id: claims.user_id,
                    username: claims.username.clone(),
                    is_guest: claims.is_guest,
                });
                state.hub.identify(session.clone());
                tracing::info!(
                    session_id = %session.id,
                    user_id = claims.user_id,
                    username = %claims.username,
                    is_guest = claims.is_guest,
                    "authenticated via jwt"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "invalid jwt token");
                if state.config.jwt_required {
                    return Err(WireError::new(code::UNAUTHORIZED, "invalid token"));
                }
                // Token optional: fall through to guest mode.
            }
        }
    } else if state.config.jwt_required {
        return Err(WireError::new(code::UNAUTHORIZED, "token required"));
    }

    let username = if hello.user.is_empty() {
        format!("guest-{}", &session.id[..8])
    } else {
        hello.user
    };
    session.set_identity(Identity {
        user_id: 0,
        username: username.clone(),
        is_guest: true,
    });
    tracing::info!(session_id = %session.id, username = %username, "connected as guest");
    Ok(())
}

/// Evaluate room access for a join before it reaches the hub: public rooms
/// are open, private and direct rooms require recorded membership, anything
/// else is denied.
fn check_join_access(state: &AppState, session: &Arc<Session>, room_name: &str) -> Option<WireError> {
    let room = match state.db.get_room_by_name(room_name) {
        Ok(room) => room,
        Err(StoreError::NotFound) => {
            return Some(WireError::new(code::ROOM_NOT_FOUND, "room does not exist"));
        }
        Err(e) => {
            tracing::error!(room = %room_name, error = %e, "failed to resolve room");
            return Some(WireError::internal());
        }
    };

    match room.kind {
        RoomType::Public => None,
        RoomType::Private | RoomType::Direct => {
            match state.db.is_member(session.user_id(), room.id) {
                Ok(true) => None,
                Ok(false) => {
                    tracing::warn!(
                        session_id = %session.id,
                        user_id = session.user_id(),
                        room = %room_name,
                        "access denied: not a member"
                    );
                    Some(WireError::new(code::ACCESS_DENIED, "access denied"))
                }
                Err(e) => {
                    tracing::error!(room = %room_name, error = %e, "failed to check membership");
                    Some(WireError::internal())
                }
            }
        }
        _ => Some(WireError::new(code::ACCESS_DENIED, "access denied")),
    }
}

async fn send_error(sink: &SharedSink, err: WireError) -> Result<(), CloseStatus> {
    send_outbound(sink, &Outbound::error(err)).await
}

async fn send_outbound(sink: &SharedSink, outbound: &Outbound) -> Result<(), CloseStatus> {
    let text = serde_json::to_string(outbound)
        .map_err(|e| CloseStatus::internal(format!("encode outbound: {e}")))?;
    sink.lock()
        .await
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| CloseStatus::internal(format!("write frame: {e}")))
}

async fn write_loop(
    sink: SharedSink,
    mut events_rx: mpsc::Receiver<Event>,
    session: Arc<Session>,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    // A zero interval disables pings; park the ticker far in the future.
    let period = if ping_interval.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        ping_interval
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = session.closed().cancelled() => return,
            event = events_rx.recv() => {
                let Some(event) = event else { return };
                let outbound = outbound_from_event(&event);
                let text = match serde_json::to_string(&outbound) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(session_id = %session.id, error = %e, "encode event");
                        continue;
                    }
                };
                if sink.lock().await.send(Message::Text(text.into())).await.is_err() {
                    tracing::debug!(session_id = %session.id, "write failed, closing");
                    cancel.cancel();
                    return;
                }
            }
            _ = ticker.tick() => {
                if sink.lock().await.send(Message::Ping(Vec::new().into())).await.is_err() {
                    tracing::debug!(session_id = %session.id, "ping failed, closing");
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Sort transport errors into expected closes (peer vanished) and real
/// failures that should carry a close status.
fn classify_transport_error(e: &axum::Error) -> Option<CloseStatus> {
    let reason = e.to_string();
    if reason.contains("without closing handshake") || reason.contains("Connection reset") {
        return None;
    }
    if reason.contains("Message too long") {
        return Some(CloseStatus {
            status: CLOSE_MESSAGE_TOO_BIG,
            reason: "message too big".to_string(),
        });
    }
    Some(CloseStatus::internal(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{build_router, AppState};
    use crate::auth::{AuthService, JwtConfig};
    use crate::calls::CallService;
    use crate::config::ServerConfig;
    use crate::friends::FriendService;
    use crate::hub::Hub;
    use crate::rate_limit::RateLimiter;
    use futures_util::stream::SplitStream as ClientSplitStream;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use wirechat_store::Database;

    struct TestServer {
        addr: SocketAddr,
        db: Arc<Database>,
        auth: Arc<AuthService>,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn start_server(config: ServerConfig) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        db.create_room("general", RoomType::Public, None).unwrap();

        let jwt = JwtConfig {
            secret: config.jwt_secret.clone(),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            ttl: chrono::Duration::hours(24),
        };
        let auth = Arc::new(AuthService::new(db.clone(), jwt));
        let friends = Arc::new(FriendService::new(db.clone()));
        let calls = Arc::new(CallService::new(db.clone(), None, friends.clone()));

        let cancel = CancellationToken::new();
        let (hub, hub_handle) = Hub::new(Some(db.clone()), None);
        tokio::spawn(hub.run(cancel.clone()));

        let state = AppState {
            db: db.clone(),
            auth: auth.clone(),
            friends,
            calls,
            hub: hub_handle,
            config: Arc::new(config),
            rate_limiter: RateLimiter::default(),
            shutdown: cancel.clone(),
        };

        let router = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        TestServer {
            addr,
            db,
            auth,
            cancel,
            _dir: dir,
        }
    }

    type ClientSink = futures_util::stream::SplitSink<
        WebSocketStream<MaybeTlsStream<TcpStream>>,
        ClientMessage,
    >;
    type ClientStream = ClientSplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

    async fn connect_ws(addr: SocketAddr) -> (ClientSink, ClientStream) {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("ws dial");
        ws.split()
    }

    async fn send_frame(sink: &mut ClientSink, kind: &str, data: Value) {
        let frame = json!({"type": kind, "data": data}).to_string();
        sink.send(ClientMessage::Text(frame)).await.expect("send frame");
    }

    /// Read frames until one matches, skipping keepalive traffic, like the
    /// reference smoke clients do.
    async fn await_frame<T>(
        stream: &mut ClientStream,
        mut pick: impl FnMut(&Value) -> Option<T>,
    ) -> T {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let message = tokio::time::timeout_at(deadline, stream.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .expect("read frame");
            let ClientMessage::Text(text) = message else {
                continue;
            };
            let value: Value = serde_json::from_str(&text).expect("frame is json");
            if let Some(found) = pick(&value) {
                return found;
            }
        }
    }

    async fn await_event(stream: &mut ClientStream, event: &str) -> Value {
        let tag = event.to_string();
        await_frame(stream, move |frame| {
            (frame["type"] == "event" && frame["event"] == tag.as_str())
                .then(|| frame["data"].clone())
        })
        .await
    }

    async fn await_error(stream: &mut ClientStream, expected_code: &str) {
        let expected = expected_code.to_string();
        await_frame(stream, move |frame| {
            (frame["type"] == "error" && frame["error"]["code"] == expected.as_str()).then_some(())
        })
        .await;
    }

    #[tokio::test]
    async fn hello_join_and_broadcast() {
        let server = start_server(ServerConfig::default()).await;

        let (mut a_tx, mut a_rx) = connect_ws(server.addr).await;
        let (mut b_tx, mut b_rx) = connect_ws(server.addr).await;

        send_frame(&mut a_tx, "hello", json!({"user": "alice", "protocol": 1})).await;
        send_frame(&mut a_tx, "join", json!({"room": "general"})).await;
        send_frame(&mut b_tx, "hello", json!({"user": "bob", "protocol": 1})).await;
        send_frame(&mut b_tx, "join", json!({"room": "general"})).await;

        let joined = await_frame(&mut b_rx, |frame| {
            (frame["event"] == "user_joined" && frame["data"]["user"] == "bob")
                .then(|| frame["data"].clone())
        })
        .await;
        assert_eq!(joined["room"], "general");

        send_frame(&mut a_tx, "msg", json!({"room": "general", "text": "hi"})).await;

        let message = await_event(&mut b_rx, "message").await;
        assert_eq!(message["room"], "general");
        assert_eq!(message["user"], "alice");
        assert_eq!(message["text"], "hi");
        assert!(message["ts"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn unsupported_protocol_version_keeps_session_open() {
        let server = start_server(ServerConfig::default()).await;
        let (mut tx, mut rx) = connect_ws(server.addr).await;

        send_frame(&mut tx, "hello", json!({"user": "alice", "protocol": 999})).await;
        await_error(&mut rx, code::UNSUPPORTED_VERSION).await;

        // Retry with the supported version on the same connection.
        send_frame(&mut tx, "hello", json!({"user": "alice", "protocol": 1})).await;
        send_frame(&mut tx, "join", json!({"room": "general"})).await;
        let joined = await_event(&mut rx, "user_joined").await;
        assert_eq!(joined["user"], "alice");
    }

    #[tokio::test]
    async fn msg_rate_limit_drops_excess() {
        let mut config = ServerConfig::default();
        config.rate_limit_msg_per_min = 1;
        let server = start_server(config).await;

        let (mut tx, mut rx) = connect_ws(server.addr).await;
        send_frame(&mut tx, "hello", json!({"user": "alice"})).await;
        send_frame(&mut tx, "join", json!({"room": "general"})).await;
        await_event(&mut rx, "user_joined").await;

        send_frame(&mut tx, "msg", json!({"room": "general", "text": "one"})).await;
        let first = await_event(&mut rx, "message").await;
        assert_eq!(first["text"], "one");

        send_frame(&mut tx, "msg", json!({"room": "general", "text": "two"})).await;
        await_error(&mut rx, code::RATE_LIMITED).await;
    }

    #[tokio::test]
    async fn private_room_requires_membership() {
        let server = start_server(ServerConfig::default()).await;
        server
            .db
            .create_room("secret", RoomType::Private, None)
            .unwrap();

        let (mut tx, mut rx) = connect_ws(server.addr).await;
        send_frame(&mut tx, "hello", json!({"user": "stranger"})).await;

        send_frame(&mut tx, "join", json!({"room": "secret"})).await;
        await_error(&mut rx, code::ACCESS_DENIED).await;

        send_frame(&mut tx, "join", json!({"room": "nowhere"})).await;
        await_error(&mut rx, code::ROOM_NOT_FOUND).await;
    }

    #[tokio::test]
    async fn jwt_required_gates_commands_until_valid_hello() {
        let mut config = ServerConfig::default();
        config.jwt_required = true;
        let server = start_server(config).await;

        let token = server.auth.register("alice", "secret1").unwrap();

        let (mut tx, mut rx) = connect_ws(server.addr).await;

        // Commands before a valid hello are gated.
        send_frame(&mut tx, "join", json!({"room": "general"})).await;
        await_error(&mut rx, code::UNAUTHORIZED).await;

        // Tokenless hello is rejected when JWT is required.
        send_frame(&mut tx, "hello", json!({"user": "alice"})).await;
        await_error(&mut rx, code::UNAUTHORIZED).await;

        send_frame(&mut tx, "hello", json!({"token": token})).await;
        send_frame(&mut tx, "join", json!({"room": "general"})).await;
        let joined = await_event(&mut rx, "user_joined").await;
        assert_eq!(joined["user"], "alice");
    }

    #[tokio::test]
    async fn unknown_type_round_trips_error_without_disconnect() {
        let server = start_server(ServerConfig::default()).await;
        let (mut tx, mut rx) = connect_ws(server.addr).await;

        send_frame(&mut tx, "hello", json!({"user": "alice"})).await;
        send_frame(&mut tx, "dance", json!({})).await;
        await_error(&mut rx, code::INVALID_MESSAGE).await;

        // Session still works afterwards.
        send_frame(&mut tx, "join", json!({"room": "general"})).await;
        await_event(&mut rx, "user_joined").await;
    }

    #[tokio::test]
    async fn oversized_frame_closes_the_connection() {
        let mut config = ServerConfig::default();
        config.max_message_bytes = 256;
        let server = start_server(config).await;

        let (mut tx, mut rx) = connect_ws(server.addr).await;
        send_frame(&mut tx, "hello", json!({"user": "alice"})).await;

        let big = "x".repeat(512);
        send_frame(&mut tx, "msg", json!({"room": "general", "text": big})).await;

        // The server must terminate the session; the client observes either
        // a close frame or a dropped connection.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match tokio::time::timeout_at(deadline, rx.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(ClientMessage::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    }
}
