//! REST surface: account endpoints, room/member/history administration,
//! friends, and call management. The WebSocket endpoint is mounted on the
//! same router.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use wirechat_store::{direct_key, Database, Room, RoomType};

use crate::auth::{AuthError, AuthService};
use crate::calls::{CallError, CallService};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::friends::{FriendError, FriendService};
use crate::hub::HubHandle;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub auth: Arc<AuthService>,
    pub friends: Arc<FriendService>,
    pub calls: Arc<CallService>,
    pub hub: HubHandle,
    pub config: Arc<ServerConfig>,
    pub rate_limiter: RateLimiter,
    pub shutdown: CancellationToken,
}

/// The authenticated caller, injected by [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
    pub is_guest: bool,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let authed = Router::new()
        .route("/api/rooms", post(create_room).get(list_rooms))
        .route("/api/rooms/direct", post(create_direct_room))
        .route("/api/rooms/{id}/join", post(join_room))
        .route("/api/rooms/{id}/leave", delete(leave_room))
        .route("/api/rooms/{id}/members", post(add_member))
        .route("/api/rooms/{id}/members/{user_id}", delete(remove_member))
        .route("/api/rooms/{id}/messages", get(room_history))
        .route("/api/users/search", get(search_users))
        .route("/api/friends", get(list_friends))
        .route("/api/friends/pending", get(list_pending_friends))
        .route("/api/friends/requests", post(send_friend_request))
        .route("/api/friends/accept", post(accept_friend_request))
        .route("/api/friends/reject", post(reject_friend_request))
        .route("/api/friends/block", post(block_user))
        .route("/api/friends/unblock", post(unblock_user))
        .route("/api/calls/direct", post(create_direct_call))
        .route("/api/calls/room", post(create_room_call))
        .route("/api/calls/active", get(list_active_calls))
        .route("/api/calls/{id}", get(get_call))
        .route("/api/calls/{id}/join", get(call_join_info))
        .route("/api/calls/{id}/end", put(end_call))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/guest", post(guest_login))
        .route("/ws", get(crate::ws::ws_handler))
        .merge(authed)
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "starting http server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

/// Validate the bearer token and expose the caller as [`AuthUser`].
async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return Err(ServerError::unauthorized("missing authorization header"));
    };

    let claims = state
        .auth
        .validate(token)
        .map_err(|_| ServerError::unauthorized("invalid token"))?;

    req.extensions_mut().insert(AuthUser {
        user_id: claims.user_id,
        username: claims.username,
        is_guest: claims.is_guest,
    });

    Ok(next.run(req).await)
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct AuthResponse {
    token: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let token = state
        .auth
        .register(&req.username, &req.password)
        .map_err(auth_error)?;

    info!(username = %req.username, "user registered");
    Ok((StatusCode::CREATED, Json(AuthResponse { token })))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ServerError> {
    let token = state
        .auth
        .login(&req.username, &req.password)
        .map_err(auth_error)?;

    info!(username = %req.username, "user logged in");
    Ok(Json(AuthResponse { token }))
}

async fn guest_login(State(state): State<AppState>) -> Result<Response, ServerError> {
    let (token, session_id) = state
        .auth
        .guest_login()
        .map_err(|e| ServerError::Internal(e.into()))?;

    info!(session_id = %session_id, "guest user created");

    let cookie = format!("guest_session={session_id}; Max-Age=604800; Path=/; HttpOnly");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(AuthResponse { token }),
    )
        .into_response())
}

fn auth_error(err: AuthError) -> ServerError {
    match err {
        AuthError::UserExists => ServerError::Conflict("user already exists".to_string()),
        AuthError::InvalidUsername | AuthError::InvalidPassword => {
            ServerError::BadRequest(err.to_string())
        }
        AuthError::InvalidCredentials => ServerError::Unauthorized("invalid credentials".to_string()),
        other => ServerError::Internal(other.into()),
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateRoomRequest {
    name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct DirectRoomRequest {
    user_id: i64,
}

#[derive(Serialize)]
struct RoomResponse {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner_id: Option<i64>,
    created_at: String,
}

impl RoomResponse {
    fn from_room(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            kind: room.kind.as_str(),
            owner_id: room.owner_id,
            created_at: room.created_at.to_rfc3339(),
        }
    }
}

async fn create_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > 64 {
        return Err(ServerError::bad_request("room name must be 1-64 characters"));
    }

    let kind = match req.kind.as_deref() {
        None | Some("public") => RoomType::Public,
        Some("private") => RoomType::Private,
        Some(_) => {
            return Err(ServerError::bad_request(
                "invalid room type, must be 'public' or 'private'",
            ));
        }
    };

    let room = match state.db.create_room(name, kind, Some(user.user_id)) {
        Ok(room) => room,
        Err(e) if e.is_unique_violation() => {
            return Err(ServerError::Conflict(
                "room with this name already exists".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    // Private rooms are reachable only through membership, so the creator
    // joins immediately.
    if kind == RoomType::Private {
        if let Err(e) = state.db.add_member(user.user_id, room.id) {
            tracing::error!(room_id = room.id, user_id = user.user_id, error = %e, "failed to add creator membership");
        }
    }

    info!(
        room_id = room.id,
        room_name = %room.name,
        owner_id = user.user_id,
        kind = kind.as_str(),
        "room created"
    );
    Ok((StatusCode::CREATED, Json(RoomResponse::from_room(&room))))
}

async fn list_rooms(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<RoomResponse>>, ServerError> {
    let rooms = state.db.list_rooms(user.user_id)?;
    Ok(Json(rooms.iter().map(RoomResponse::from_room).collect()))
}

/// Create (or return) the direct room between the caller and another user.
/// Both orderings of the pair converge on the same row.
async fn create_direct_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<DirectRoomRequest>,
) -> Result<Json<RoomResponse>, ServerError> {
    if req.user_id == user.user_id {
        return Err(ServerError::bad_request("cannot open a direct room with yourself"));
    }
    state
        .db
        .get_user_by_id(req.user_id)
        .map_err(|_| ServerError::not_found("user not found"))?;

    let key = direct_key(user.user_id, req.user_id);
    let room = state.db.create_direct_room(&key, user.user_id, req.user_id)?;

    Ok(Json(RoomResponse::from_room(&room)))
}

async fn join_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let room = state
        .db
        .get_room_by_id(room_id)
        .map_err(|_| ServerError::not_found("room not found"))?;

    if room.kind != RoomType::Public {
        return Err(ServerError::Forbidden(
            "only public rooms can be joined directly".to_string(),
        ));
    }

    state.db.add_member(user.user_id, room_id)?;
    info!(room_id, user_id = user.user_id, "user joined room");
    Ok(Json(serde_json::json!({ "message": "joined room successfully" })))
}

async fn leave_room(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.db.remove_member(user.user_id, room_id)?;
    info!(room_id, user_id = user.user_id, "user left room");
    Ok(Json(serde_json::json!({ "message": "left room successfully" })))
}

#[derive(Deserialize)]
struct MemberRequest {
    user_id: i64,
}

fn require_owner(room: &Room, user: &AuthUser) -> Result<(), ServerError> {
    if room.owner_id != Some(user.user_id) {
        return Err(ServerError::Forbidden(
            "only the room owner can manage members".to_string(),
        ));
    }
    Ok(())
}

async fn add_member(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<i64>,
    Json(req): Json<MemberRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let room = state
        .db
        .get_room_by_id(room_id)
        .map_err(|_| ServerError::not_found("room not found"))?;
    require_owner(&room, &user)?;

    state.db.add_member(req.user_id, room_id)?;
    info!(room_id, user_id = req.user_id, added_by = user.user_id, "member added");
    Ok(Json(serde_json::json!({ "message": "member added successfully" })))
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((room_id, target_user)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let room = state
        .db
        .get_room_by_id(room_id)
        .map_err(|_| ServerError::not_found("room not found"))?;
    require_owner(&room, &user)?;

    state.db.remove_member(target_user, room_id)?;
    info!(room_id, user_id = target_user, removed_by = user.user_id, "member removed");
    Ok(Json(serde_json::json!({ "message": "member removed successfully" })))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Serialize)]
struct MessageResponse {
    id: i64,
    room_id: i64,
    user_id: i64,
    body: String,
    created_at: String,
}

async fn room_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(room_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageResponse>>, ServerError> {
    let room = state
        .db
        .get_room_by_id(room_id)
        .map_err(|_| ServerError::not_found("room not found"))?;

    if room.kind != RoomType::Public && !state.db.is_member(user.user_id, room.id)? {
        return Err(ServerError::Forbidden("access denied".to_string()));
    }

    let limit = query.limit.unwrap_or(50).min(200);
    let messages = state.db.list_messages(room.id, limit, query.before)?;

    Ok(Json(
        messages
            .into_iter()
            .map(|m| MessageResponse {
                id: m.id,
                room_id: m.room_id,
                user_id: m.user_id,
                body: m.body,
                created_at: m.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

#[derive(Serialize)]
struct UserResponse {
    id: i64,
    username: String,
}

async fn search_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserResponse>>, ServerError> {
    let needle = query.q.trim();
    if needle.len() < 3 {
        return Err(ServerError::bad_request(
            "search query must be at least 3 characters",
        ));
    }

    let users = state.db.search_users(needle)?;
    Ok(Json(
        users
            .into_iter()
            .filter(|u| u.id != user.user_id)
            .map(|u| UserResponse {
                id: u.id,
                username: u.username,
            })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Friends
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FriendRequest {
    user_id: i64,
}

#[derive(Serialize)]
struct FriendshipResponse {
    user_id: i64,
    friend_id: i64,
    status: &'static str,
    created_at: String,
}

fn friend_error(err: FriendError) -> ServerError {
    match err {
        FriendError::CannotFriendSelf | FriendError::NotBlocked => {
            ServerError::BadRequest(err.to_string())
        }
        FriendError::AlreadyFriends | FriendError::RequestAlreadyExists => {
            ServerError::Conflict(err.to_string())
        }
        FriendError::RequestNotFound | FriendError::UserNotFound => {
            ServerError::NotFound(err.to_string())
        }
        FriendError::BlockedByTarget | FriendError::TargetBlocked => {
            ServerError::Forbidden(err.to_string())
        }
        FriendError::Store(e) => e.into(),
    }
}

async fn send_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FriendRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let friendship = state
        .friends
        .send_request(user.user_id, req.user_id)
        .map_err(friend_error)?;

    info!(from = user.user_id, to = req.user_id, "friend request sent");
    Ok((
        StatusCode::CREATED,
        Json(FriendshipResponse {
            user_id: friendship.user_id,
            friend_id: friendship.friend_id,
            status: friendship.status.as_str(),
            created_at: friendship.created_at.to_rfc3339(),
        }),
    ))
}

async fn accept_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FriendRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .friends
        .accept_request(user.user_id, req.user_id)
        .map_err(friend_error)?;
    Ok(Json(serde_json::json!({ "message": "friend request accepted" })))
}

async fn reject_friend_request(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FriendRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .friends
        .reject_request(user.user_id, req.user_id)
        .map_err(friend_error)?;
    Ok(Json(serde_json::json!({ "message": "friend request rejected" })))
}

async fn block_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FriendRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .friends
        .block_user(user.user_id, req.user_id)
        .map_err(friend_error)?;
    Ok(Json(serde_json::json!({ "message": "user blocked" })))
}

async fn unblock_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<FriendRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .friends
        .unblock_user(user.user_id, req.user_id)
        .map_err(friend_error)?;
    Ok(Json(serde_json::json!({ "message": "user unblocked" })))
}

async fn list_friends(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<FriendshipResponse>>, ServerError> {
    let friends = state.friends.list_friends(user.user_id).map_err(friend_error)?;
    Ok(Json(
        friends
            .into_iter()
            .map(|f| FriendshipResponse {
                user_id: f.user_id,
                friend_id: f.friend_id,
                status: f.status.as_str(),
                created_at: f.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}

async fn list_pending_friends(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<FriendshipResponse>>, ServerError> {
    let pending = state.friends.list_pending(user.user_id).map_err(friend_error)?;
    Ok(Json(
        pending
            .into_iter()
            .map(|f| FriendshipResponse {
                user_id: f.user_id,
                friend_id: f.friend_id,
                status: f.status.as_str(),
                created_at: f.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DirectCallRequest {
    to_user_id: i64,
}

#[derive(Deserialize)]
struct RoomCallRequest {
    room_id: i64,
}

fn call_error(err: CallError) -> ServerError {
    match err {
        CallError::CannotCallSelf => ServerError::BadRequest(err.to_string()),
        CallError::UserNotFound | CallError::RoomNotFound | CallError::CallNotFound => {
            ServerError::NotFound(err.to_string())
        }
        CallError::CallsNotAllowed | CallError::NotRoomMember | CallError::NotParticipant => {
            ServerError::Forbidden(err.to_string())
        }
        CallError::CallEnded => ServerError::Gone(err.to_string()),
        CallError::EngineDisabled => ServerError::Unavailable(err.to_string()),
        other => ServerError::Internal(other.into()),
    }
}

async fn create_direct_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<DirectCallRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let call = state
        .calls
        .create_direct_call(user.user_id, req.to_user_id)
        .map_err(call_error)?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn create_room_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<RoomCallRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let call = state
        .calls
        .create_room_call(user.user_id, req.room_id)
        .map_err(call_error)?;
    Ok((StatusCode::CREATED, Json(call)))
}

async fn list_active_calls(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<wirechat_store::Call>>, ServerError> {
    let calls = state
        .calls
        .list_active_calls(user.user_id)
        .map_err(call_error)?;
    Ok(Json(calls))
}

async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Result<Json<wirechat_store::Call>, ServerError> {
    let call = state.calls.get_call(&call_id).map_err(call_error)?;
    Ok(Json(call))
}

async fn call_join_info(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(call_id): Path<String>,
) -> Result<Json<crate::engine::JoinInfo>, ServerError> {
    let info = state
        .calls
        .join_info(&call_id, user.user_id)
        .map_err(call_error)?;
    Ok(Json(info))
}

async fn end_call(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state
        .calls
        .end_call(&call_id, user.user_id)
        .map_err(call_error)?;

    info!(call_id = %call_id, user_id = user.user_id, "call ended");
    Ok(Json(serde_json::json!({ "message": "call ended" })))
}
