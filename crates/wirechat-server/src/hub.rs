//! The hub: a single-writer event loop that owns every live session, every
//! in-memory room, and the `user_id -> session` index.
//!
//! All mutations funnel through three bounded channels (`register`,
//! `unregister`, and the shared `command` channel fed by per-session
//! forwarder tasks) and are applied one at a time, so the maps need no
//! locks. Event delivery on the broadcast path is lossy: a full outbox
//! drops the event for that recipient rather than stalling the loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wirechat_proto::envelope::{
    CallEndedEvent, CallIncomingEvent, CallJoinInfoEvent, CallPeerEvent, CallRejectedEvent,
    CallRingingEvent,
};
use wirechat_proto::{code, WireError};
use wirechat_store::Database;

use crate::calls::CallService;
use crate::engine::JoinInfo;
use crate::session::Session;

const REGISTER_CAPACITY: usize = 16;
const UNREGISTER_CAPACITY: usize = 16;
const COMMAND_CAPACITY: usize = 64;

/// Messages unicast to a joiner carry at most this much history.
const HISTORY_LIMIT: u32 = 50;

/// A chat message as it flows through the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Persisted message id; 0 for ephemeral (guest or unpersisted) messages.
    pub id: i64,
    pub room: String,
    pub from: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Target of a `call.invite`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Direct { to_user_id: i64 },
    Room { room_id: i64 },
}

/// An action requested by a session, processed serially by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    SendMessage { room: String, message: ChatMessage },
    CallInvite { target: CallTarget },
    CallAccept { call_id: String },
    CallReject { call_id: String, reason: String },
    CallJoin { call_id: String },
    CallLeave { call_id: String },
    CallEnd { call_id: String },
}

/// A notification emitted by the hub onto a session's outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message { message: ChatMessage },
    UserJoined { room: String, user: String },
    UserLeft { room: String, user: String },
    History { room: String, messages: Vec<ChatMessage> },
    CallIncoming(CallIncomingEvent),
    CallRinging(CallRingingEvent),
    CallAccepted(CallPeerEvent),
    CallRejected(CallRejectedEvent),
    CallJoinInfo(CallJoinInfoEvent),
    CallParticipantJoined(CallPeerEvent),
    CallParticipantLeft(CallPeerEvent),
    CallEnded(CallEndedEvent),
    Error(WireError),
}

/// Live membership of one presence channel. Exists only while non-empty.
struct Room {
    members: HashSet<String>,
}

enum Registration {
    /// First registration: hands the session's command inbox to the hub,
    /// which spawns a forwarder for it.
    Attach {
        session: Arc<Session>,
        inbox: mpsc::Receiver<Command>,
    },
    /// Re-announce after a successful handshake so the user index picks up
    /// the session's identity (last writer wins).
    Identify { session: Arc<Session> },
}

/// Cheap cloneable handle used by connection adapters and the REST layer.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<String>,
}

impl HubHandle {
    /// Register a freshly accepted session. Non-blocking; dropped silently
    /// if the hub is shutting down.
    pub fn register(&self, session: Arc<Session>, inbox: mpsc::Receiver<Command>) {
        let _ = self.register_tx.try_send(Registration::Attach { session, inbox });
    }

    /// Refresh the user index after a handshake changed the session's
    /// identity.
    pub fn identify(&self, session: Arc<Session>) {
        let _ = self.register_tx.try_send(Registration::Identify { session });
    }

    /// Release a session. Non-blocking and idempotent.
    pub fn unregister(&self, session_id: String) {
        let _ = self.unregister_tx.try_send(session_id);
    }
}

pub struct Hub {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<String>,
    command_rx: mpsc::Receiver<(Arc<Session>, Command)>,
    command_tx: mpsc::Sender<(Arc<Session>, Command)>,
    unregister_tx: mpsc::Sender<String>,

    sessions: HashMap<String, Arc<Session>>,
    rooms: HashMap<String, Room>,
    user_index: HashMap<i64, String>,

    db: Option<Arc<Database>>,
    calls: Option<Arc<CallService>>,
}

impl Hub {
    /// Build the hub. `db` enables message persistence and history; `calls`
    /// enables call signaling; without it every `call.*` command surfaces
    /// `calls_disabled`.
    pub fn new(db: Option<Arc<Database>>, calls: Option<Arc<CallService>>) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let handle = HubHandle {
            register_tx,
            unregister_tx: unregister_tx.clone(),
        };

        let hub = Self {
            register_rx,
            unregister_rx,
            command_rx,
            command_tx,
            unregister_tx,
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            user_index: HashMap::new(),
            db,
            calls,
        };

        (hub, handle)
    }

    /// Run until cancellation. Every selected message is processed to
    /// completion before the next is drawn.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!("hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown();
                    return;
                }
                Some(registration) = self.register_rx.recv() => {
                    self.handle_register(registration, &cancel);
                }
                Some(session_id) = self.unregister_rx.recv() => {
                    self.handle_unregister(&session_id);
                }
                Some((session, command)) = self.command_rx.recv() => {
                    self.handle_command(&session, command);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(sessions = self.sessions.len(), "hub shutting down");
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.rooms.clear();
        self.user_index.clear();
    }

    fn handle_register(&mut self, registration: Registration, cancel: &CancellationToken) {
        match registration {
            Registration::Attach { session, inbox } => {
                let user_id = session.user_id();
                if user_id > 0 {
                    self.user_index.insert(user_id, session.id.clone());
                }
                self.sessions.insert(session.id.clone(), session.clone());
                self.spawn_forwarder(session, inbox, cancel);
            }
            Registration::Identify { session } => {
                if !self.sessions.contains_key(&session.id) {
                    return;
                }
                let user_id = session.user_id();
                if user_id > 0 {
                    self.user_index.insert(user_id, session.id.clone());
                }
            }
        }
    }

    /// Forward the session's inbox onto the shared command channel, tagged
    /// with the session. Requests unregistration on exit, best-effort.
    fn spawn_forwarder(
        &self,
        session: Arc<Session>,
        mut inbox: mpsc::Receiver<Command>,
        cancel: &CancellationToken,
    ) {
        let command_tx = self.command_tx.clone();
        let unregister_tx = self.unregister_tx.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    command = inbox.recv() => match command {
                        Some(command) => {
                            if command_tx.send((session.clone(), command)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = unregister_tx.try_send(session.id.clone());
        });
    }

    fn handle_unregister(&mut self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };

        let username = session.username();
        let rooms: Vec<String> = session.rooms().drain().collect();
        for room_name in rooms {
            if let Some(room) = self.rooms.get_mut(&room_name) {
                room.members.remove(session_id);
                if room.members.is_empty() {
                    self.rooms.remove(&room_name);
                } else {
                    self.broadcast(&room_name, Event::UserLeft {
                        room: room_name.clone(),
                        user: username.clone(),
                    });
                }
            }
        }

        let user_id = session.user_id();
        if user_id > 0 && self.user_index.get(&user_id).map(String::as_str) == Some(session_id) {
            self.user_index.remove(&user_id);
        }

        session.close();
        tracing::debug!(session_id, "session unregistered");
    }

    fn handle_command(&mut self, session: &Arc<Session>, command: Command) {
        match command {
            Command::JoinRoom { room } => self.join_room(session, room),
            Command::LeaveRoom { room } => self.leave_room(session, &room),
            Command::SendMessage { room, message } => self.send_room_message(session, &room, message),
            Command::CallInvite { target } => self.call_invite(session, target),
            Command::CallAccept { call_id } => self.call_accept(session, &call_id),
            Command::CallReject { call_id, reason } => self.call_reject(session, &call_id, &reason),
            Command::CallJoin { call_id } => self.call_join(session, &call_id),
            Command::CallLeave { call_id } => self.call_leave(session, &call_id),
            Command::CallEnd { call_id } => self.call_end(session, &call_id),
        }
    }

    // -----------------------------------------------------------------
    // Rooms
    // -----------------------------------------------------------------

    fn join_room(&mut self, session: &Arc<Session>, room_name: String) {
        if session.rooms().contains(&room_name) {
            self.send_error(session, code::ALREADY_JOINED, "already joined");
            return;
        }

        let room = self
            .rooms
            .entry(room_name.clone())
            .or_insert_with(|| Room {
                members: HashSet::new(),
            });
        room.members.insert(session.id.clone());
        session.rooms().insert(room_name.clone());

        tracing::debug!(session_id = %session.id, room = %room_name, "joined room");

        self.broadcast(&room_name, Event::UserJoined {
            room: room_name.clone(),
            user: session.username(),
        });

        self.send_history(session, &room_name);
    }

    fn leave_room(&mut self, session: &Arc<Session>, room_name: &str) {
        let Some(room) = self.rooms.get_mut(room_name) else {
            self.send_error(session, code::ROOM_NOT_FOUND, "room not found");
            return;
        };

        if !room.members.remove(&session.id) {
            self.send_error(session, code::NOT_IN_ROOM, "not in room");
            return;
        }
        session.rooms().remove(room_name);

        if room.members.is_empty() {
            self.rooms.remove(room_name);
        } else {
            self.broadcast(room_name, Event::UserLeft {
                room: room_name.to_string(),
                user: session.username(),
            });
        }
    }

    fn send_room_message(&mut self, session: &Arc<Session>, room_name: &str, mut message: ChatMessage) {
        if !session.rooms().contains(room_name) {
            self.send_error(session, code::NOT_IN_ROOM, "not in room");
            return;
        }

        if message.from.is_empty() {
            message.from = session.username();
        }
        if message.created_at.timestamp() == 0 {
            message.created_at = Utc::now();
        }

        // Persist for registered users when a persisted room of that name
        // exists; failures degrade to a non-persisted broadcast (id = 0).
        if !session.is_guest() && session.user_id() > 0 {
            if let Some(db) = &self.db {
                match db.get_room_by_name(room_name) {
                    Ok(room) => {
                        let mut record = wirechat_store::Message {
                            id: 0,
                            room_id: room.id,
                            user_id: session.user_id(),
                            body: message.text.clone(),
                            created_at: message.created_at,
                        };
                        match db.save_message(&mut record) {
                            Ok(()) => message.id = record.id,
                            Err(e) => {
                                tracing::warn!(room = %room_name, error = %e, "failed to persist message");
                            }
                        }
                    }
                    Err(wirechat_store::StoreError::NotFound) => {}
                    Err(e) => {
                        tracing::warn!(room = %room_name, error = %e, "failed to resolve room for persistence");
                    }
                }
            }
        }

        self.broadcast(room_name, Event::Message { message });
    }

    /// Unicast recent history to a joiner, best-effort: persistence errors
    /// and unknown rooms are silent.
    fn send_history(&self, session: &Arc<Session>, room_name: &str) {
        let Some(db) = &self.db else { return };

        let room = match db.get_room_by_name(room_name) {
            Ok(room) => room,
            Err(_) => return,
        };
        let records = match db.list_messages(room.id, HISTORY_LIMIT, None) {
            Ok(records) => records,
            Err(e) => {
                tracing::debug!(room = %room_name, error = %e, "history unavailable");
                return;
            }
        };

        let mut usernames: HashMap<i64, String> = HashMap::new();
        let messages = records
            .into_iter()
            .map(|record| {
                let from = usernames
                    .entry(record.user_id)
                    .or_insert_with(|| {
                        db.get_user_by_id(record.user_id)
                            .map(|u| u.username)
                            .unwrap_or_else(|_| format!("user-{}", record.user_id))
                    })
                    .clone();
                ChatMessage {
                    id: record.id,
                    room: room_name.to_string(),
                    from,
                    text: record.body,
                    created_at: record.created_at,
                }
            })
            .collect();

        session.try_send_event(Event::History {
            room: room_name.to_string(),
            messages,
        });
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    /// Call commands require the signaling capability and a registered user.
    fn gate_calls(&self, session: &Arc<Session>) -> Option<Arc<CallService>> {
        let Some(calls) = &self.calls else {
            self.send_error(session, code::CALLS_DISABLED, "calls are not available");
            return None;
        };
        if session.is_guest() || session.user_id() <= 0 {
            self.send_error(session, code::UNAUTHORIZED, "calls require a registered user");
            return None;
        }
        Some(calls.clone())
    }

    fn call_invite(&mut self, session: &Arc<Session>, target: CallTarget) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();
        let username = session.username();

        match target {
            CallTarget::Direct { to_user_id } => {
                let call = match calls.create_direct_call(user_id, to_user_id) {
                    Ok(call) => call,
                    Err(e) => return self.send_error(session, e.wire_code(), e.to_string()),
                };

                session.try_send_event(Event::CallRinging(CallRingingEvent {
                    call_id: call.id.clone(),
                    call_type: "direct".to_string(),
                    to_user_id: Some(to_user_id),
                    room_id: None,
                }));

                let delivered = self.send_to_user(to_user_id, Event::CallIncoming(CallIncomingEvent {
                    call_id: call.id.clone(),
                    call_type: "direct".to_string(),
                    from_user_id: user_id,
                    from_user: username,
                    room_id: None,
                    room_name: None,
                }));
                if !delivered {
                    tracing::debug!(call_id = %call.id, to_user_id, "invite target not connected");
                }
            }
            CallTarget::Room { room_id } => {
                let call = match calls.create_room_call(user_id, room_id) {
                    Ok(call) => call,
                    Err(e) => return self.send_error(session, e.wire_code(), e.to_string()),
                };

                session.try_send_event(Event::CallRinging(CallRingingEvent {
                    call_id: call.id.clone(),
                    call_type: "room".to_string(),
                    to_user_id: None,
                    room_id: Some(room_id),
                }));

                let room_name = calls.room_name(room_id).ok();
                let members = calls.room_members(room_id).unwrap_or_default();
                for member in members {
                    if member == user_id {
                        continue;
                    }
                    self.send_to_user(member, Event::CallIncoming(CallIncomingEvent {
                        call_id: call.id.clone(),
                        call_type: "room".to_string(),
                        from_user_id: user_id,
                        from_user: username.clone(),
                        room_id: Some(room_id),
                        room_name: room_name.clone(),
                    }));
                }
            }
        }
    }

    fn call_accept(&mut self, session: &Arc<Session>, call_id: &str) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();

        let info = match calls.join_info(call_id, user_id) {
            Ok(info) => info,
            Err(e) => return self.send_error(session, e.wire_code(), e.to_string()),
        };
        session.try_send_event(Event::CallJoinInfo(join_info_event(call_id, info)));

        let Ok(call) = calls.get_call(call_id) else { return };
        if call.initiator_user_id == user_id {
            return;
        }

        self.send_to_user(call.initiator_user_id, Event::CallAccepted(CallPeerEvent {
            call_id: call_id.to_string(),
            user_id,
            user: session.username(),
        }));
        match calls.join_info(call_id, call.initiator_user_id) {
            Ok(info) => {
                self.send_to_user(
                    call.initiator_user_id,
                    Event::CallJoinInfo(join_info_event(call_id, info)),
                );
            }
            Err(e) => {
                tracing::debug!(call_id, error = %e, "initiator join info unavailable");
            }
        }
    }

    fn call_reject(&mut self, session: &Arc<Session>, call_id: &str, reason: &str) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();

        // Resolve the initiator before the record is stamped ended.
        let initiator = calls.get_call(call_id).map(|c| c.initiator_user_id);

        if let Err(e) = calls.reject_call(call_id, user_id, reason) {
            return self.send_error(session, e.wire_code(), e.to_string());
        }

        if let Ok(initiator) = initiator {
            if initiator != user_id {
                self.send_to_user(initiator, Event::CallRejected(CallRejectedEvent {
                    call_id: call_id.to_string(),
                    user_id,
                    reason: reason.to_string(),
                }));
                self.send_to_user(initiator, Event::CallEnded(CallEndedEvent {
                    call_id: call_id.to_string(),
                }));
            }
        }
    }

    fn call_join(&mut self, session: &Arc<Session>, call_id: &str) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();

        let info = match calls.join_info(call_id, user_id) {
            Ok(info) => info,
            Err(e) => return self.send_error(session, e.wire_code(), e.to_string()),
        };
        session.try_send_event(Event::CallJoinInfo(join_info_event(call_id, info)));

        self.notify_call_peers(&calls, call_id, user_id, |call_id, user_id, user| {
            Event::CallParticipantJoined(CallPeerEvent {
                call_id,
                user_id,
                user,
            })
        }, session.username());
    }

    fn call_leave(&mut self, session: &Arc<Session>, call_id: &str) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();

        if let Err(e) = calls.leave_call(call_id, user_id) {
            return self.send_error(session, e.wire_code(), e.to_string());
        }

        self.notify_call_peers(&calls, call_id, user_id, |call_id, user_id, user| {
            Event::CallParticipantLeft(CallPeerEvent {
                call_id,
                user_id,
                user,
            })
        }, session.username());

        // Leaving last ends the call; tell whoever is still reachable.
        if let Ok(call) = calls.get_call(call_id) {
            if call.status.is_over() {
                if let Ok(participants) = calls.participants(call_id) {
                    for p in participants {
                        if p.user_id == user_id {
                            session.try_send_event(Event::CallEnded(CallEndedEvent {
                                call_id: call_id.to_string(),
                            }));
                        } else {
                            self.send_to_user(p.user_id, Event::CallEnded(CallEndedEvent {
                                call_id: call_id.to_string(),
                            }));
                        }
                    }
                }
            }
        }
    }

    fn call_end(&mut self, session: &Arc<Session>, call_id: &str) {
        let Some(calls) = self.gate_calls(session) else { return };
        let user_id = session.user_id();

        if let Err(e) = calls.end_call(call_id, user_id) {
            return self.send_error(session, e.wire_code(), e.to_string());
        }

        if let Ok(participants) = calls.participants(call_id) {
            for p in participants {
                let event = Event::CallEnded(CallEndedEvent {
                    call_id: call_id.to_string(),
                });
                if p.user_id == user_id {
                    session.try_send_event(event);
                } else {
                    self.send_to_user(p.user_id, event);
                }
            }
        }
    }

    fn notify_call_peers(
        &self,
        calls: &Arc<CallService>,
        call_id: &str,
        except_user: i64,
        make_event: impl Fn(String, i64, String) -> Event,
        actor_name: String,
    ) {
        let Ok(participants) = calls.participants(call_id) else { return };
        for p in participants {
            if p.user_id == except_user || p.left_at.is_some() {
                continue;
            }
            self.send_to_user(
                p.user_id,
                make_event(call_id.to_string(), except_user, actor_name.clone()),
            );
        }
    }

    // -----------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------

    /// Queue an event for every member of a room, dropping per-recipient on
    /// full outboxes.
    fn broadcast(&self, room_name: &str, event: Event) {
        let Some(room) = self.rooms.get(room_name) else { return };
        for member_id in &room.members {
            if let Some(member) = self.sessions.get(member_id) {
                if !member.try_send_event(event.clone()) {
                    tracing::debug!(session_id = %member_id, room = %room_name, "dropping event for slow consumer");
                }
            }
        }
    }

    /// Targeted delivery via the user index. Returns false when the user is
    /// not connected or their outbox is full; the hub never retries.
    fn send_to_user(&self, user_id: i64, event: Event) -> bool {
        let Some(session_id) = self.user_index.get(&user_id) else {
            return false;
        };
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };
        session.try_send_event(event)
    }

    fn send_error(&self, session: &Arc<Session>, error_code: &str, msg: impl Into<String>) {
        session.try_send_event(Event::Error(WireError::new(error_code, msg)));
    }
}

fn join_info_event(call_id: &str, info: JoinInfo) -> CallJoinInfoEvent {
    CallJoinInfoEvent {
        call_id: call_id.to_string(),
        url: info.url,
        token: info.token,
        room_name: info.room_name,
        identity: info.identity,
    }
}
