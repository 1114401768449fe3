//! A live WebSocket session as seen by the hub.
//!
//! The session owns the sending halves of its bounded command inbox and
//! event outbox; the hub's forwarder drains the inbox and the connection's
//! writer loop drains the outbox. Identity is written by the reader loop
//! during handshake only, before the session takes part in any broadcast,
//! and `joined_rooms` is touched exclusively by the hub loop.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

use rand::RngCore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{Command, Event};

/// Per-session queue depths. Small on purpose: a slow consumer sheds
/// broadcasts instead of growing server memory.
pub const INBOX_CAPACITY: usize = 8;
pub const OUTBOX_CAPACITY: usize = 8;

/// Who this session speaks for. `user_id == 0` means not authenticated (or
/// guest).
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub is_guest: bool,
}

pub struct Session {
    pub id: String,
    identity: RwLock<Identity>,
    joined_rooms: Mutex<HashSet<String>>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<Event>,
    closed: CancellationToken,
}

impl Session {
    /// Build a session plus the receiving halves of its two queues: the
    /// command inbox (handed to the hub at registration) and the event
    /// outbox (kept by the connection's writer loop).
    pub fn new(
        id: String,
        identity: Identity,
    ) -> (
        std::sync::Arc<Self>,
        mpsc::Receiver<Command>,
        mpsc::Receiver<Event>,
    ) {
        let (commands_tx, commands_rx) = mpsc::channel(INBOX_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(OUTBOX_CAPACITY);

        let session = std::sync::Arc::new(Self {
            id,
            identity: RwLock::new(identity),
            joined_rooms: Mutex::new(HashSet::new()),
            commands: commands_tx,
            events: events_tx,
            closed: CancellationToken::new(),
        });

        (session, commands_rx, events_rx)
    }

    pub fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Overwrite identity after a successful handshake. Repeated `hello`
    /// frames overwrite again, last writer wins.
    pub fn set_identity(&self, identity: Identity) {
        *self
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = identity;
    }

    pub fn user_id(&self) -> i64 {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user_id
    }

    pub fn username(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .username
            .clone()
    }

    pub fn is_guest(&self) -> bool {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_guest
    }

    /// Room names this session currently occupies.
    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms().iter().cloned().collect()
    }

    pub(crate) fn rooms(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.joined_rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an event for delivery, dropping it if the outbox is full or the
    /// session is gone. Returns whether the event was queued.
    pub(crate) fn try_send_event(&self, event: Event) -> bool {
        self.events.try_send(event).is_ok()
    }

    /// Queue a command from the reader loop. Blocks when the inbox is full,
    /// which backpressures the reader within its read deadline. Returns
    /// false once the hub side is gone.
    pub async fn push_command(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }

    /// Fires when the hub has released this session; writer loops select on
    /// it in place of a closed outbox.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Opaque session id: 12 random bytes, hex encoded.
pub fn new_session_id() -> String {
    let mut buf = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
