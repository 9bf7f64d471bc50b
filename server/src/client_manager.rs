//! Per-connection session state and the registry that owns every session
//!
//! This module tracks everything the relay knows about one socket:
//! - Role (viewer, engine driver, telemetry client) and the authenticated identity
//! - The lobby the session is subscribed to and whether it wants the global feed
//! - The outbound channel used to push frames to the socket writer
//! - The in-flight replay listing, which must be cancelled on teardown
//!
//! Sessions are owned by the [`ClientRegistry`], keyed by session id, and only the
//! router mutates it.

use log::{info, warn};
use serde::Serialize;
use shared::{AuthenticatedUser, Capability, Event, ServerPacket};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A frame queued for the socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Cloneable push handle for one session's socket.
///
/// Background tasks (login, replay listing) hold a clone so they can answer the
/// client without going back through the router.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { sender }
    }

    /// Creates an outbox together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Returns false once the socket writer has gone away.
    pub fn push(&self, frame: Outbound) -> bool {
        self.sender.send(frame).is_ok()
    }

    pub fn send_event(&self, event: &Event) -> bool {
        self.send_json(event)
    }

    pub fn send_packet(&self, packet: &ServerPacket) -> bool {
        self.send_json(packet)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.push(Outbound::Binary(bytes))
    }

    fn send_json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.push(Outbound::Text(text)),
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// One viewer, telemetry or engine-driver connection.
#[derive(Debug)]
pub struct ClientSession {
    /// Server-assigned session id, also sent to the client on connect
    pub id: Uuid,
    /// Remote address, if the session came from a socket
    pub addr: Option<SocketAddr>,
    /// Identity committed by a successful login; never reverts
    identity: Option<AuthenticatedUser>,
    pub is_engine_driver: bool,
    pub is_telemetry_client: bool,
    pub subscribed_lobby_id: Option<String>,
    /// Whether the session receives the global broadcast feed
    pub wants_broadcast_feed: bool,
    replay_listing: Option<CancellationToken>,
    outbox: Outbox,
}

impl ClientSession {
    pub fn new(id: Uuid, addr: Option<SocketAddr>, outbox: Outbox) -> Self {
        Self {
            id,
            addr,
            identity: None,
            is_engine_driver: false,
            is_telemetry_client: false,
            subscribed_lobby_id: None,
            wants_broadcast_feed: true,
            replay_listing: None,
            outbox,
        }
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Alive while the socket writer still accepts frames.
    pub fn is_alive(&self) -> bool {
        !self.outbox.is_closed()
    }

    pub fn identity(&self) -> Option<&AuthenticatedUser> {
        self.identity.as_ref()
    }

    /// Commits an identity. Returns false if one was already established.
    pub fn set_identity(&mut self, user: AuthenticatedUser) -> bool {
        if let Some(existing) = &self.identity {
            warn!(
                "Session {} already logged in as {}, ignoring login as {}",
                self.id, existing.id, user.id
            );
            return false;
        }
        info!("User {} ({}) logged in on session {}", user.username, user.id, self.id);
        self.identity = Some(user);
        true
    }

    pub fn has_any(&self, capabilities: &[Capability]) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|user| user.has_any(capabilities))
    }

    pub fn send_event(&self, event: &Event) -> bool {
        self.outbox.send_event(event)
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.outbox.send_bytes(bytes)
    }

    /// Tracks a new replay listing, cancelling the previous one.
    pub fn start_replay_listing(&mut self, token: CancellationToken) {
        if let Some(previous) = self.replay_listing.replace(token) {
            previous.cancel();
        }
    }

    pub fn cancel_replay_listing(&mut self) -> bool {
        match self.replay_listing.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Releases everything the session holds outside the router.
    pub fn teardown(&mut self) {
        self.cancel_replay_listing();
        self.outbox.push(Outbound::Close);
    }
}

impl fmt::Display for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(user) => write!(f, "{} ({})", user.username, user.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Owns every live session, keyed by session id.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<Uuid, ClientSession>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, session: ClientSession) {
        info!(
            "Client {} connected{}",
            session.id,
            session
                .addr
                .map(|addr| format!(" from {}", addr))
                .unwrap_or_default()
        );
        self.clients.insert(session.id, session);
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<ClientSession> {
        let removed = self.clients.remove(id);
        if let Some(session) = &removed {
            info!("Client {} disconnected", session);
        }
        removed
    }

    pub fn get(&self, id: &Uuid) -> Option<&ClientSession> {
        self.clients.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut ClientSession> {
        self.clients.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.clients.values_mut()
    }

    /// Sessions registered as the engine driver.
    pub fn drivers(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values().filter(|c| c.is_engine_driver)
    }

    /// Sessions that receive the global broadcast feed.
    pub fn feed_subscribers(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values().filter(|c| c.wants_broadcast_feed)
    }

    /// Ids of sessions whose socket has gone away.
    pub fn dead_sessions(&self) -> Vec<Uuid> {
        self.clients
            .values()
            .filter(|c| !c.is_alive())
            .map(|c| c.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
