//! Relay router: the single owner of every lobby and client session
//!
//! Socket tasks never touch session state. They post [`RouterMessage`]s into one
//! unbounded channel and the router applies them in arrival order, so no two handlers
//! for the same lobby or client ever run concurrently. Work that has to wait on an
//! external collaborator (token validation, replay listings, admin lookups) runs in a
//! spawned task that either answers the client directly through its [`Outbox`] or
//! posts the result back as another message.
//!
//! The router also owns the fixed-rate [`Router::network_tick`], which flushes the
//! global pool and drives every lobby's own update, and the heartbeat that pings
//! clients and prunes dead sessions.

use crate::bridge::CommandBridge;
use crate::client_manager::{ClientRegistry, ClientSession, Outbox};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::lobby::{LobbyContext, LobbyOutcome, LobbySession, LobbySummary};
use crate::permissions::authorize;
use crate::rpc::{DriverCall, LobbyCall, MemberReport, RawLobbyData, TelemetryPacket, ViewerCall};
use crate::services::{AuthService, Services, UserDirectory};
use crate::utils::{get_timestamp, unix_seconds};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use shared::{
    client_rpc, is_recording_event, AuthenticatedUser, Capability, Command, Event, ReplayFilter,
    ServerPacket, APPLICATION_CLASS, LOBBY_CLASS,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// First message a telemetry client sends instead of logging in.
pub const AUTOSUB: &str = "autosub";

/// Messages processed by the router loop
#[derive(Debug)]
pub enum RouterMessage {
    Connected {
        client_id: Uuid,
        addr: Option<SocketAddr>,
        outbox: Outbox,
    },
    Frame {
        client_id: Uuid,
        text: String,
    },
    Disconnected {
        client_id: Uuid,
    },
    /// A login task validated a token and the identity can be committed.
    IdentityResolved {
        client_id: Uuid,
        user: AuthenticatedUser,
    },
    SetReplayId {
        lobby_id: String,
        replay_id: String,
    },
    Query(Query),
    Shutdown,
}

/// Read-only questions answered from router state.
#[derive(Debug)]
pub enum Query {
    Lobbies(oneshot::Sender<Vec<LobbySummary>>),
    LobbyResync {
        lobby_id: String,
        reply: oneshot::Sender<Vec<Event>>,
    },
    Members(oneshot::Sender<Vec<MemberReport>>),
    RawLobbies(oneshot::Sender<RawLobbyLists>),
    Stats(oneshot::Sender<RouterStats>),
}

/// Lobby-browser rows last reported by the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLobbyLists {
    pub private: Vec<RawLobbyData>,
    pub public: Vec<RawLobbyData>,
    /// Unix milliseconds of the last committed list
    pub updated_at: u64,
    pub last_updated_public: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    pub tick: u64,
    pub clients: usize,
    pub drivers: usize,
    pub lobbies: usize,
    pub pending_creations: usize,
    pub pooled_events: usize,
    pub duplicate_lobby_warnings: u64,
}

/// Cloneable handle for talking to a running router.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RouterMessage>,
}

impl RelayHandle {
    fn post(&self, message: RouterMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| RelayError::Transport("router has stopped".to_string()))
    }

    pub fn connect(&self, client_id: Uuid, addr: Option<SocketAddr>, outbox: Outbox) -> Result<()> {
        self.post(RouterMessage::Connected {
            client_id,
            addr,
            outbox,
        })
    }

    pub fn frame(&self, client_id: Uuid, text: String) -> Result<()> {
        self.post(RouterMessage::Frame { client_id, text })
    }

    pub fn disconnect(&self, client_id: Uuid) -> Result<()> {
        self.post(RouterMessage::Disconnected { client_id })
    }

    /// Tells the driver which replay id the recording of a lobby is stored under.
    pub fn set_replay_id(&self, lobby_id: &str, replay_id: &str) -> Result<()> {
        self.post(RouterMessage::SetReplayId {
            lobby_id: lobby_id.to_string(),
            replay_id: replay_id.to_string(),
        })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.post(RouterMessage::Shutdown)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.post(RouterMessage::Query(build(reply)))?;
        response
            .await
            .map_err(|_| RelayError::Transport("router dropped the query".to_string()))
    }

    pub async fn lobbies(&self) -> Result<Vec<LobbySummary>> {
        self.query(Query::Lobbies).await
    }

    /// Full resync snapshot of one lobby, empty if the lobby is unknown.
    pub async fn lobby_resync(&self, lobby_id: &str) -> Result<Vec<Event>> {
        let lobby_id = lobby_id.to_string();
        self.query(|reply| Query::LobbyResync { lobby_id, reply }).await
    }

    pub async fn members(&self) -> Result<Vec<MemberReport>> {
        self.query(Query::Members).await
    }

    pub async fn raw_lobbies(&self) -> Result<RawLobbyLists> {
        self.query(Query::RawLobbies).await
    }

    pub async fn stats(&self) -> Result<RouterStats> {
        self.query(Query::Stats).await
    }
}

/// Outcome of presenting a login token.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Invalid,
    /// Token is valid but stale; the client must reconnect with this one.
    Refresh(String),
    Accepted(AuthenticatedUser),
}

/// Validates a token and decides whether the identity can be committed as-is.
///
/// A token is stale when it expires within `refresh_window` or when its capability
/// set no longer matches the directory record.
pub async fn resolve_login(
    auth: &dyn AuthService,
    directory: &dyn UserDirectory,
    token: &str,
    refresh_window: Duration,
    now_secs: u64,
) -> LoginOutcome {
    let Some(user) = auth.validate_token(token).await else {
        warn!("Invalid login token presented");
        return LoginOutcome::Invalid;
    };

    let Some(record) = directory.find_user(&user.id).await else {
        warn!("Login token for {} ({}) has no directory record", user.username, user.id);
        return LoginOutcome::Invalid;
    };

    let sorted = |caps: &[Capability]| {
        let mut caps = caps.to_vec();
        caps.sort();
        caps
    };
    let stale_capabilities = sorted(&record.capabilities) != sorted(&user.capabilities);
    let near_expiry = user.time_to_expiry(now_secs) < refresh_window;

    if stale_capabilities || near_expiry {
        if stale_capabilities {
            info!(
                "User {} has outdated capabilities {:?} -> {:?}, issuing a new token",
                user.id, user.capabilities, record.capabilities
            );
        } else {
            info!("User {} has a token close to expiry, issuing a new one", user.id);
        }
        return LoginOutcome::Refresh(auth.reissue_token(&user).await);
    }

    LoginOutcome::Accepted(user)
}

/// Parses one newline-delimited driver message. Lines carry an optional `type`
/// discriminator, either a string or `{ "value": string }`.
pub fn parse_driver_line(line: &str) -> Result<Event> {
    let value: Value = serde_json::from_str(line)?;
    let kind = match value.get("type") {
        Some(Value::String(kind)) => Some(kind.as_str()),
        Some(Value::Object(kind)) => kind.get("value").and_then(Value::as_str),
        _ => None,
    };

    match kind {
        None | Some("rpcPacket") => Ok(serde_json::from_value(value)?),
        Some(other) => Err(RelayError::MalformedInbound(format!(
            "unknown driver packet type {other}"
        ))),
    }
}

/// Router-owned parts lent to lobbies while the lobby map is borrowed mutably.
struct Core {
    config: RelayConfig,
    services: Services,
    bridge: CommandBridge,
    clients: ClientRegistry,
}

impl Core {
    fn lobby_ctx(&self) -> LobbyContext<'_> {
        LobbyContext {
            clients: &self.clients,
            bridge: &self.bridge,
            codec: self.services.codec.as_ref(),
            sink: self.services.sink.as_ref(),
            config: &self.config,
        }
    }
}

pub struct Router {
    core: Core,
    lobbies: HashMap<String, LobbySession>,
    /// Raw `CreateLobby` events, replayed to every connecting client
    pending_creations: Vec<Event>,
    /// Lobby-less driver events awaiting the next tick's broadcast
    global_pool: Vec<Event>,
    members: Vec<MemberReport>,
    raw_lobbies: RawLobbyLists,
    queued_raw_lobbies: Vec<RawLobbyData>,
    tick: u64,
    duplicate_lobby_warnings: u64,
    tx: mpsc::UnboundedSender<RouterMessage>,
}

impl Router {
    /// Creates a router together with the receiving end of its message channel.
    pub fn channel(
        config: RelayConfig,
        services: Services,
    ) -> (Self, mpsc::UnboundedReceiver<RouterMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Self {
            core: Core {
                config,
                services,
                bridge: CommandBridge,
                clients: ClientRegistry::new(),
            },
            lobbies: HashMap::new(),
            pending_creations: Vec::new(),
            global_pool: Vec::new(),
            members: Vec::new(),
            raw_lobbies: RawLobbyLists::default(),
            queued_raw_lobbies: Vec::new(),
            tick: 0,
            duplicate_lobby_warnings: 0,
            tx,
        };
        (router, rx)
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.core.config
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.core.clients
    }

    pub fn lobby(&self, lobby_id: &str) -> Option<&LobbySession> {
        self.lobbies.get(lobby_id)
    }

    pub fn pending_creations(&self) -> &[Event] {
        &self.pending_creations
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            tick: self.tick,
            clients: self.core.clients.len(),
            drivers: self.core.clients.drivers().count(),
            lobbies: self.lobbies.len(),
            pending_creations: self.pending_creations.len(),
            pooled_events: self.global_pool.len()
                + self.lobbies.values().map(LobbySession::pooled).sum::<usize>(),
            duplicate_lobby_warnings: self.duplicate_lobby_warnings,
        }
    }

    /// Applies one message. Returns false once the router should stop.
    pub fn handle_message(&mut self, message: RouterMessage, now: Instant) -> bool {
        match message {
            RouterMessage::Connected {
                client_id,
                addr,
                outbox,
            } => self.connect_client(client_id, addr, outbox),
            RouterMessage::Frame { client_id, text } => self.handle_frame(client_id, &text, now),
            RouterMessage::Disconnected { client_id } => self.disconnect_client(&client_id),
            RouterMessage::IdentityResolved { client_id, user } => {
                match self.core.clients.get_mut(&client_id) {
                    Some(session) => {
                        session.set_identity(user);
                    }
                    None => debug!("Login for {} finished after it disconnected", client_id),
                }
            }
            RouterMessage::SetReplayId {
                lobby_id,
                replay_id,
            } => self.send_command(CommandBridge::set_replay_id(&lobby_id, &replay_id)),
            RouterMessage::Query(query) => self.answer(query),
            RouterMessage::Shutdown => {
                info!("Router shutting down");
                return false;
            }
        }
        true
    }

    fn answer(&self, query: Query) {
        // A dropped receiver only means the asker gave up waiting.
        match query {
            Query::Lobbies(reply) => {
                let mut lobbies: Vec<_> = self.lobbies.values().map(LobbySession::summary).collect();
                lobbies.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(lobbies);
            }
            Query::LobbyResync { lobby_id, reply } => {
                let _ = reply.send(self.lobby_resync(&lobby_id));
            }
            Query::Members(reply) => {
                let _ = reply.send(self.members.clone());
            }
            Query::RawLobbies(reply) => {
                let _ = reply.send(self.raw_lobbies.clone());
            }
            Query::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Full resync snapshot for the recorder; empty when the lobby is unknown.
    pub fn lobby_resync(&self, lobby_id: &str) -> Vec<Event> {
        match self.lobbies.get(lobby_id) {
            Some(lobby) => lobby.full_resync_snapshot(),
            None => {
                warn!("{}", RelayError::unknown("lobby", lobby_id));
                Vec::new()
            }
        }
    }

    fn send_command(&self, command: Command) {
        self.core.bridge.send(&self.core.clients, command);
    }

    /// Registers a session and brings it up to date with every known lobby.
    pub fn connect_client(&mut self, client_id: Uuid, addr: Option<SocketAddr>, outbox: Outbox) {
        let session = ClientSession::new(client_id, addr, outbox);
        session
            .outbox()
            .send_packet(&ServerPacket::AssignId { id: client_id });

        info!(
            "Sending sync to {} with {} pending lobbies and {} lobbies",
            client_id,
            self.pending_creations.len(),
            self.lobbies.len()
        );
        for event in &self.pending_creations {
            session.send_event(event);
        }
        for lobby in self.lobbies.values() {
            for event in lobby.list_snapshot() {
                session.send_event(&event);
            }
            session.send_event(&is_recording_event(lobby.id(), lobby.is_recording()));
        }

        self.core.clients.add(session);
    }

    /// Removes a session, releasing its subscription and replay listing.
    pub fn disconnect_client(&mut self, client_id: &Uuid) {
        let Some(mut session) = self.core.clients.remove(client_id) else {
            return;
        };
        session.teardown();
        for lobby in self.lobbies.values_mut() {
            lobby.unsubscribe(client_id);
        }

        if session.is_engine_driver {
            self.on_driver_disconnected();
        }
    }

    fn on_driver_disconnected(&mut self) {
        warn!("Engine driver disconnected, closing {} lobbies", self.lobbies.len());
        let ids: Vec<String> = self.lobbies.keys().cloned().collect();
        for id in ids {
            self.close_lobby(&id);
        }
    }

    pub fn handle_frame(&mut self, client_id: Uuid, text: &str, now: Instant) {
        let Some(session) = self.core.clients.get_mut(&client_id) else {
            warn!("Frame from unknown session {}", client_id);
            return;
        };

        let secret = &self.core.config.driver_secret;
        if !session.is_engine_driver && !secret.is_empty() && text == secret.as_str() {
            info!("Got new engine driver connection on {}", client_id);
            session.is_engine_driver = true;
            session.wants_broadcast_feed = false;
            return;
        }

        if !session.is_engine_driver && text == AUTOSUB {
            self.handle_autosub(client_id);
            return;
        }

        if session.is_engine_driver {
            for line in text.split('\n').filter(|line| line.trim().len() > 2) {
                match parse_driver_line(line) {
                    Ok(event) => self.route_inbound_event(event, now),
                    Err(e) => error!("Unable to parse driver message {:?}: {}", line, e),
                }
            }
        } else if session.is_telemetry_client {
            match TelemetryPacket::parse(text) {
                Ok(TelemetryPacket::Rpc(event)) => self.handle_viewer_event(client_id, event),
                Ok(TelemetryPacket::Command(payload)) => {
                    let lobby_id = session.subscribed_lobby_id.clone();
                    self.send_command(Command::Telemetry { lobby_id, payload });
                }
                Err(e) => error!("Bad telemetry frame from {}: {}", client_id, e),
            }
        } else {
            match serde_json::from_str::<Event>(text) {
                Ok(event) => self.handle_viewer_event(client_id, event),
                Err(e) => error!("{}", RelayError::MalformedInbound(format!("{client_id}: {e}"))),
            }
        }
    }

    /// Classifies one driver event as lobby-scoped or global and routes it.
    pub fn route_inbound_event(&mut self, event: Event, now: Instant) {
        if let Some(lobby_id) = event.lobby_id.as_deref() {
            match self.lobbies.get_mut(lobby_id) {
                Some(lobby) => lobby.handle_event(event),
                None => warn!(
                    "{} for {}.{}",
                    RelayError::unknown("lobby", lobby_id),
                    event.origin_class,
                    event.method
                ),
            }
            return;
        }

        self.global_pool.push(event.clone());

        if event.origin_class == APPLICATION_CLASS {
            match DriverCall::decode(&event) {
                Ok(Some(call)) => self.handle_driver_call(call, event),
                Ok(None) => debug!("Ignoring driver call {}.{}", event.origin_class, event.method),
                Err(e) => error!("{}", e),
            }
        } else if event.origin_class == LOBBY_CLASS {
            self.handle_lobby_management(event, now);
        }
    }

    fn handle_driver_call(&mut self, call: DriverCall, event: Event) {
        match call {
            DriverCall::CreateLobby { lobby_id } => {
                info!("Got new lobby: {}", lobby_id);
                self.pending_creations.push(event);
                let _ = self.register_lobby(&lobby_id);
            }
            DriverCall::SyncLobbies { lobby_ids } => {
                let listed: HashSet<&str> = lobby_ids.iter().map(String::as_str).collect();
                let stale: Vec<String> = self
                    .lobbies
                    .keys()
                    .filter(|id| !listed.contains(id.as_str()))
                    .cloned()
                    .collect();
                for id in stale {
                    warn!("Lobby {} closed, but was not removed", id);
                    self.close_lobby(&id);
                }
                for id in &lobby_ids {
                    if !self.lobbies.contains_key(id) {
                        warn!("Lobby {} opened, but was not added", id);
                        let _ = self.register_lobby(id);
                    }
                }
            }
            DriverCall::BeginMemberReport => self.members.clear(),
            DriverCall::ReportMemberInLobby(member) => self.members.push(member),
            DriverCall::RawLobbySync(row) => self.queued_raw_lobbies.push(*row),
            DriverCall::RawLobbySyncDone { public } => {
                let rows = std::mem::take(&mut self.queued_raw_lobbies);
                if public {
                    self.raw_lobbies.public = rows;
                } else {
                    self.raw_lobbies.private = rows;
                }
                self.raw_lobbies.last_updated_public = public;
                self.raw_lobbies.updated_at = get_timestamp();
            }
        }
    }

    /// Creates a lobby session. A second registration of the same id is ignored.
    pub fn register_lobby(&mut self, lobby_id: &str) -> Result<()> {
        if self.lobbies.contains_key(lobby_id) {
            self.duplicate_lobby_warnings += 1;
            let err = RelayError::DuplicateRegistration(lobby_id.to_string());
            warn!("{}", err);
            return Err(err);
        }
        self.lobbies
            .insert(lobby_id.to_string(), LobbySession::new(lobby_id));
        Ok(())
    }

    fn handle_lobby_management(&mut self, event: Event, now: Instant) {
        let Some(lobby_id) = event.entity_id.clone() else {
            error!(
                "{}",
                RelayError::MalformedInbound(format!("{}.{} without a lobby id", event.origin_class, event.method))
            );
            return;
        };

        let call = match LobbyCall::decode(&event) {
            Ok(Some(call)) => call,
            Ok(None) => {
                debug!("Ignoring lobby call {}.{}", event.origin_class, event.method);
                return;
            }
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        let ctx = self.core.lobby_ctx();
        let Some(lobby) = self.lobbies.get_mut(&lobby_id) else {
            error!("Lobby {} not found for {}.{}", lobby_id, event.origin_class, event.method);
            return;
        };

        if lobby.handle_lobby_event(event, call, now, &ctx) == LobbyOutcome::Close {
            self.deregister_lobby(&lobby_id);
        }
    }

    /// Closes a lobby: disconnect transition if needed, then deregistration.
    pub fn close_lobby(&mut self, lobby_id: &str) {
        let ctx = self.core.lobby_ctx();
        if let Some(lobby) = self.lobbies.get_mut(lobby_id) {
            lobby.close(&ctx);
        }
        self.deregister_lobby(lobby_id);
    }

    fn deregister_lobby(&mut self, lobby_id: &str) {
        if self.lobbies.remove(lobby_id).is_none() {
            return;
        }

        let before = self.pending_creations.len();
        self.pending_creations
            .retain(|event| event.arg_id(0).as_deref() != Some(lobby_id));
        if before == self.pending_creations.len() {
            warn!("Lobby {} was not found in pending lobby creations", lobby_id);
        }

        for session in self.core.clients.iter_mut() {
            if session.subscribed_lobby_id.as_deref() == Some(lobby_id) {
                session.subscribed_lobby_id = None;
            }
        }
    }

    /// Gates and dispatches one inbound viewer or telemetry call.
    pub fn handle_viewer_event(&mut self, client_id: Uuid, event: Event) {
        let Some(session) = self.core.clients.get(&client_id) else {
            return;
        };

        let lobbies = &self.lobbies;
        let always_on = |id: &str| lobbies.get(id).is_some_and(LobbySession::is_always_on);
        if let Err(e) = authorize(&event, session, always_on) {
            warn!(
                "Client {} tried to call {}.{}: {}",
                session, event.origin_class, event.method, e
            );
            session.send_event(&client_rpc::error(client_id, &e.client_message()));
            return;
        }

        match ViewerCall::decode(&event) {
            Ok(call) => self.dispatch(client_id, call),
            Err(e) => error!("Rejected call from {}: {}", session, e),
        }
    }

    fn dispatch(&mut self, client_id: Uuid, call: ViewerCall) {
        match call {
            ViewerCall::Subscribe { lobby_id } => self.subscribe_client(client_id, &lobby_id),
            ViewerCall::SetUser { token } => self.spawn_login(client_id, token),
            ViewerCall::Pong => {}
            ViewerCall::RequestJoinLobby { lobby_id } => {
                self.send_command(CommandBridge::join_lobby(&lobby_id, None))
            }
            ViewerCall::RequestJoinPrivateLobby { lobby_id, password } => {
                self.send_command(CommandBridge::join_lobby(&lobby_id, Some(&password)))
            }
            ViewerCall::EnableRecordLobby { lobby_id, password } => {
                let ctx = self.core.lobby_ctx();
                match self.lobbies.get_mut(&lobby_id) {
                    Some(lobby) => lobby.enable_continuous_record(password, &ctx),
                    None => warn!(
                        "Tried to enable recording: {}",
                        RelayError::unknown("lobby", &lobby_id)
                    ),
                }
            }
            ViewerCall::UnsubscribeFromLiveLobbyList => {
                if let Some(session) = self.core.clients.get_mut(&client_id) {
                    session.wants_broadcast_feed = false;
                    info!("Client {} unsubscribed from the live lobby feed", session);
                }
            }
            ViewerCall::ReplayGame { replay_id } => self.spawn_replay_playback(client_id, replay_id),
            ViewerCall::RequestReplayLobbies(filter) => self.start_replay_listing(client_id, filter),
            ViewerCall::CancelRequestReplayLobbies => {
                if let Some(session) = self.core.clients.get_mut(&client_id) {
                    if session.cancel_replay_listing() {
                        debug!("Cancelled replay listing for {}", session);
                    }
                }
            }
            ViewerCall::AdminSearchUsers { query } => self.spawn_admin_search(client_id, &query),
            ViewerCall::AdminSetUserScopes {
                user_id,
                capabilities,
            } => self.spawn_set_scopes(client_id, user_id, capabilities),
            ViewerCall::KickUser { user_id } => {
                let Some(session) = self.core.clients.get(&client_id) else {
                    return;
                };
                info!("Admin {} kicked {}", session, user_id);
                let lobby_id = session.subscribed_lobby_id.clone();
                self.send_command(Command::KickUser { lobby_id, user_id });
            }
        }
    }

    /// Moves a client's subscription to `lobby_id`.
    pub fn subscribe_client(&mut self, client_id: Uuid, lobby_id: &str) {
        for lobby in self.lobbies.values_mut() {
            lobby.unsubscribe(&client_id);
        }
        let known = self.lobbies.contains_key(lobby_id);
        match self.core.clients.get_mut(&client_id) {
            Some(session) => session.subscribed_lobby_id = known.then(|| lobby_id.to_string()),
            None => return,
        }

        let ctx = self.core.lobby_ctx();
        match self.lobbies.get_mut(lobby_id) {
            Some(lobby) => lobby.subscribe(client_id, &ctx),
            None => warn!("Subscribe failed: {}", RelayError::unknown("lobby", lobby_id)),
        }
    }

    fn handle_autosub(&mut self, client_id: Uuid) {
        let Some(session) = self.core.clients.get_mut(&client_id) else {
            return;
        };
        session.is_telemetry_client = true;
        session.set_identity(AuthenticatedUser {
            id: format!("auto_{client_id}"),
            username: "Telemetry Client".to_string(),
            capabilities: vec![Capability::AlphaAccess, Capability::Donor],
            expires_at: None,
        });
        info!("Client {} auto-subscribed", client_id);

        let target = self
            .lobbies
            .values()
            .find(|lobby| lobby.is_always_on())
            .map(|lobby| lobby.id().to_string());
        let Some(lobby_id) = target else {
            error!("No always-on lobby found to auto-subscribe {} to", client_id);
            return;
        };

        let secret = self.core.config.record_policy.telemetry_secret.clone();
        let ctx = self.core.lobby_ctx();
        if let Some(lobby) = self.lobbies.get_mut(&lobby_id) {
            lobby.enable_continuous_record(secret, &ctx);
        }
        self.subscribe_client(client_id, &lobby_id);
    }

    fn spawn_login(&self, client_id: Uuid, token: String) {
        let Some(session) = self.core.clients.get(&client_id) else {
            return;
        };
        let outbox = session.outbox().clone();
        let auth = Arc::clone(&self.core.services.auth);
        let directory = Arc::clone(&self.core.services.directory);
        let window = self.core.config.token_refresh_window;
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let outcome =
                resolve_login(auth.as_ref(), directory.as_ref(), &token, window, unix_seconds()).await;
            match outcome {
                LoginOutcome::Invalid => {
                    outbox.send_event(&client_rpc::invalidate_token(client_id));
                }
                LoginOutcome::Refresh(fresh) => {
                    outbox.send_event(&client_rpc::new_token(client_id, &fresh));
                }
                LoginOutcome::Accepted(user) => {
                    if tx.send(RouterMessage::IdentityResolved { client_id, user }).is_err() {
                        debug!("Router stopped before login of {} completed", client_id);
                    }
                }
            }
        });
    }

    /// Streams matching recording headers to the client until exhausted or cancelled.
    fn start_replay_listing(&mut self, client_id: Uuid, filter: ReplayFilter) {
        let Some(session) = self.core.clients.get_mut(&client_id) else {
            return;
        };
        info!("Replay listing requested by {}: {:?}", session, filter);

        let token = CancellationToken::new();
        session.start_replay_listing(token.clone());
        let outbox = session.outbox().clone();
        let recordings = Arc::clone(&self.core.services.recordings);

        tokio::spawn(async move {
            let mut headers = recordings.list_recorded_lobbies(filter).await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Replay listing for {} cancelled", client_id);
                        break;
                    }
                    next = headers.next() => match next {
                        Some(header) => {
                            if !outbox.send_event(&client_rpc::replay_lobby_info(client_id, &header)) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
    }

    fn spawn_replay_playback(&self, client_id: Uuid, replay_id: String) {
        let Some(session) = self.core.clients.get(&client_id) else {
            return;
        };
        let outbox = session.outbox().clone();
        let recordings = Arc::clone(&self.core.services.recordings);

        tokio::spawn(async move {
            match recordings.get_recorded_lobby(&replay_id).await {
                Some(recording) => {
                    outbox.send_event(&client_rpc::replay_header(client_id, &recording.header));
                    outbox.send_event(&client_rpc::expect_replay_size(
                        client_id,
                        recording.total_size(),
                    ));
                }
                None => {
                    warn!("Replay request for unknown recording {}", replay_id);
                    outbox.send_event(&client_rpc::replay_not_found(client_id, &replay_id));
                }
            }
        });
    }

    fn spawn_admin_search(&self, client_id: Uuid, query: &str) {
        let Some(session) = self.core.clients.get(&client_id) else {
            return;
        };
        let outbox = session.outbox().clone();
        let directory = Arc::clone(&self.core.services.directory);
        let query = query.replace('$', "").trim().to_string();

        tokio::spawn(async move {
            let users = match directory.find_user(&query).await {
                Some(user) => vec![user],
                None => directory.search_users_by_name(&query).await,
            };
            outbox.send_event(&client_rpc::admin_search_users_result(client_id, &users));
        });
    }

    fn spawn_set_scopes(&self, client_id: Uuid, user_id: String, capabilities: Vec<Capability>) {
        if let Some(session) = self.core.clients.get(&client_id) {
            info!(
                "Admin {} set capabilities of {} to {:?}",
                session, user_id, capabilities
            );
        }
        let directory = Arc::clone(&self.core.services.directory);

        tokio::spawn(async move {
            if let Err(e) = directory.update_user_capabilities(&user_id, capabilities).await {
                error!("Failed to update capabilities of {}: {}", user_id, e);
            }
        });
    }

    /// One fixed-rate tick: flush the global pool, then update every lobby.
    pub fn network_tick(&mut self, now: Instant) {
        self.tick += 1;

        if !self.global_pool.is_empty() {
            match self.core.services.codec.encode(&self.global_pool) {
                Ok(bytes) => {
                    for client in self.core.clients.feed_subscribers() {
                        client.send_bytes(bytes.clone());
                    }
                }
                Err(e) => error!("Failed to encode {} global events: {}", self.global_pool.len(), e),
            }
            self.global_pool.clear();
        }

        let ctx = self.core.lobby_ctx();
        for lobby in self.lobbies.values_mut() {
            lobby.update(now, &ctx);
        }

        let mut seen = HashSet::new();
        for (key, lobby) in &self.lobbies {
            if key != lobby.id() || !seen.insert(lobby.id()) {
                self.duplicate_lobby_warnings += 1;
                error!("Duplicate lobby id: {}", lobby.id());
            }
        }

        if self.tick % u64::from(self.core.config.tick_rate.max(1)) == 0 {
            debug!(
                "Tick {}: {} clients, {} lobbies, {} connected",
                self.tick,
                self.core.clients.len(),
                self.lobbies.len(),
                self.lobbies.values().filter(|l| l.is_connected()).count()
            );
        }
    }

    /// Pings every viewer and prunes sessions whose socket has gone away.
    pub fn heartbeat(&mut self) {
        let timestamp = get_timestamp();
        for session in self.core.clients.iter().filter(|c| !c.is_engine_driver) {
            session.send_event(&client_rpc::ping(session.id, timestamp));
        }

        for client_id in self.core.clients.dead_sessions() {
            debug!("Pruning closed session {}", client_id);
            self.disconnect_client(&client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_manager::Outbound;
    use crate::services::{InMemoryDirectory, TokenAuth};
    use serde_json::json;
    use shared::UserRecord;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn router() -> Router {
        let config = RelayConfig {
            driver_secret: "secret".to_string(),
            ..RelayConfig::default()
        };
        Router::channel(config, Services::in_memory()).0
    }

    fn connect(router: &mut Router) -> (Uuid, UnboundedReceiver<Outbound>) {
        let (outbox, rx) = Outbox::channel();
        let id = Uuid::new_v4();
        router.connect_client(id, None, outbox);
        (id, rx)
    }

    fn texts(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                out.push(text);
            }
        }
        out
    }

    fn driver_line(value: Value) -> String {
        value.to_string()
    }

    #[test]
    fn test_parse_driver_line_types() {
        let event = parse_driver_line(
            r#"{"type":"rpcPacket","className":"Application","method":"CreateLobby","args":["L1"]}"#,
        )
        .unwrap();
        assert!(event.is(APPLICATION_CLASS, "CreateLobby"));

        let wrapped = parse_driver_line(
            r#"{"type":{"value":"rpcPacket"},"className":"X","method":"y"}"#,
        );
        assert!(wrapped.is_ok());

        assert!(parse_driver_line(r#"{"type":"other","className":"X","method":"y"}"#).is_err());
        assert!(parse_driver_line("{").is_err());
    }

    #[test]
    fn test_connect_sends_assign_id_first() {
        let mut router = router();
        let (id, mut rx) = connect(&mut router);
        let frames = texts(&mut rx);
        let packet: ServerPacket = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(packet, ServerPacket::AssignId { id });
    }

    #[test]
    fn test_driver_secret_registers_driver() {
        let mut router = router();
        let (id, _rx) = connect(&mut router);
        router.handle_frame(id, "secret", Instant::now());

        let session = router.clients().get(&id).unwrap();
        assert!(session.is_engine_driver);
        assert!(!session.wants_broadcast_feed);
        assert_eq!(router.stats().drivers, 1);
    }

    #[test]
    fn test_duplicate_create_lobby_is_counted() {
        let mut router = router();
        let (driver, _rx) = connect(&mut router);
        router.handle_frame(driver, "secret", Instant::now());

        let create = driver_line(json!({"className": "Application", "method": "CreateLobby", "args": ["L1"]}));
        router.handle_frame(driver, &format!("{create}\n{create}\n"), Instant::now());

        assert!(router.lobby("L1").is_some());
        assert_eq!(router.stats().lobbies, 1);
        assert_eq!(router.stats().duplicate_lobby_warnings, 1);
        assert_eq!(router.pending_creations().len(), 2);
    }

    #[test]
    fn test_sync_lobbies_reconciles() {
        let mut router = router();
        router.register_lobby("L1").unwrap();
        router.register_lobby("L2").unwrap();

        let sync = Event::new(APPLICATION_CLASS, "SyncLobbies", vec![json!(["L2", "L3"])]);
        router.route_inbound_event(sync, Instant::now());

        let mut ids: Vec<_> = router.lobbies.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["L2".to_string(), "L3".to_string()]);
    }

    #[test]
    fn test_member_and_raw_lobby_reports() {
        let mut router = router();
        let now = Instant::now();
        router.route_inbound_event(Event::new(APPLICATION_CLASS, "BeginMemberReport", vec![]), now);
        router.route_inbound_event(
            Event::new(
                APPLICATION_CLASS,
                "ReportMemberInLobby",
                vec![json!("L1"), json!("76561"), json!("Goose"), json!(false), json!("Lobby"), json!("Op")],
            ),
            now,
        );
        assert_eq!(router.members.len(), 1);
        assert_eq!(router.members[0].username, "Goose");

        let row: Vec<Value> = (0..13).map(|i| json!(i.to_string())).chain([json!(4)]).collect();
        router.route_inbound_event(Event::new(APPLICATION_CLASS, "RawLobbySync", row), now);
        router.route_inbound_event(
            Event::new(APPLICATION_CLASS, "RawLobbySyncDone", vec![json!(true)]),
            now,
        );
        assert_eq!(router.raw_lobbies.public.len(), 1);
        assert_eq!(router.raw_lobbies.public[0].player_count, 4);
        assert!(router.raw_lobbies.private.is_empty());
        assert!(router.raw_lobbies.last_updated_public);
        assert!(router.queued_raw_lobbies.is_empty());
    }

    #[test]
    fn test_denied_call_reports_error() {
        let mut router = router();
        let (id, mut rx) = connect(&mut router);
        let _ = texts(&mut rx);

        router.handle_frame(
            id,
            &json!({"className": "Client", "method": "kickUser", "args": ["u1"]}).to_string(),
            Instant::now(),
        );

        let frames = texts(&mut rx);
        assert_eq!(frames.len(), 1);
        let event: Event = serde_json::from_str(&frames[0]).unwrap();
        assert!(event.is("Client", "error"));
        assert_eq!(event.arg_str(0), Some("Permission denied, you are not logged in"));
    }

    #[test]
    fn test_subscribe_retargets() {
        let mut router = router();
        router.register_lobby("L1").unwrap();
        router.register_lobby("L2").unwrap();
        let (id, mut rx) = connect(&mut router);
        router
            .core
            .clients
            .get_mut(&id)
            .unwrap()
            .set_identity(AuthenticatedUser {
                id: "1".to_string(),
                username: "Goose".to_string(),
                capabilities: vec![Capability::Donor],
                expires_at: None,
            });

        router.subscribe_client(id, "L2");
        while rx.try_recv().is_ok() {}

        router.handle_frame(
            id,
            &json!({"className": "Client", "method": "subscribe", "args": ["L1"]}).to_string(),
            Instant::now(),
        );

        assert!(!router.lobby("L2").unwrap().has_subscriber(&id));
        assert!(router.lobby("L1").unwrap().has_subscriber(&id));
        assert_eq!(
            router.clients().get(&id).unwrap().subscribed_lobby_id.as_deref(),
            Some("L1")
        );

        let mut pushes = 0;
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame, Outbound::Binary(_)) {
                pushes += 1;
            }
        }
        assert_eq!(pushes, 1);
    }

    #[test]
    fn test_subscribe_to_unknown_lobby_clears_target() {
        let mut router = router();
        let (driver, mut driver_rx) = connect(&mut router);
        router.handle_frame(driver, "secret", Instant::now());
        router.register_lobby("L1").unwrap();
        let (id, _rx) = connect(&mut router);

        router.subscribe_client(id, "L1");
        assert_eq!(
            router.clients().get(&id).unwrap().subscribed_lobby_id.as_deref(),
            Some("L1")
        );

        router.subscribe_client(id, "nope");
        assert!(router.clients().get(&id).unwrap().subscribed_lobby_id.is_none());
        assert!(!router.lobby("L1").unwrap().has_subscriber(&id));

        let _ = texts(&mut driver_rx);
        router.dispatch(id, ViewerCall::KickUser { user_id: "u1".to_string() });
        let kick: Command = serde_json::from_str(&texts(&mut driver_rx)[0]).unwrap();
        assert_eq!(
            kick,
            Command::KickUser {
                lobby_id: None,
                user_id: "u1".to_string()
            }
        );
    }

    #[test]
    fn test_driver_disconnect_closes_all_lobbies() {
        let mut router = router();
        let (driver, _rx) = connect(&mut router);
        router.handle_frame(driver, "secret", Instant::now());
        router.register_lobby("L1").unwrap();
        router.register_lobby("L2").unwrap();

        router.disconnect_client(&driver);
        assert_eq!(router.stats().lobbies, 0);
        assert_eq!(router.stats().clients, 0);
    }

    #[test]
    fn test_global_pool_reaches_feed_subscribers_only() {
        let mut router = router();
        let (_viewer, mut viewer_rx) = connect(&mut router);
        let (quiet, mut quiet_rx) = connect(&mut router);
        router.core.clients.get_mut(&quiet).unwrap().wants_broadcast_feed = false;
        let _ = texts(&mut viewer_rx);
        let _ = texts(&mut quiet_rx);

        router.route_inbound_event(Event::new(APPLICATION_CLASS, "Announcement", vec![]), Instant::now());
        router.network_tick(Instant::now());

        let mut blocks = 0;
        while let Ok(frame) = viewer_rx.try_recv() {
            if let Outbound::Binary(bytes) = frame {
                let events = router.core.services.codec.decode(&bytes).unwrap();
                assert_eq!(events[0].method, "Announcement");
                blocks += 1;
            }
        }
        assert_eq!(blocks, 1);
        assert!(quiet_rx.try_recv().is_err());
        assert_eq!(router.stats().pooled_events, 0);
    }

    #[test]
    fn test_heartbeat_prunes_dead_sessions() {
        let mut router = router();
        let (_alive, mut alive_rx) = connect(&mut router);
        let (_dead, dead_rx) = connect(&mut router);
        drop(dead_rx);
        let _ = texts(&mut alive_rx);

        router.heartbeat();
        assert_eq!(router.stats().clients, 1);
        let frames = texts(&mut alive_rx);
        let ping: Event = serde_json::from_str(&frames[0]).unwrap();
        assert!(ping.is("Client", "ping"));
    }

    #[tokio::test]
    async fn test_resolve_login_outcomes() {
        let directory = Arc::new(InMemoryDirectory::default());
        directory
            .insert(UserRecord {
                id: "1".to_string(),
                username: "Maverick".to_string(),
                capabilities: vec![Capability::Donor],
            })
            .await;
        let auth = TokenAuth::new(Arc::clone(&directory), Duration::from_secs(30 * 24 * 3600));
        let window = Duration::from_secs(4 * 24 * 3600);
        let now = unix_seconds();

        let token = auth.issue("1").await.unwrap();
        match resolve_login(&auth, directory.as_ref(), &token, window, now).await {
            LoginOutcome::Accepted(user) => assert_eq!(user.id, "1"),
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(
            resolve_login(&auth, directory.as_ref(), "bogus", window, now).await,
            LoginOutcome::Invalid
        );

        // Two days from expiry falls inside the refresh window.
        let later = now + 28 * 24 * 3600;
        assert!(matches!(
            resolve_login(&auth, directory.as_ref(), &token, window, later).await,
            LoginOutcome::Refresh(_)
        ));

        directory
            .update_user_capabilities("1", vec![Capability::Admin])
            .await
            .unwrap();
        match resolve_login(&auth, directory.as_ref(), &token, window, now).await {
            LoginOutcome::Refresh(fresh) => {
                let refreshed = auth.validate_token(&fresh).await.unwrap();
                assert_eq!(refreshed.capabilities, vec![Capability::Admin]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_answers_queries() {
        let (mut router, mut rx) = Router::channel(RelayConfig::default(), Services::in_memory());
        router.register_lobby("L2").unwrap();
        router.register_lobby("L1").unwrap();
        let handle = router.handle();

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if !router.handle_message(message, Instant::now()) {
                    break;
                }
            }
        });

        let lobbies = handle.lobbies().await.unwrap();
        assert_eq!(
            lobbies.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            vec!["L1", "L2"]
        );
        assert!(handle.lobby_resync("nope").await.unwrap().is_empty());
        assert_eq!(handle.stats().await.unwrap().lobbies, 2);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(handle.stats().await.is_err());
    }
}
