//! Per-lobby session state
//!
//! A [`LobbySession`] tracks one live (or potentially live) game lobby:
//! - Connection lifecycle, driven by the driver's periodic info reports
//! - The resync set: the events a late subscriber needs to rebuild world state
//! - Per-tick pooling of lobby traffic, flushed as one encoded block
//! - Inactivity disconnect and continuous-record rejoin timers
//!
//! Lobbies never hold a reference back to the router. Everything they need from the
//! router is lent per call through a [`LobbyContext`], and closing is reported back
//! as a [`LobbyOutcome`].

use crate::bridge::CommandBridge;
use crate::client_manager::ClientRegistry;
use crate::config::RelayConfig;
use crate::rpc::{LobbyCall, LobbyInfo, MissionInfo};
use crate::services::RecordingSink;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use shared::{is_recording_event, Event, PacketCodec, ENTITY_CLASS, LOBBY_CLASS};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// `(classes, methods)` pairs whose events define world state for a late joiner.
const RESYNC_FILTER: &[(&[&str], &[&str])] = &[
    (
        &[ENTITY_CLASS],
        &["NetInstantiate", "NetDestroy", "SetEntityUnitID", "CreateJammer"],
    ),
    (&["RadarJammerSync"], &["TDecoyModel", "TMode"]),
    (&["PlayerVehicle", "AIAirVehicle", "AIGroundUnit"], &["Die", "Spawn"]),
    (&[LOBBY_CLASS], &["LogMessage"]),
];

fn is_resync_event(event: &Event) -> bool {
    RESYNC_FILTER.iter().any(|(classes, methods)| {
        classes.contains(&event.origin_class.as_str()) && methods.contains(&event.method.as_str())
    })
}

fn is_destroy_event(event: &Event) -> bool {
    event.is(ENTITY_CLASS, "NetDestroy")
}

/// Entity a stored resync event describes.
fn resync_target(event: &Event) -> Option<String> {
    if event.is(ENTITY_CLASS, "NetInstantiate") || event.is(ENTITY_CLASS, "SetEntityUnitID") {
        event.arg_id(0)
    } else {
        event.entity_id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LobbyState {
    Disconnected,
    Connected,
}

/// Router-owned parts a lobby needs while handling an event or a tick.
pub struct LobbyContext<'a> {
    pub clients: &'a ClientRegistry,
    pub bridge: &'a CommandBridge,
    pub codec: &'a dyn PacketCodec,
    pub sink: &'a dyn RecordingSink,
    pub config: &'a RelayConfig,
}

/// What the router should do with a lobby after it handled a management event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyOutcome {
    Keep,
    Close,
}

/// Lobby row exposed to the HTTP surface and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySummary {
    pub id: String,
    pub name: String,
    pub mission_name: String,
    pub player_count: u32,
    pub max_players: u32,
    pub is_private: bool,
    pub state: LobbyState,
    pub is_always_on: bool,
    pub is_recording: bool,
    pub subscriber_count: usize,
    pub host_id: String,
    pub host_name: String,
    pub players: Vec<Value>,
    /// Milliseconds since the driver last reported the lobby healthy
    pub health_check_age_ms: u64,
}

#[derive(Debug)]
pub struct LobbySession {
    id: String,
    name: String,
    mission_name: String,
    player_count: u32,
    max_players: u32,
    is_private: bool,
    players: Vec<Value>,
    host_id: String,
    host_name: String,
    mission: Option<MissionInfo>,
    state: LobbyState,

    /// Matches the always-on broadcast heuristic; opens subscribe/join to everyone
    is_always_on: bool,
    continuous_record: bool,
    continuous_record_secret: Option<String>,

    last_info: Option<Event>,
    last_mission: Option<Event>,
    last_status: Option<Event>,

    resync: Vec<Event>,
    pool: Vec<Event>,
    management_pool: Vec<Event>,
    subscribers: HashSet<Uuid>,

    disconnect_started: Option<Instant>,
    record_join_started: Option<Instant>,
    last_health_check: Instant,
}

impl LobbySession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            mission_name: String::new(),
            player_count: 0,
            max_players: 0,
            is_private: false,
            players: Vec::new(),
            host_id: String::new(),
            host_name: String::new(),
            mission: None,
            state: LobbyState::Disconnected,
            is_always_on: false,
            continuous_record: false,
            continuous_record_secret: None,
            last_info: None,
            last_mission: None,
            last_status: None,
            resync: Vec::new(),
            pool: Vec::new(),
            management_pool: Vec::new(),
            subscribers: HashSet::new(),
            disconnect_started: None,
            record_join_started: None,
            last_health_check: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> LobbyState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LobbyState::Connected
    }

    pub fn is_always_on(&self) -> bool {
        self.is_always_on
    }

    pub fn is_recording(&self) -> bool {
        self.continuous_record
    }

    pub fn record_secret(&self) -> Option<&str> {
        self.continuous_record_secret.as_deref()
    }

    pub fn resync_set(&self) -> &[Event] {
        &self.resync
    }

    pub fn pooled(&self) -> usize {
        self.pool.len() + self.management_pool.len()
    }

    pub fn has_subscriber(&self, client_id: &Uuid) -> bool {
        self.subscribers.contains(client_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn summary(&self) -> LobbySummary {
        LobbySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            mission_name: self.mission_name.clone(),
            player_count: self.player_count,
            max_players: self.max_players,
            is_private: self.is_private,
            state: self.state,
            is_always_on: self.is_always_on,
            is_recording: self.continuous_record,
            subscriber_count: self.subscribers.len(),
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
            players: self.players.clone(),
            health_check_age_ms: self.last_health_check.elapsed().as_millis() as u64,
        }
    }

    /// Handles a lobby-scoped event from the driver.
    pub fn handle_event(&mut self, event: Event) {
        self.maintain_resync(&event);
        self.pool.push(event);
    }

    /// Appends world-state events to the resync set and prunes destroyed entities.
    pub fn maintain_resync(&mut self, event: &Event) {
        if !is_resync_event(event) {
            return;
        }

        if is_destroy_event(event) {
            if let Some(target) = event.arg_id(0) {
                let before = self.resync.len();
                self.resync
                    .retain(|stored| resync_target(stored).as_deref() != Some(target.as_str()));
                debug!(
                    "Lobby {}: entity {} destroyed, pruned {} resync events",
                    self.id,
                    target,
                    before - self.resync.len()
                );
            }
            return;
        }

        self.resync.push(event.clone());
    }

    /// Handles a `VTOLLobby.*` management event addressed to this lobby.
    pub fn handle_lobby_event(
        &mut self,
        event: Event,
        call: LobbyCall,
        now: Instant,
        ctx: &LobbyContext<'_>,
    ) -> LobbyOutcome {
        match call {
            LobbyCall::UpdateLobbyInfo(_) => self.last_info = Some(event.clone()),
            LobbyCall::UpdateMissionInfo(_) => self.last_mission = Some(event.clone()),
            LobbyCall::UpdateLobbyStatus => self.last_status = Some(event.clone()),
            _ => {}
        }
        self.maintain_resync(&event);
        self.management_pool.push(event);

        match call {
            LobbyCall::UpdateLobbyInfo(lobby_info) => self.apply_info(lobby_info, ctx),
            LobbyCall::UpdateMissionInfo(mission) => self.mission = Some(mission),
            LobbyCall::UpdateLobbyStatus | LobbyCall::LogMessage => {}
            LobbyCall::CloseLobby => {
                self.close(ctx);
                return LobbyOutcome::Close;
            }
            LobbyCall::SyncLeaveLobby => {
                info!("Got leave lobby notification for {}", self);
                self.resync.clear();
                self.flush(ctx);
            }
            LobbyCall::SyncLobbyRestart => info!("Lobby {} is restarting", self),
            LobbyCall::LobbyHealthCheck => self.last_health_check = now,
            LobbyCall::ConnectionResult { success, reason } => {
                if success {
                    info!("Connection to {} succeeded: {}", self, reason);
                } else {
                    warn!("Connection to {} failed: {}", self, reason);
                    if self.continuous_record {
                        self.record_join_started = None;
                    }
                }
            }
        }
        LobbyOutcome::Keep
    }

    /// Applies an info report: metadata, connection transition, recording rules.
    pub fn apply_info(&mut self, report: LobbyInfo, ctx: &LobbyContext<'_>) {
        self.name = report.name;
        self.mission_name = report.mission_name;
        self.player_count = report.player_count;
        self.max_players = report.max_players;
        self.is_private = report.is_private;
        self.players = report.players;
        self.host_id = report.host_id;
        self.host_name = report.host_name;

        match (report.is_connected, self.state) {
            (true, LobbyState::Disconnected) => self.on_connect(ctx),
            (false, LobbyState::Connected) => self.on_disconnect(ctx),
            _ => {}
        }

        let was_recording = self.continuous_record;
        let policy = &ctx.config.record_policy;

        if policy.is_always_on(&self.name, self.player_count) {
            if !self.is_always_on {
                info!("Lobby {} matches the always-on broadcast pattern", self);
            }
            self.is_always_on = true;
            if policy.record_always_on {
                self.continuous_record = true;
            }
        }

        let workshop_rule = self
            .mission
            .as_ref()
            .and_then(|mission| policy.workshop_rule(&mission.workshop_id));
        if let Some(rule) = workshop_rule {
            self.continuous_record = true;
            if rule.secret.is_some() {
                self.continuous_record_secret = rule.secret.clone();
            }
        }

        if self.continuous_record && !was_recording {
            info!("Continuous record enabled for {}", self);
            self.sync_is_recording(ctx);
        }
    }

    /// Explicitly turns on continuous record, optionally storing a join secret.
    pub fn enable_continuous_record(&mut self, secret: Option<String>, ctx: &LobbyContext<'_>) {
        self.continuous_record = true;
        if secret.is_some() {
            self.continuous_record_secret = secret;
        }
        info!("Continuous record enabled for {}", self);
        self.sync_is_recording(ctx);
    }

    /// Pushes the current `isRecording` flag to every subscriber.
    pub fn sync_is_recording(&self, ctx: &LobbyContext<'_>) {
        let event = is_recording_event(&self.id, self.continuous_record);
        for client in self.subscribers.iter().filter_map(|id| ctx.clients.get(id)) {
            client.send_event(&event);
        }
    }

    fn on_connect(&mut self, ctx: &LobbyContext<'_>) {
        info!("Lobby {} connected", self);
        self.state = LobbyState::Connected;
        ctx.sink.lobby_connected(&self.id);
    }

    fn on_disconnect(&mut self, ctx: &LobbyContext<'_>) {
        info!("Lobby {} disconnected", self);
        self.state = LobbyState::Disconnected;
        ctx.sink.lobby_disconnected(&self.id);
        self.resync.clear();
        self.pool.clear();
    }

    /// Asks the driver to leave and drops to `Disconnected` without waiting for it.
    pub fn disconnect(&mut self, ctx: &LobbyContext<'_>) {
        ctx.bridge
            .send(ctx.clients, CommandBridge::leave_lobby(&self.id));
        self.on_disconnect(ctx);
        self.disconnect_started = None;
    }

    /// Runs the disconnect transition if needed; the router deregisters afterwards.
    pub fn close(&mut self, ctx: &LobbyContext<'_>) {
        info!("Closing lobby {}", self);
        if self.is_connected() {
            self.on_disconnect(ctx);
        }
    }

    /// Adds a subscriber and sends it the full resync snapshot as one block.
    pub fn subscribe(&mut self, client_id: Uuid, ctx: &LobbyContext<'_>) {
        self.subscribers.insert(client_id);

        let Some(client) = ctx.clients.get(&client_id) else {
            warn!("Subscriber {} of lobby {} is not registered", client_id, self.id);
            return;
        };

        let snapshot = self.full_resync_snapshot();
        match ctx.codec.encode(&snapshot) {
            Ok(bytes) => {
                client.send_bytes(bytes);
                info!(
                    "Created resync packet with {} events for {}",
                    snapshot.len(),
                    client
                );
            }
            Err(e) => error!("Failed to encode resync snapshot for lobby {}: {}", self.id, e),
        }
    }

    pub fn unsubscribe(&mut self, client_id: &Uuid) -> bool {
        self.subscribers.remove(client_id)
    }

    /// Mission and info snapshots followed by the resync set.
    pub fn full_resync_snapshot(&self) -> Vec<Event> {
        [&self.last_mission, &self.last_info]
            .into_iter()
            .flatten()
            .chain(self.resync.iter())
            .cloned()
            .collect()
    }

    /// Mission, info and status snapshots, for lobby-list views.
    pub fn list_snapshot(&self) -> Vec<Event> {
        [&self.last_mission, &self.last_info, &self.last_status]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Per-tick lifecycle step followed by a flush.
    pub fn update(&mut self, now: Instant, ctx: &LobbyContext<'_>) {
        self.subscribers.retain(|id| {
            ctx.clients
                .get(id)
                .is_some_and(|client| client.is_alive())
        });

        if self.is_connected() {
            self.record_join_started = None;

            if self.subscribers.is_empty() {
                self.disconnect_started.get_or_insert(now);
            } else {
                self.disconnect_started = None;
            }

            let idle_expired = self
                .disconnect_started
                .is_some_and(|start| now.duration_since(start) >= ctx.config.inactivity_timeout);
            if !self.continuous_record && idle_expired {
                info!("Disconnecting from lobby {} due to inactivity", self.id);
                self.disconnect(ctx);
            }
        } else {
            self.disconnect_started = None;

            let retry_due = self
                .record_join_started
                .map_or(true, |start| now.duration_since(start) > ctx.config.record_retry);
            if self.continuous_record && self.player_count >= 1 && retry_due {
                info!(
                    "Continuous record for {} is set but not connected, attempting to join",
                    self
                );
                ctx.bridge.send(
                    ctx.clients,
                    CommandBridge::join_lobby(&self.id, self.continuous_record_secret.as_deref()),
                );
                self.record_join_started = Some(now);
            }
        }

        self.flush(ctx);
    }

    /// Broadcasts the pooled events to subscribers and hands them to the recorder.
    /// Returns how many events left the pools.
    pub fn flush(&mut self, ctx: &LobbyContext<'_>) -> usize {
        if self.pool.is_empty() && self.management_pool.is_empty() {
            return 0;
        }

        if !self.pool.is_empty() {
            match ctx.codec.encode(&self.pool) {
                Ok(bytes) => {
                    for client in self.subscribers.iter().filter_map(|id| ctx.clients.get(id)) {
                        client.send_bytes(bytes.clone());
                    }
                }
                Err(e) => error!("Failed to encode {} events for lobby {}: {}", self.pool.len(), self.id, e),
            }
        }

        let mut recorded = std::mem::take(&mut self.management_pool);
        recorded.append(&mut self.pool);
        let flushed = recorded.len();
        ctx.sink.lobby_data(&self.id, recorded);
        flushed
    }
}

impl fmt::Display for LobbySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
