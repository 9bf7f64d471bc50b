//! Wire types shared between the relay broker, the engine driver and viewer clients.
//!
//! Everything that crosses a socket lives here: the [`Event`] RPC unit, the
//! [`Command`] union sent to the engine driver, identities and recordings handed
//! over by external collaborators, and the batch codec used for pooled broadcasts.

pub mod codec;

pub use codec::{CodecError, Lz4Codec, PacketCodec};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Class of global calls declared by the engine driver (lobby creation, member reports).
pub const APPLICATION_CLASS: &str = "Application";
/// Class of calls addressed to a single viewer session.
pub const CLIENT_CLASS: &str = "Client";
/// Class of lobby-management events; the event's entity id carries the lobby id.
pub const LOBBY_CLASS: &str = "VTOLLobby";
/// Class of entity lifecycle events (instantiate, destroy, unit id assignment).
pub const ENTITY_CLASS: &str = "MessageHandler";

/// A single RPC event as it travels on the wire.
///
/// Field names follow the engine driver's JSON encoding. Events are never mutated after
/// construction; pools hold clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "className")]
    pub origin_class: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(
        rename = "id",
        default,
        deserialize_with = "loose_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub entity_id: Option<String>,
    #[serde(
        rename = "gameId",
        default,
        deserialize_with = "loose_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub lobby_id: Option<String>,
    #[serde(rename = "orgTimestamp", default)]
    pub timestamp: u64,
}

impl Event {
    pub fn new(origin_class: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            origin_class: origin_class.to_string(),
            method: method.to_string(),
            args,
            entity_id: None,
            lobby_id: None,
            timestamp: get_timestamp(),
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_lobby(mut self, lobby_id: impl Into<String>) -> Self {
        self.lobby_id = Some(lobby_id.into());
        self
    }

    /// True when the event is `class.method`.
    pub fn is(&self, class: &str, method: &str) -> bool {
        self.origin_class == class && self.method == method
    }

    /// Positional argument rendered as an id string. Numbers are accepted as well,
    /// since the driver is not consistent about id encoding.
    pub fn arg_id(&self, index: usize) -> Option<String> {
        self.args.get(index).and_then(value_as_id)
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    pub fn arg_bool(&self, index: usize) -> Option<bool> {
        self.args.get(index).and_then(Value::as_bool)
    }

    pub fn arg_u32(&self, index: usize) -> Option<u32> {
        let value = self.args.get(index)?;
        match value {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn arg_u64(&self, index: usize) -> Option<u64> {
        match self.args.get(index)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Renders a string or number JSON value as an id.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_id))
}

/// Fire-and-forget instruction for the engine driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    JoinLobby {
        lobby_id: String,
    },
    JoinLobbyWithPassword {
        lobby_id: String,
        password: String,
    },
    LeaveLobby {
        lobby_id: String,
    },
    SetReplayId {
        lobby_id: String,
        replay_id: String,
    },
    KickUser {
        lobby_id: Option<String>,
        user_id: String,
    },
    /// Opaque command from the telemetry client, tagged with its lobby.
    Telemetry {
        lobby_id: Option<String>,
        payload: Value,
    },
}

impl Command {
    pub fn lobby_id(&self) -> Option<&str> {
        match self {
            Command::JoinLobby { lobby_id }
            | Command::JoinLobbyWithPassword { lobby_id, .. }
            | Command::LeaveLobby { lobby_id }
            | Command::SetReplayId { lobby_id, .. } => Some(lobby_id),
            Command::KickUser { lobby_id, .. } | Command::Telemetry { lobby_id, .. } => {
                lobby_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AlphaAccess,
    Donor,
    Admin,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::AlphaAccess => "alpha_access",
            Capability::Donor => "donor",
            Capability::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Identity established by a successful login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: String,
    pub username: String,
    pub capabilities: Vec<Capability>,
    /// Token expiry in unix seconds.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl AuthenticatedUser {
    pub fn has_any(&self, required: &[Capability]) -> bool {
        required.iter().any(|c| self.capabilities.contains(c))
    }

    /// Time left before the token expires, zero if already expired or unknown.
    pub fn time_to_expiry(&self, now_unix_secs: u64) -> Duration {
        let expires = self.expires_at.unwrap_or(0);
        Duration::from_secs(expires.saturating_sub(now_unix_secs))
    }
}

/// A user as stored by the directory collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub capabilities: Vec<Capability>,
}

/// Summary of one recorded lobby, as listed by the recording store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedLobbyHeader {
    pub id: String,
    pub lobby_name: String,
    pub mission_name: String,
    pub host_name: String,
    #[serde(default)]
    pub player_names: Vec<String>,
    /// Recording start in unix milliseconds.
    pub recorded_at: u64,
}

/// Byte range of one stored chunk of a recording body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedLobby {
    pub header: RecordedLobbyHeader,
    pub chunks: Vec<ChunkSpan>,
}

impl RecordedLobby {
    /// Declared body size: the end of the last chunk.
    pub fn total_size(&self) -> u64 {
        self.chunks
            .last()
            .map(|chunk| chunk.start + chunk.length)
            .unwrap_or(0)
    }
}

/// Free-text and date-range filter for replay listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFilter {
    pub id: Option<String>,
    pub lobby_name: String,
    pub player_name: String,
    pub host_name: String,
    pub after: Option<u64>,
    pub before: Option<u64>,
}

impl ReplayFilter {
    pub fn matches(&self, header: &RecordedLobbyHeader) -> bool {
        fn contains(haystack: &str, needle: &str) -> bool {
            needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
        }

        if let Some(id) = &self.id {
            if &header.id != id {
                return false;
            }
        }

        contains(&header.lobby_name, &self.lobby_name)
            && contains(&header.host_name, &self.host_name)
            && (self.player_name.is_empty()
                || header
                    .player_names
                    .iter()
                    .any(|name| contains(name, &self.player_name)))
            && self.after.map_or(true, |after| header.recorded_at >= after)
            && self.before.map_or(true, |before| header.recorded_at <= before)
    }
}

/// Non-RPC control packets sent from the server to a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerPacket {
    AssignId { id: Uuid },
}

/// Builders for outbound `Client.*` calls addressed to one session.
pub mod client_rpc {
    use super::{Event, RecordedLobbyHeader, UserRecord, CLIENT_CLASS};
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn call(session: Uuid, method: &str, args: Vec<Value>) -> Event {
        Event::new(CLIENT_CLASS, method, args).with_entity(session.to_string())
    }

    pub fn ping(session: Uuid, timestamp: u64) -> Event {
        call(session, "ping", vec![json!(timestamp)])
    }

    pub fn error(session: Uuid, message: &str) -> Event {
        call(session, "error", vec![json!(message)])
    }

    pub fn invalidate_token(session: Uuid) -> Event {
        call(session, "invalidateToken", vec![])
    }

    pub fn new_token(session: Uuid, token: &str) -> Event {
        call(session, "newToken", vec![json!(token)])
    }

    pub fn replay_lobby_info(session: Uuid, header: &RecordedLobbyHeader) -> Event {
        call(session, "replayLobbyInfo", vec![json!(header)])
    }

    pub fn replay_header(session: Uuid, header: &RecordedLobbyHeader) -> Event {
        call(session, "replayHeader", vec![json!(header)])
    }

    pub fn expect_replay_size(session: Uuid, size: u64) -> Event {
        call(session, "expectReplaySize", vec![json!(size)])
    }

    pub fn replay_not_found(session: Uuid, replay_id: &str) -> Event {
        call(session, "replayNotFound", vec![json!(replay_id)])
    }

    pub fn admin_search_users_result(session: Uuid, users: &[UserRecord]) -> Event {
        call(session, "adminSearchUsersResult", vec![json!(users)])
    }
}

/// `VTOLLobby.isRecording(flag)` notification for one lobby.
pub fn is_recording_event(lobby_id: &str, recording: bool) -> Event {
    Event::new(LOBBY_CLASS, "isRecording", vec![Value::Bool(recording)]).with_entity(lobby_id)
}

/// Current unix time in milliseconds.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_parses_driver_json() {
        let raw = r#"{"type":"rpcPacket","className":"MessageHandler","method":"NetInstantiate","args":["E7",1,2],"id":42,"gameId":"L1","orgTimestamp":1000}"#;
        let event: Event = serde_json::from_str(raw).unwrap();

        assert_eq!(event.origin_class, "MessageHandler");
        assert_eq!(event.method, "NetInstantiate");
        assert_eq!(event.entity_id.as_deref(), Some("42"));
        assert_eq!(event.lobby_id.as_deref(), Some("L1"));
        assert_eq!(event.timestamp, 1000);
        assert_eq!(event.arg_id(0).as_deref(), Some("E7"));
        assert_eq!(event.arg_u32(1), Some(1));
    }

    #[test]
    fn test_event_missing_optional_fields() {
        let event: Event =
            serde_json::from_str(r#"{"className":"Application","method":"BeginMemberReport"}"#)
                .unwrap();
        assert!(event.args.is_empty());
        assert!(event.entity_id.is_none());
        assert!(event.lobby_id.is_none());
        assert!(event.is(APPLICATION_CLASS, "BeginMemberReport"));
    }

    #[test]
    fn test_event_arg_accessors() {
        let event = Event::new("X", "y", vec![json!("12"), json!(true), json!(3.7), json!(null)]);
        assert_eq!(event.arg_u32(0), Some(12));
        assert_eq!(event.arg_bool(1), Some(true));
        assert_eq!(event.arg_u64(2), Some(3));
        assert_eq!(event.arg_id(3), None);
        assert_eq!(event.arg_str(9), None);
    }

    #[test]
    fn test_command_wire_shape() {
        let command = Command::JoinLobbyWithPassword {
            lobby_id: "L1".to_string(),
            password: "1776".to_string(),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({"type": "joinLobbyWithPassword", "lobbyId": "L1", "password": "1776"})
        );
        assert_eq!(command.lobby_id(), Some("L1"));

        let leave = Command::LeaveLobby { lobby_id: "L2".to_string() };
        assert_eq!(serde_json::to_value(&leave).unwrap(), json!({"type": "leaveLobby", "lobbyId": "L2"}));
    }

    #[test]
    fn test_user_capabilities() {
        let user = AuthenticatedUser {
            id: "1".to_string(),
            username: "pilot".to_string(),
            capabilities: vec![Capability::Donor],
            expires_at: Some(100),
        };
        assert!(user.has_any(&[Capability::AlphaAccess, Capability::Donor]));
        assert!(!user.has_any(&[Capability::Admin]));
        assert!(!user.has_any(&[]));
        assert_eq!(user.time_to_expiry(40), Duration::from_secs(60));
        assert_eq!(user.time_to_expiry(400), Duration::ZERO);
    }

    #[test]
    fn test_recorded_lobby_total_size() {
        let header = RecordedLobbyHeader {
            id: "r1".to_string(),
            lobby_name: "Arena".to_string(),
            mission_name: "BVR".to_string(),
            host_name: "host".to_string(),
            player_names: vec![],
            recorded_at: 0,
        };
        let lobby = RecordedLobby {
            header,
            chunks: vec![
                ChunkSpan { start: 0, length: 512 },
                ChunkSpan { start: 512, length: 100 },
            ],
        };
        assert_eq!(lobby.total_size(), 612);
    }

    #[test]
    fn test_replay_filter_matching() {
        let header = RecordedLobbyHeader {
            id: "r1".to_string(),
            lobby_name: "24/7 BVR Arena".to_string(),
            mission_name: "Arena".to_string(),
            host_name: "Host".to_string(),
            player_names: vec!["Maverick".to_string(), "Goose".to_string()],
            recorded_at: 5_000,
        };

        assert!(ReplayFilter::default().matches(&header));

        let by_name = ReplayFilter {
            lobby_name: "bvr".to_string(),
            player_name: "goo".to_string(),
            ..Default::default()
        };
        assert!(by_name.matches(&header));

        let out_of_range = ReplayFilter {
            after: Some(6_000),
            ..Default::default()
        };
        assert!(!out_of_range.matches(&header));

        let wrong_id = ReplayFilter {
            id: Some("r2".to_string()),
            ..Default::default()
        };
        assert!(!wrong_id.matches(&header));
    }

    #[test]
    fn test_assign_id_packet_shape() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ServerPacket::AssignId { id }).unwrap();
        assert_eq!(value["type"], "assignId");
        assert_eq!(value["id"], id.to_string());
    }
}
