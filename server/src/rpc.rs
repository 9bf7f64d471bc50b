//! RPC registration table and typed ingress decoding.
//!
//! Every `(class, method)` pair the relay knows about is listed once in [`RPC_TABLE`],
//! with its direction, the capabilities it requires and, for inbound viewer calls, the
//! decoder that turns the positional `args` array into a typed call. Argument arity and
//! types are checked here, so nothing downstream indexes into raw JSON.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    value_as_id, Capability, Event, ReplayFilter, APPLICATION_CLASS, CLIENT_CLASS, LOBBY_CLASS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Called by viewers, handled by the relay.
    Inbound,
    /// Pushed by the relay to viewers.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Open,
    /// Caller needs at least one of these.
    AnyOf(&'static [Capability]),
}

const PLAYERS: &[Capability] = &[Capability::AlphaAccess, Capability::Donor];
const ADMINS: &[Capability] = &[Capability::Admin];

pub type Decoder = fn(&Event) -> Result<ViewerCall>;

pub struct RpcEntry {
    pub class: &'static str,
    pub method: &'static str,
    pub direction: Direction,
    pub permission: Permission,
    decode: Option<Decoder>,
}

impl RpcEntry {
    const fn inbound(
        class: &'static str,
        method: &'static str,
        permission: Permission,
        decode: Decoder,
    ) -> Self {
        Self {
            class,
            method,
            direction: Direction::Inbound,
            permission,
            decode: Some(decode),
        }
    }

    const fn outbound(class: &'static str, method: &'static str) -> Self {
        Self {
            class,
            method,
            direction: Direction::Outbound,
            permission: Permission::Open,
            decode: None,
        }
    }

    /// Subscribe and join requests are auto-allowed when they target an always-on lobby.
    pub fn targets_lobby_join(&self) -> bool {
        (self.class == CLIENT_CLASS && self.method == "subscribe")
            || (self.class == APPLICATION_CLASS && self.method == "requestJoinLobby")
    }
}

pub static RPC_TABLE: &[RpcEntry] = &[
    RpcEntry::inbound(CLIENT_CLASS, "subscribe", Permission::AnyOf(PLAYERS), decode_subscribe),
    RpcEntry::inbound(APPLICATION_CLASS, "requestJoinLobby", Permission::AnyOf(PLAYERS), decode_join),
    RpcEntry::inbound(
        APPLICATION_CLASS,
        "requestJoinPrivateLobby",
        Permission::AnyOf(PLAYERS),
        decode_join_private,
    ),
    RpcEntry::inbound(CLIENT_CLASS, "enableRecordLobby", Permission::AnyOf(PLAYERS), decode_enable_record),
    RpcEntry::inbound(
        CLIENT_CLASS,
        "unsubscribeFromLiveLobbyList",
        Permission::Open,
        decode_unsubscribe_feed,
    ),
    RpcEntry::inbound(CLIENT_CLASS, "replayGame", Permission::Open, decode_replay_game),
    RpcEntry::inbound(CLIENT_CLASS, "requestReplayLobbies", Permission::Open, decode_replay_listing),
    RpcEntry::inbound(
        CLIENT_CLASS,
        "cancelRequestReplayLobbies",
        Permission::Open,
        decode_cancel_listing,
    ),
    RpcEntry::inbound(CLIENT_CLASS, "setUser", Permission::Open, decode_set_user),
    RpcEntry::inbound(CLIENT_CLASS, "pong", Permission::Open, decode_pong),
    RpcEntry::inbound(CLIENT_CLASS, "adminSearchUsers", Permission::AnyOf(ADMINS), decode_search_users),
    RpcEntry::inbound(CLIENT_CLASS, "adminSetUserScopes", Permission::AnyOf(ADMINS), decode_set_scopes),
    RpcEntry::inbound(CLIENT_CLASS, "kickUser", Permission::AnyOf(ADMINS), decode_kick),
    RpcEntry::outbound(CLIENT_CLASS, "ping"),
    RpcEntry::outbound(CLIENT_CLASS, "error"),
    RpcEntry::outbound(CLIENT_CLASS, "invalidateToken"),
    RpcEntry::outbound(CLIENT_CLASS, "newToken"),
    RpcEntry::outbound(CLIENT_CLASS, "replayLobbyInfo"),
    RpcEntry::outbound(CLIENT_CLASS, "replayHeader"),
    RpcEntry::outbound(CLIENT_CLASS, "expectReplaySize"),
    RpcEntry::outbound(CLIENT_CLASS, "replayNotFound"),
    RpcEntry::outbound(CLIENT_CLASS, "adminSearchUsersResult"),
    RpcEntry::outbound(LOBBY_CLASS, "isRecording"),
];

/// Finds the inbound entry for a viewer call, if the call is registered.
pub fn lookup_inbound(class: &str, method: &str) -> Option<&'static RpcEntry> {
    RPC_TABLE
        .iter()
        .find(|e| e.direction == Direction::Inbound && e.class == class && e.method == method)
}

/// A viewer call after argument validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerCall {
    Subscribe { lobby_id: String },
    SetUser { token: String },
    Pong,
    RequestJoinLobby { lobby_id: String },
    RequestJoinPrivateLobby { lobby_id: String, password: String },
    EnableRecordLobby { lobby_id: String, password: Option<String> },
    UnsubscribeFromLiveLobbyList,
    ReplayGame { replay_id: String },
    RequestReplayLobbies(ReplayFilter),
    CancelRequestReplayLobbies,
    AdminSearchUsers { query: String },
    AdminSetUserScopes { user_id: String, capabilities: Vec<Capability> },
    KickUser { user_id: String },
}

impl ViewerCall {
    pub fn decode(event: &Event) -> Result<Self> {
        let entry = lookup_inbound(&event.origin_class, &event.method)
            .ok_or_else(|| RelayError::unknown("method", call_name(event)))?;
        match entry.decode {
            Some(decode) => decode(event),
            None => Err(RelayError::unknown("method", call_name(event))),
        }
    }
}

fn call_name(event: &Event) -> String {
    format!("{}.{}", event.origin_class, event.method)
}

fn required<T>(event: &Event, index: usize, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| {
        RelayError::MalformedInbound(format!(
            "{}: argument {} missing or invalid",
            call_name(event),
            index
        ))
    })
}

/// Lenient text argument: strings as-is, numbers and booleans rendered.
fn text(event: &Event, index: usize) -> Option<String> {
    match event.args.get(index)? {
        Value::Bool(b) => Some(b.to_string()),
        other => value_as_id(other),
    }
}

fn decode_subscribe(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::Subscribe {
        lobby_id: required(event, 0, event.arg_id(0))?,
    })
}

fn decode_join(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::RequestJoinLobby {
        lobby_id: required(event, 0, event.arg_id(0))?,
    })
}

fn decode_join_private(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::RequestJoinPrivateLobby {
        lobby_id: required(event, 0, event.arg_id(0))?,
        password: required(event, 1, text(event, 1))?,
    })
}

fn decode_enable_record(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::EnableRecordLobby {
        lobby_id: required(event, 0, event.arg_id(0))?,
        password: text(event, 1).filter(|p| !p.is_empty()),
    })
}

fn decode_unsubscribe_feed(_: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::UnsubscribeFromLiveLobbyList)
}

fn decode_cancel_listing(_: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::CancelRequestReplayLobbies)
}

fn decode_pong(_: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::Pong)
}

fn decode_replay_game(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::ReplayGame {
        replay_id: required(event, 0, event.arg_id(0))?,
    })
}

fn decode_replay_listing(event: &Event) -> Result<ViewerCall> {
    let bound = |index| event.arg_u64(index).filter(|&t| t > 0);
    Ok(ViewerCall::RequestReplayLobbies(ReplayFilter {
        id: event.arg_id(0).filter(|id| !id.is_empty()),
        lobby_name: text(event, 1).unwrap_or_default(),
        player_name: text(event, 2).unwrap_or_default(),
        host_name: text(event, 3).unwrap_or_default(),
        after: bound(4),
        before: bound(5),
    }))
}

fn decode_set_user(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::SetUser {
        token: required(event, 0, event.arg_str(0).map(str::to_string))?,
    })
}

fn decode_search_users(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::AdminSearchUsers {
        query: required(event, 0, text(event, 0))?,
    })
}

fn decode_set_scopes(event: &Event) -> Result<ViewerCall> {
    let user_id = required(event, 0, event.arg_id(0))?;
    let raw = required(event, 1, event.args.get(1).cloned())?;
    let capabilities: Vec<Capability> = serde_json::from_value(raw)?;
    Ok(ViewerCall::AdminSetUserScopes { user_id, capabilities })
}

fn decode_kick(event: &Event) -> Result<ViewerCall> {
    Ok(ViewerCall::KickUser {
        user_id: required(event, 0, event.arg_id(0))?,
    })
}

/// One row of the driver's "who is in which lobby" report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberReport {
    pub user_id: String,
    pub lobby_id: String,
    pub username: String,
    pub is_private: bool,
    pub lobby_name: String,
    pub mission_name: String,
}

/// One lobby-browser row as scraped by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLobbyData {
    pub lobby_name: String,
    pub owner_name: String,
    pub owner_id: String,
    pub scenario_name: String,
    pub scenario_id: String,
    pub max_players: String,
    pub feature: String,
    pub env_idx: String,
    pub game_version: String,
    pub briefing_room: String,
    pub has_pwd: bool,
    pub game_state: String,
    pub m_utc: String,
    pub player_count: u32,
}

/// Global calls declared by the engine driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    CreateLobby { lobby_id: String },
    SyncLobbies { lobby_ids: Vec<String> },
    BeginMemberReport,
    ReportMemberInLobby(MemberReport),
    RawLobbySync(Box<RawLobbyData>),
    RawLobbySyncDone { public: bool },
}

impl DriverCall {
    /// Decodes an `Application.*` event from the driver. Unknown methods yield `None`.
    pub fn decode(event: &Event) -> Result<Option<Self>> {
        if event.origin_class != APPLICATION_CLASS {
            return Ok(None);
        }

        let call = match event.method.as_str() {
            "CreateLobby" => DriverCall::CreateLobby {
                lobby_id: required(event, 0, event.arg_id(0))?,
            },
            "SyncLobbies" => {
                let ids = required(event, 0, event.args.first().and_then(Value::as_array))?;
                DriverCall::SyncLobbies {
                    lobby_ids: ids.iter().filter_map(value_as_id).collect(),
                }
            }
            "BeginMemberReport" => DriverCall::BeginMemberReport,
            "ReportMemberInLobby" => DriverCall::ReportMemberInLobby(MemberReport {
                lobby_id: required(event, 0, event.arg_id(0))?,
                user_id: required(event, 1, event.arg_id(1))?,
                username: text(event, 2).unwrap_or_default(),
                is_private: event.arg_bool(3).unwrap_or(false),
                lobby_name: text(event, 4).unwrap_or_default(),
                mission_name: text(event, 5).unwrap_or_default(),
            }),
            "RawLobbySync" => DriverCall::RawLobbySync(Box::new(RawLobbyData {
                lobby_name: text(event, 0).unwrap_or_default(),
                owner_name: text(event, 1).unwrap_or_default(),
                owner_id: text(event, 2).unwrap_or_default(),
                scenario_name: text(event, 3).unwrap_or_default(),
                scenario_id: text(event, 4).unwrap_or_default(),
                max_players: text(event, 5).unwrap_or_default(),
                feature: text(event, 6).unwrap_or_default(),
                env_idx: text(event, 7).unwrap_or_default(),
                game_version: text(event, 8).unwrap_or_default(),
                briefing_room: text(event, 9).unwrap_or_default(),
                has_pwd: event.arg_bool(10).unwrap_or(false),
                game_state: text(event, 11).unwrap_or_default(),
                m_utc: text(event, 12).unwrap_or_default(),
                player_count: event.arg_u32(13).unwrap_or(0),
            })),
            "RawLobbySyncDone" => DriverCall::RawLobbySyncDone {
                public: event.arg_bool(0).unwrap_or(false),
            },
            _ => return Ok(None),
        };
        Ok(Some(call))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LobbyInfo {
    pub name: String,
    pub mission_name: String,
    pub player_count: u32,
    pub max_players: u32,
    pub is_private: bool,
    pub is_connected: bool,
    pub players: Vec<Value>,
    pub host_id: String,
    pub host_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionInfo {
    pub name: String,
    pub id: String,
    pub campaign_id: String,
    pub workshop_id: String,
    pub map_id: String,
    pub is_builtin: bool,
}

/// Lobby-management events (`VTOLLobby.*`), addressed by the event's entity id.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyCall {
    UpdateLobbyInfo(LobbyInfo),
    UpdateMissionInfo(MissionInfo),
    UpdateLobbyStatus,
    CloseLobby,
    SyncLeaveLobby,
    SyncLobbyRestart,
    LogMessage,
    LobbyHealthCheck,
    ConnectionResult { success: bool, reason: String },
}

impl LobbyCall {
    /// Decodes a lobby-management event. Unknown methods yield `None`.
    pub fn decode(event: &Event) -> Result<Option<Self>> {
        if event.origin_class != LOBBY_CLASS {
            return Ok(None);
        }

        let call = match event.method.as_str() {
            "UpdateLobbyInfo" => LobbyCall::UpdateLobbyInfo(LobbyInfo {
                name: text(event, 0).unwrap_or_default(),
                mission_name: text(event, 1).unwrap_or_default(),
                player_count: required(event, 2, event.arg_u32(2))?,
                max_players: event.arg_u32(3).unwrap_or(0),
                is_private: event.arg_bool(4).unwrap_or(false),
                is_connected: required(event, 5, event.arg_bool(5))?,
                players: event
                    .args
                    .get(6)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                host_id: text(event, 7).unwrap_or_default(),
                host_name: text(event, 8).unwrap_or_default(),
            }),
            "UpdateMissionInfo" => LobbyCall::UpdateMissionInfo(MissionInfo {
                name: text(event, 0).unwrap_or_default(),
                id: text(event, 1).unwrap_or_default(),
                campaign_id: text(event, 2).unwrap_or_default(),
                workshop_id: text(event, 3).unwrap_or_default(),
                map_id: text(event, 4).unwrap_or_default(),
                is_builtin: event.arg_bool(5).unwrap_or(false),
            }),
            "UpdateLobbyStatus" => LobbyCall::UpdateLobbyStatus,
            "CloseLobby" => LobbyCall::CloseLobby,
            "SyncLeaveLobby" => LobbyCall::SyncLeaveLobby,
            "SyncLobbyRestart" => LobbyCall::SyncLobbyRestart,
            "LogMessage" => LobbyCall::LogMessage,
            "LobbyHealthCheck" => LobbyCall::LobbyHealthCheck,
            "ConnectionResult" => LobbyCall::ConnectionResult {
                success: required(event, 0, event.arg_bool(0))?,
                reason: text(event, 1).unwrap_or_default(),
            },
            _ => return Ok(None),
        };
        Ok(Some(call))
    }
}

/// Frame sent by the telemetry client after its `autosub` handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryPacket {
    Rpc(Event),
    Command(Value),
}

#[derive(Deserialize)]
struct RawTelemetryPacket {
    #[serde(rename = "type")]
    kind: u8,
    packet: Value,
}

impl TelemetryPacket {
    pub fn parse(raw: &str) -> Result<Self> {
        let frame: RawTelemetryPacket = serde_json::from_str(raw)?;
        match frame.kind {
            0 => Ok(TelemetryPacket::Rpc(serde_json::from_value(frame.packet)?)),
            1 => Ok(TelemetryPacket::Command(frame.packet)),
            other => Err(RelayError::MalformedInbound(format!(
                "unknown telemetry packet type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(class: &str, method: &str, args: Vec<Value>) -> Event {
        Event::new(class, method, args)
    }

    #[test]
    fn test_table_has_no_duplicate_entries() {
        for (i, a) in RPC_TABLE.iter().enumerate() {
            for b in &RPC_TABLE[i + 1..] {
                assert!(
                    !(a.class == b.class && a.method == b.method),
                    "duplicate entry {}.{}",
                    a.class,
                    a.method
                );
            }
        }
    }

    #[test]
    fn test_outbound_methods_are_not_callable() {
        assert!(lookup_inbound(CLIENT_CLASS, "ping").is_none());
        assert!(lookup_inbound(CLIENT_CLASS, "newToken").is_none());
        assert!(lookup_inbound(CLIENT_CLASS, "subscribe").is_some());
    }

    #[test]
    fn test_decode_subscribe() {
        let decoded = ViewerCall::decode(&call(CLIENT_CLASS, "subscribe", vec![json!("L1")])).unwrap();
        assert_eq!(decoded, ViewerCall::Subscribe { lobby_id: "L1".to_string() });

        let numeric = ViewerCall::decode(&call(CLIENT_CLASS, "subscribe", vec![json!(109775)])).unwrap();
        assert_eq!(numeric, ViewerCall::Subscribe { lobby_id: "109775".to_string() });
    }

    #[test]
    fn test_decode_rejects_bad_arity() {
        let err = ViewerCall::decode(&call(CLIENT_CLASS, "subscribe", vec![])).unwrap_err();
        assert!(matches!(err, RelayError::MalformedInbound(_)));

        let err = ViewerCall::decode(&call(
            APPLICATION_CLASS,
            "requestJoinPrivateLobby",
            vec![json!("L1")],
        ))
        .unwrap_err();
        assert!(matches!(err, RelayError::MalformedInbound(_)));
    }

    #[test]
    fn test_decode_unknown_method() {
        let err = ViewerCall::decode(&call(CLIENT_CLASS, "selfDestruct", vec![])).unwrap_err();
        assert!(matches!(err, RelayError::UnknownTarget { .. }));
    }

    #[test]
    fn test_decode_replay_listing_filter() {
        let decoded = ViewerCall::decode(&call(
            CLIENT_CLASS,
            "requestReplayLobbies",
            vec![json!(null), json!("arena"), json!(""), json!("host"), json!(0), json!(5000)],
        ))
        .unwrap();

        match decoded {
            ViewerCall::RequestReplayLobbies(filter) => {
                assert!(filter.id.is_none());
                assert_eq!(filter.lobby_name, "arena");
                assert_eq!(filter.host_name, "host");
                assert!(filter.after.is_none());
                assert_eq!(filter.before, Some(5000));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_decode_set_scopes() {
        let decoded = ViewerCall::decode(&call(
            CLIENT_CLASS,
            "adminSetUserScopes",
            vec![json!("u1"), json!(["admin", "donor"])],
        ))
        .unwrap();
        assert_eq!(
            decoded,
            ViewerCall::AdminSetUserScopes {
                user_id: "u1".to_string(),
                capabilities: vec![Capability::Admin, Capability::Donor],
            }
        );

        let bad = ViewerCall::decode(&call(
            CLIENT_CLASS,
            "adminSetUserScopes",
            vec![json!("u1"), json!(["wizard"])],
        ));
        assert!(bad.is_err());
    }

    #[test]
    fn test_decode_driver_calls() {
        let create = DriverCall::decode(&call(APPLICATION_CLASS, "CreateLobby", vec![json!("L1")])).unwrap();
        assert_eq!(create, Some(DriverCall::CreateLobby { lobby_id: "L1".to_string() }));

        let sync = DriverCall::decode(&call(
            APPLICATION_CLASS,
            "SyncLobbies",
            vec![json!(["L1", 2])],
        ))
        .unwrap();
        assert_eq!(
            sync,
            Some(DriverCall::SyncLobbies {
                lobby_ids: vec!["L1".to_string(), "2".to_string()]
            })
        );

        let unknown = DriverCall::decode(&call(APPLICATION_CLASS, "Whatever", vec![])).unwrap();
        assert!(unknown.is_none());

        let other_class = DriverCall::decode(&call(LOBBY_CLASS, "CreateLobby", vec![])).unwrap();
        assert!(other_class.is_none());
    }

    #[test]
    fn test_decode_lobby_info() {
        let event = call(
            LOBBY_CLASS,
            "UpdateLobbyInfo",
            vec![
                json!("24/7 BVR Arena"),
                json!("Arena"),
                json!(2),
                json!(16),
                json!(false),
                json!(true),
                json!([{"name": "a"}, {"name": "b"}]),
                json!("host-1"),
                json!("Host"),
            ],
        )
        .with_entity("L1");

        match LobbyCall::decode(&event).unwrap() {
            Some(LobbyCall::UpdateLobbyInfo(info)) => {
                assert_eq!(info.name, "24/7 BVR Arena");
                assert_eq!(info.player_count, 2);
                assert!(info.is_connected);
                assert_eq!(info.players.len(), 2);
            }
            other => panic!("unexpected decode {other:?}"),
        }

        let missing = call(LOBBY_CLASS, "UpdateLobbyInfo", vec![json!("x")]);
        assert!(LobbyCall::decode(&missing).is_err());
    }

    #[test]
    fn test_telemetry_packet_parse() {
        let rpc = TelemetryPacket::parse(
            r#"{"type":0,"packet":{"className":"Client","method":"pong","args":[1]}}"#,
        )
        .unwrap();
        assert!(matches!(rpc, TelemetryPacket::Rpc(ref e) if e.method == "pong"));

        let command = TelemetryPacket::parse(r#"{"type":1,"packet":{"kind":"spawn"}}"#).unwrap();
        assert_eq!(command, TelemetryPacket::Command(json!({"kind": "spawn"})));

        assert!(TelemetryPacket::parse(r#"{"type":7,"packet":null}"#).is_err());
        assert!(TelemetryPacket::parse("not json").is_err());
    }
}
