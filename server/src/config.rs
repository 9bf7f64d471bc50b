//! Command line and environment configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments, each with an environment fallback.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Address to bind the WebSocket listener to
    #[clap(short = 'H', long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    pub host: String,
    /// Port to listen on
    #[clap(short, long, env = "RELAY_PORT", default_value = "8080")]
    pub port: u16,
    /// Shared secret the engine driver sends as its first message
    #[clap(long, env = "HC_PASSWORD")]
    pub driver_secret: String,
    /// Network tick rate (updates per second)
    #[clap(short, long, default_value = "60", value_parser = clap::value_parser!(u32).range(1..))]
    pub tick_rate: u32,
    /// Interval between heartbeat pings, in milliseconds
    #[clap(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_ms: u64,
    /// Time a connected lobby may go unobserved before the driver leaves it
    #[clap(long, default_value = "5000")]
    pub inactivity_timeout_ms: u64,
    /// Minimum gap between continuous-record join attempts
    #[clap(long, default_value = "60000")]
    pub record_retry_ms: u64,
    /// Lobby-name substring marking an always-on public broadcast lobby
    #[clap(long, default_value = "24/7 BVR")]
    pub always_on_pattern: String,
    /// Players required before the always-on heuristic applies
    #[clap(long, default_value = "2")]
    pub always_on_min_players: u32,
    /// Workshop ids that are always recorded, as `id` or `id:secret`
    #[clap(long = "record-workshop", value_parser = parse_workshop_rule)]
    pub record_workshops: Vec<WorkshopRule>,
    /// Join secret stored when the telemetry client enables recording
    #[clap(long, env = "TELEMETRY_RECORD_SECRET")]
    pub telemetry_record_secret: Option<String>,
    /// Development mode: never auto-record from the name heuristic
    #[clap(long, env = "IS_DEV")]
    pub dev: bool,
    /// Reissue login tokens that expire within this many days
    #[clap(long, default_value = "4")]
    pub token_refresh_days: u64,
    /// JSON file seeding the in-memory user directory
    #[clap(long, env = "RELAY_USERS_FILE")]
    pub users_file: Option<PathBuf>,
}

/// A workshop id that forces continuous recording, with an optional join secret.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkshopRule {
    pub workshop_id: String,
    pub secret: Option<String>,
}

fn parse_workshop_rule(raw: &str) -> Result<WorkshopRule, String> {
    let (id, secret) = match raw.split_once(':') {
        Some((id, secret)) => (id.trim(), Some(secret.to_string())),
        None => (raw.trim(), None),
    };
    if id.is_empty() {
        return Err(format!("invalid workshop rule '{raw}': empty workshop id"));
    }
    Ok(WorkshopRule {
        workshop_id: id.to_string(),
        secret: secret.filter(|s| !s.is_empty()),
    })
}

/// When a lobby switches itself into continuous recording.
#[derive(Debug, Clone)]
pub struct RecordPolicy {
    pub always_on_pattern: String,
    pub always_on_min_players: u32,
    /// Whether matching the always-on heuristic also enables recording.
    pub record_always_on: bool,
    pub workshop_rules: Vec<WorkshopRule>,
    pub telemetry_secret: Option<String>,
}

impl RecordPolicy {
    pub fn is_always_on(&self, lobby_name: &str, player_count: u32) -> bool {
        !self.always_on_pattern.is_empty()
            && lobby_name.contains(&self.always_on_pattern)
            && player_count >= self.always_on_min_players
    }

    pub fn workshop_rule(&self, workshop_id: &str) -> Option<&WorkshopRule> {
        self.workshop_rules
            .iter()
            .find(|rule| rule.workshop_id == workshop_id)
    }
}

impl Default for RecordPolicy {
    fn default() -> Self {
        Self {
            always_on_pattern: "24/7 BVR".to_string(),
            always_on_min_players: 2,
            record_always_on: true,
            workshop_rules: Vec::new(),
            telemetry_secret: None,
        }
    }
}

/// Runtime settings of the relay core.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub driver_secret: String,
    pub tick_rate: u32,
    pub heartbeat: Duration,
    pub inactivity_timeout: Duration,
    pub record_retry: Duration,
    pub token_refresh_window: Duration,
    pub record_policy: RecordPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            driver_secret: String::new(),
            tick_rate: 60,
            heartbeat: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(5),
            record_retry: Duration::from_secs(60),
            token_refresh_window: Duration::from_secs(4 * 24 * 60 * 60),
            record_policy: RecordPolicy::default(),
        }
    }
}

impl From<&Config> for RelayConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: format!("{}:{}", config.host, config.port),
            driver_secret: config.driver_secret.clone(),
            tick_rate: config.tick_rate,
            heartbeat: Duration::from_millis(config.heartbeat_ms),
            inactivity_timeout: Duration::from_millis(config.inactivity_timeout_ms),
            record_retry: Duration::from_millis(config.record_retry_ms),
            token_refresh_window: Duration::from_secs(config.token_refresh_days * 24 * 60 * 60),
            record_policy: RecordPolicy {
                always_on_pattern: config.always_on_pattern.clone(),
                always_on_min_players: config.always_on_min_players,
                record_always_on: !config.dev,
                workshop_rules: config.record_workshops.clone(),
                telemetry_secret: config.telemetry_record_secret.clone(),
            },
        }
    }
}
