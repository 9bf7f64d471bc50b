//! # Lobby Relay Library
//!
//! This library provides the real-time relay that sits between one authoritative
//! engine driver and many web viewers. The driver streams RPC events for every live
//! lobby; the relay keeps a compact resync set per lobby, batches events per tick,
//! and fans the batches out to the viewers subscribed to each lobby.
//!
//! ## Core Responsibilities
//!
//! ### Event Routing
//! Inbound driver events are classified once at ingress. Lobby-scoped events go to
//! their lobby session; lobby-less events feed the global pool and, for the
//! `Application` and `VTOLLobby` classes, drive lobby registration and lobby
//! state transitions.
//!
//! ### Lobby Lifecycle
//! Each lobby session tracks whether the driver is connected to it, asks the driver
//! to leave once nobody has been watching for a while, and keeps re-joining lobbies
//! that are recorded continuously.
//!
//! ### Viewer Sessions
//! Viewers log in with a token, subscribe to one lobby at a time, browse recordings
//! and, with the right capabilities, use admin calls. Every inbound call is checked
//! against a static permission table before it runs.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Router
//! All lobby and session state is owned by the [`router::Router`] and mutated from
//! one task. Socket tasks and background lookups only post messages, so there are
//! no locks around session state and handlers never interleave.
//!
//! ### WebSocket Transport
//! [`network::Server`] accepts WebSocket connections, gives each one an outbound
//! channel drained by a writer task, and drives the router's network tick and
//! heartbeat timers.
//!
//! ## Module Organization
//!
//! - `config`: command line options and the runtime [`config::RelayConfig`]
//! - `error`: the [`error::RelayError`] taxonomy
//! - `rpc`: the permission table and typed decoding of inbound calls
//! - `permissions`: the gate in front of every viewer call
//! - `bridge`: outbound commands to the engine driver
//! - `client_manager`: per-connection sessions and their registry
//! - `lobby`: per-lobby state machine, resync set and event pools
//! - `router`: the owner of everything above
//! - `services`: auth, user directory, recordings and recorder collaborators
//! - `network`: sockets and timers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::RelayConfig;
//! use server::network::Server;
//! use server::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig {
//!         driver_secret: "change-me".to_string(),
//!         ..RelayConfig::default()
//!     };
//!
//!     // Binds the listener; the router starts once `run` is awaited
//!     let server = Server::bind(config, Services::in_memory()).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod lobby;
pub mod network;
pub mod permissions;
pub mod router;
pub mod rpc;
pub mod services;
pub mod utils;
