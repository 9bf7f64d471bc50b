//! Translates relay intents into commands for the engine driver.

use crate::client_manager::{ClientRegistry, Outbound};
use crate::error::{RelayError, Result};
use log::{error, info};
use shared::Command;

/// Stateless command translator and fan-out to the registered driver sessions.
///
/// Commands are fire-and-forget: with no driver connected they are logged and
/// dropped, never queued.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandBridge;

impl CommandBridge {
    pub fn join_lobby(lobby_id: &str, password: Option<&str>) -> Command {
        match password {
            Some(password) => Command::JoinLobbyWithPassword {
                lobby_id: lobby_id.to_string(),
                password: password.to_string(),
            },
            None => Command::JoinLobby {
                lobby_id: lobby_id.to_string(),
            },
        }
    }

    pub fn leave_lobby(lobby_id: &str) -> Command {
        Command::LeaveLobby {
            lobby_id: lobby_id.to_string(),
        }
    }

    pub fn set_replay_id(lobby_id: &str, replay_id: &str) -> Command {
        Command::SetReplayId {
            lobby_id: lobby_id.to_string(),
            replay_id: replay_id.to_string(),
        }
    }

    /// Sends a command to every driver session. Returns how many received it.
    pub fn deliver(&self, clients: &ClientRegistry, command: Command) -> Result<usize> {
        let text = serde_json::to_string(&command)
            .map_err(|e| RelayError::MalformedInbound(e.to_string()))?;

        let delivered = clients
            .drivers()
            .filter(|driver| driver.outbox().push(Outbound::Text(text.clone())))
            .count();

        if delivered == 0 {
            let err = RelayError::UpstreamUnavailable(text);
            error!("{}", err);
            return Err(err);
        }

        info!("Sent {} to {} driver session(s)", text, delivered);
        Ok(delivered)
    }

    /// Delivers and absorbs the error; the failure has already been logged.
    pub fn send(&self, clients: &ClientRegistry, command: Command) {
        let _ = self.deliver(clients, command);
    }
}
