//! Error taxonomy of the relay core.
//!
//! Nothing here is fatal to the process: every variant is either reported back to
//! the session that caused it or logged and absorbed.

use shared::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Permission denied ({0})")]
    PermissionDenied(String),
    #[error("Permission denied, you are not logged in")]
    NotLoggedIn,
    #[error("{kind} {id} not found")]
    UnknownTarget { kind: &'static str, id: String },
    #[error("malformed inbound payload: {0}")]
    MalformedInbound(String),
    #[error("no engine driver connected, dropping {0}")]
    UpstreamUnavailable(String),
    #[error("lobby {0} is already registered")]
    DuplicateRegistration(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RelayError {
    pub fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        RelayError::UnknownTarget { kind, id: id.into() }
    }

    /// Message pushed to a viewer when its call is refused.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::MalformedInbound(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
