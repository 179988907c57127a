//! Error types for the terminal client.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors that can occur while running a terminal connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server URL could not be used.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The connection failed after it was established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The UI side stopped listening for events.
    #[error("event channel closed")]
    ChannelClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
