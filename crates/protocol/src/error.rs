//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a frame (malformed JSON, missing fields, wrong types).
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Frame errors
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame violated the per-connection ordering rules.
    #[error("out-of-order frame: {kind} {reason}")]
    OutOfOrder {
        /// Kind of the rejected frame.
        kind: &'static str,
        /// Which rule was broken.
        reason: &'static str,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true for errors caused by a single bad incoming frame.
    ///
    /// These are dropped and logged by receivers; they never end a connection.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Deserialization(_)
                | ProtocolError::FrameTooLarge { .. }
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
