//! Frame definitions for TermBridge.
//!
//! Every message on a terminal connection is one JSON object tagged by
//! `kind`. Both directions use the same envelope shape; which kinds are
//! valid depends on the direction (see [`Direction`]).

use serde::{Deserialize, Serialize};

/// Exit code carried by an exit-shaped error frame when a session could
/// not be created or attached.
pub const SESSION_ERROR_EXIT_CODE: i32 = -1;

/// Default terminal width in columns.
pub const DEFAULT_COLUMNS: u16 = 80;

/// Default terminal height in rows.
pub const DEFAULT_ROWS: u16 = 24;

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by the client, consumed by the server.
    ClientToServer,
    /// Sent by the server, consumed by the client.
    ServerToClient,
}

/// A single message on a terminal connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Raw keystroke or paste data destined for the shell.
    Input {
        /// Input text.
        data: String,
    },
    /// Raw process output destined for the renderer.
    Output {
        /// Output text.
        data: String,
    },
    /// New terminal grid size requested by the client.
    Resize {
        /// Terminal width in columns.
        columns: u16,
        /// Terminal height in rows.
        rows: u16,
    },
    /// First frame on every successfully attached connection.
    Connected {
        /// Identifier of the session this connection is bound to.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Last frame on every connection.
    Exit {
        /// Raw exit status of the shell, or [`SESSION_ERROR_EXIT_CODE`].
        #[serde(rename = "exitCode")]
        exit_code: i32,
        /// Human-readable cause for error-shaped exits.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Frame {
    /// Creates an input frame.
    pub fn input(data: impl Into<String>) -> Self {
        Frame::Input { data: data.into() }
    }

    /// Creates an output frame.
    pub fn output(data: impl Into<String>) -> Self {
        Frame::Output { data: data.into() }
    }

    /// Creates a resize frame from a terminal size.
    pub fn resize(size: TerminalSize) -> Self {
        Frame::Resize {
            columns: size.columns,
            rows: size.rows,
        }
    }

    /// Creates a connected frame.
    pub fn connected(session_id: impl Into<String>) -> Self {
        Frame::Connected {
            session_id: session_id.into(),
        }
    }

    /// Creates an exit frame for a process that terminated.
    pub fn exit(exit_code: i32) -> Self {
        Frame::Exit {
            exit_code,
            reason: None,
        }
    }

    /// Creates an exit-shaped error frame.
    pub fn session_error(reason: impl Into<String>) -> Self {
        Frame::Exit {
            exit_code: SESSION_ERROR_EXIT_CODE,
            reason: Some(reason.into()),
        }
    }

    /// Returns the wire name of this frame's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Input { .. } => "input",
            Frame::Output { .. } => "output",
            Frame::Resize { .. } => "resize",
            Frame::Connected { .. } => "connected",
            Frame::Exit { .. } => "exit",
        }
    }

    /// Returns the direction this frame kind travels in.
    pub fn direction(&self) -> Direction {
        match self {
            Frame::Input { .. } | Frame::Resize { .. } => Direction::ClientToServer,
            Frame::Output { .. } | Frame::Connected { .. } | Frame::Exit { .. } => {
                Direction::ServerToClient
            }
        }
    }
}

/// Result of decoding one text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A frame of a known kind.
    Frame(Frame),
    /// A well-formed object whose `kind` this version does not know.
    Unknown(String),
}

/// Terminal grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Width in columns.
    pub columns: u16,
    /// Height in rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Creates a new terminal size.
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }

    /// Returns true if both dimensions are non-zero.
    pub fn is_valid(&self) -> bool {
        self.columns > 0 && self.rows > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLUMNS, DEFAULT_ROWS)
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.columns, self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_wire_shape() {
        let json = serde_json::to_value(Frame::input("ls\r")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "input", "data": "ls\r"}));
    }

    #[test]
    fn test_resize_wire_shape() {
        let json = serde_json::to_value(Frame::resize(TerminalSize::new(100, 30))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "resize", "columns": 100, "rows": 30})
        );
    }

    #[test]
    fn test_connected_uses_camel_case_session_id() {
        let json = serde_json::to_value(Frame::connected("abc")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "connected", "sessionId": "abc"})
        );
    }

    #[test]
    fn test_exit_omits_reason_when_absent() {
        let json = serde_json::to_value(Frame::exit(0)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "exit", "exitCode": 0}));
    }

    #[test]
    fn test_session_error_frame() {
        let frame = Frame::session_error("failed to spawn PTY: not found");
        match frame {
            Frame::Exit { exit_code, reason } => {
                assert_eq!(exit_code, SESSION_ERROR_EXIT_CODE);
                assert_eq!(reason.as_deref(), Some("failed to spawn PTY: not found"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_kind_and_direction() {
        assert_eq!(Frame::input("x").direction(), Direction::ClientToServer);
        assert_eq!(
            Frame::resize(TerminalSize::default()).direction(),
            Direction::ClientToServer
        );
        assert_eq!(Frame::output("x").direction(), Direction::ServerToClient);
        assert_eq!(Frame::connected("s").kind(), "connected");
        assert_eq!(Frame::exit(3).kind(), "exit");
    }

    #[test]
    fn test_terminal_size_default_and_validity() {
        let size = TerminalSize::default();
        assert_eq!(size, TerminalSize::new(80, 24));
        assert!(size.is_valid());
        assert!(!TerminalSize::new(0, 24).is_valid());
        assert!(!TerminalSize::new(80, 0).is_valid());
        assert_eq!(size.to_string(), "80x24");
    }
}
