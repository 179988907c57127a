//! Connection state machine for the client side of a terminal session.
//!
//! [`TerminalAdapter`] does no I/O. Each handler returns the [`Effect`]s the
//! driver must carry out: frames to send and events to hand to the UI.

use protocol::{
    Decoded, Frame, FrameCodec, ServerFrameSequence, TerminalSize, SESSION_ERROR_EXIT_CODE,
};

use crate::grid::{TerminalGrid, DEFAULT_SCROLLBACK};
use crate::status::{banner_text, ConnectionStatus};

/// Notification for whoever draws the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Escape sequences to write to the display.
    Render(Vec<u8>),
    /// The connection status changed; `banner` is the text to show, if any.
    StatusChanged {
        status: ConnectionStatus,
        banner: Option<String>,
    },
    /// The server bound this connection to a session.
    SessionAssigned(String),
    /// The shell exited with this code.
    Exited(i32),
}

/// Work requested by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Frame),
    Emit(ClientEvent),
}

pub struct TerminalAdapter {
    codec: FrameCodec,
    sequence: ServerFrameSequence,
    grid: TerminalGrid,
    status: ConnectionStatus,
    session_id: Option<String>,
    size: TerminalSize,
    sent_size: Option<TerminalSize>,
    exit_code: Option<i32>,
    rejected: bool,
    attached_before: bool,
}

impl TerminalAdapter {
    pub fn new(size: TerminalSize) -> Self {
        Self {
            codec: FrameCodec::new(),
            sequence: ServerFrameSequence::new(),
            grid: TerminalGrid::new(size, DEFAULT_SCROLLBACK),
            status: ConnectionStatus::Connecting,
            session_id: None,
            size,
            sent_size: None,
            exit_code: None,
            rejected: false,
            attached_before: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Grid size the adapter wants the remote terminal to have.
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn grid(&self) -> &TerminalGrid {
        &self.grid
    }

    /// Returns true once the server ended the stream with `exit`.
    pub fn is_finished(&self) -> bool {
        self.sequence.is_finished()
    }

    /// Returns true if a new connection could still reach a live session.
    pub fn can_reconnect(&self) -> bool {
        self.exit_code.is_none() && !self.rejected
    }

    /// A new connection attempt is starting.
    pub fn on_connecting(&mut self) -> Vec<Effect> {
        self.sequence = ServerFrameSequence::new();
        self.sent_size = None;
        self.set_status(ConnectionStatus::Connecting)
    }

    /// A text message arrived.
    pub fn on_text(&mut self, text: &str) -> Vec<Effect> {
        match self.codec.decode(text) {
            Ok(Decoded::Frame(frame)) => self.on_frame(frame),
            Ok(Decoded::Unknown(kind)) => {
                tracing::debug!(kind = %kind, "Ignoring unknown frame kind");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed frame");
                Vec::new()
            }
        }
    }

    /// A decoded frame arrived.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<Effect> {
        if let Err(e) = self.sequence.advance(&frame) {
            tracing::debug!(error = %e, "Ignoring frame");
            return Vec::new();
        }

        match frame {
            Frame::Connected { session_id } => {
                if self.attached_before {
                    // The server replays recent output after this
                    self.grid.reset();
                }
                self.attached_before = true;

                tracing::info!(session_id = %session_id, "Attached to session");
                self.session_id = Some(session_id.clone());

                let mut effects = vec![Effect::Emit(ClientEvent::SessionAssigned(session_id))];
                effects.extend(self.set_status(ConnectionStatus::Connected));
                effects.extend(self.send_size());
                effects
            }
            Frame::Output { data } => {
                self.grid.feed(&data);
                vec![Effect::Emit(ClientEvent::Render(self.grid.render_diff()))]
            }
            Frame::Exit {
                exit_code,
                reason: Some(reason),
            } if exit_code == SESSION_ERROR_EXIT_CODE => {
                tracing::warn!(reason = %reason, "Server refused the session");
                self.rejected = true;
                self.set_status(ConnectionStatus::Errored)
            }
            Frame::Exit { exit_code, .. } => {
                tracing::info!(exit_code, "Terminal session ended");
                self.exit_code = Some(exit_code);
                let mut effects = vec![Effect::Emit(ClientEvent::Exited(exit_code))];
                effects.extend(self.set_status(ConnectionStatus::Disconnected));
                effects
            }
            Frame::Input { .. } | Frame::Resize { .. } => Vec::new(),
        }
    }

    /// Keystrokes or pasted text from the user.
    pub fn on_input(&mut self, data: String) -> Vec<Effect> {
        if self.status != ConnectionStatus::Connected || data.is_empty() {
            return Vec::new();
        }
        vec![Effect::Send(Frame::input(data))]
    }

    /// The settled grid size after a surface resize.
    pub fn on_resize(&mut self, size: TerminalSize) -> Vec<Effect> {
        if !size.is_valid() {
            return Vec::new();
        }
        self.size = size;

        let mut effects = Vec::new();
        if self.grid.resize(size) {
            effects.push(Effect::Emit(ClientEvent::Render(self.grid.full_render())));
        }
        if self.status == ConnectionStatus::Connected {
            effects.extend(self.send_size());
        }
        effects
    }

    /// The socket closed, with an error description if it failed.
    pub fn on_closed(&mut self, error: Option<&str>) -> Vec<Effect> {
        if self.exit_code.is_some() || self.rejected {
            return Vec::new();
        }

        match error {
            Some(e) => {
                tracing::warn!(error = %e, "Connection failed");
                self.set_status(ConnectionStatus::Errored)
            }
            None => {
                tracing::info!("Connection closed");
                self.set_status(ConnectionStatus::Disconnected)
            }
        }
    }

    fn send_size(&mut self) -> Vec<Effect> {
        if self.sent_size == Some(self.size) {
            return Vec::new();
        }
        self.sent_size = Some(self.size);
        vec![Effect::Send(Frame::resize(self.size))]
    }

    fn set_status(&mut self, status: ConnectionStatus) -> Vec<Effect> {
        self.status = status;
        vec![Effect::Emit(ClientEvent::StatusChanged {
            status,
            banner: banner_text(status, self.exit_code),
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(adapter: &mut TerminalAdapter) {
        adapter.on_connecting();
        adapter.on_frame(Frame::connected("s1"));
    }

    fn sent(effects: &[Effect]) -> Vec<&Frame> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(frame) => Some(frame),
                Effect::Emit(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_connected_announces_size() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(100, 30));
        let effects = adapter.on_connecting();
        assert_eq!(
            effects,
            vec![Effect::Emit(ClientEvent::StatusChanged {
                status: ConnectionStatus::Connecting,
                banner: Some("Connecting…".to_string()),
            })]
        );

        let effects = adapter.on_text(r#"{"kind":"connected","sessionId":"abc"}"#);
        assert_eq!(adapter.status(), ConnectionStatus::Connected);
        assert_eq!(adapter.session_id(), Some("abc"));
        assert!(effects.contains(&Effect::Emit(ClientEvent::SessionAssigned("abc".into()))));
        assert_eq!(sent(&effects), vec![&Frame::resize(TerminalSize::new(100, 30))]);
    }

    #[test]
    fn test_input_only_while_connected() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        adapter.on_connecting();
        assert!(adapter.on_input("ls\n".into()).is_empty());

        adapter.on_frame(Frame::connected("s1"));
        assert_eq!(
            adapter.on_input("ls\n".into()),
            vec![Effect::Send(Frame::input("ls\n"))]
        );

        adapter.on_frame(Frame::exit(0));
        assert!(adapter.on_input("ls\n".into()).is_empty());
    }

    #[test]
    fn test_output_renders() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(20, 5));
        connected(&mut adapter);
        let effects = adapter.on_frame(Frame::output("hi"));
        assert!(matches!(effects.as_slice(), [Effect::Emit(ClientEvent::Render(_))]));
        assert!(adapter.grid().contents().starts_with("hi"));
    }

    #[test]
    fn test_identical_sizes_not_resent() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        connected(&mut adapter);

        assert!(sent(&adapter.on_resize(TerminalSize::new(80, 24))).is_empty());

        let effects = adapter.on_resize(TerminalSize::new(120, 40));
        assert_eq!(sent(&effects), vec![&Frame::resize(TerminalSize::new(120, 40))]);
        assert!(sent(&adapter.on_resize(TerminalSize::new(120, 40))).is_empty());
    }

    #[test]
    fn test_resize_while_connecting_sent_on_connect() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        adapter.on_connecting();
        assert!(sent(&adapter.on_resize(TerminalSize::new(90, 20))).is_empty());

        let effects = adapter.on_frame(Frame::connected("s1"));
        assert_eq!(sent(&effects), vec![&Frame::resize(TerminalSize::new(90, 20))]);
    }

    #[test]
    fn test_exit_banner_and_finality() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        connected(&mut adapter);

        let effects = adapter.on_frame(Frame::exit(2));
        assert!(effects.contains(&Effect::Emit(ClientEvent::Exited(2))));
        assert!(effects.contains(&Effect::Emit(ClientEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            banner: Some("Terminal session ended (exit code: 2)".to_string()),
        })));
        assert!(adapter.is_finished());
        assert!(!adapter.can_reconnect());

        assert!(adapter.on_frame(Frame::output("late")).is_empty());
        assert!(adapter.on_closed(None).is_empty());
        assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_session_error_frame() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        adapter.on_connecting();
        let effects = adapter.on_frame(Frame::session_error("session not found: x"));
        assert_eq!(
            effects,
            vec![Effect::Emit(ClientEvent::StatusChanged {
                status: ConnectionStatus::Errored,
                banner: Some("Connection error!".to_string()),
            })]
        );
        assert_eq!(adapter.exit_code(), None);
        assert!(!adapter.can_reconnect());
    }

    #[test]
    fn test_close_without_exit() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        connected(&mut adapter);
        let effects = adapter.on_closed(None);
        assert_eq!(
            effects,
            vec![Effect::Emit(ClientEvent::StatusChanged {
                status: ConnectionStatus::Disconnected,
                banner: Some("Connection closed. Refresh to reconnect.".to_string()),
            })]
        );
        assert!(adapter.can_reconnect());

        adapter.on_connecting();
        adapter.on_closed(Some("connection refused"));
        assert_eq!(adapter.status(), ConnectionStatus::Errored);
    }

    #[test]
    fn test_garbage_ignored() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(80, 24));
        connected(&mut adapter);
        assert!(adapter.on_text("not json").is_empty());
        assert!(adapter.on_text(r#"{"kind":"ping"}"#).is_empty());
        assert!(adapter.on_text(r#"{"kind":"connected","sessionId":"again"}"#).is_empty());
        assert_eq!(adapter.session_id(), Some("s1"));
        assert_eq!(adapter.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_reattach_resets_grid() {
        let mut adapter = TerminalAdapter::new(TerminalSize::new(20, 5));
        connected(&mut adapter);
        adapter.on_frame(Frame::output("old screen"));
        adapter.on_closed(None);

        adapter.on_connecting();
        adapter.on_frame(Frame::connected("s1"));
        assert_eq!(adapter.grid().contents().trim(), "");
        adapter.on_frame(Frame::output("replayed"));
        assert!(adapter.grid().contents().starts_with("replayed"));
    }
}
