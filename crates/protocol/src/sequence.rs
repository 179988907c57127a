//! Ordering rules for the server-to-client frame stream.
//!
//! On every connection the server sends `connected` first, exactly once,
//! and `exit` last. The only frame allowed before `connected` is an
//! exit-shaped error frame, which also ends the stream. The daemon runs
//! its outgoing frames through [`ServerFrameSequence`]; the client runs
//! incoming frames through the same type to discard anything after `exit`.

use crate::error::{ProtocolError, Result};
use crate::messages::{Direction, Frame};

/// Position in the server-to-client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Nothing has been sent yet.
    AwaitingConnected,
    /// `connected` was sent; output may flow.
    Open,
    /// `exit` was sent; the stream is over.
    Finished,
}

/// Validator for the server-to-client frame order.
#[derive(Debug, Clone)]
pub struct ServerFrameSequence {
    phase: StreamPhase,
}

impl Default for ServerFrameSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerFrameSequence {
    /// Create a sequence at the start of a connection.
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::AwaitingConnected,
        }
    }

    /// Returns the current phase.
    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Returns true once `exit` has passed through.
    pub fn is_finished(&self) -> bool {
        self.phase == StreamPhase::Finished
    }

    /// Check a frame against the ordering rules and advance the phase.
    ///
    /// A rejected frame leaves the phase unchanged.
    pub fn advance(&mut self, frame: &Frame) -> Result<()> {
        if frame.direction() != Direction::ServerToClient {
            return Err(ProtocolError::OutOfOrder {
                kind: frame.kind(),
                reason: "is not a server frame",
            });
        }

        match (self.phase, frame) {
            (StreamPhase::Finished, _) => Err(ProtocolError::OutOfOrder {
                kind: frame.kind(),
                reason: "after exit",
            }),
            (_, Frame::Exit { .. }) => {
                self.phase = StreamPhase::Finished;
                Ok(())
            }
            (StreamPhase::AwaitingConnected, Frame::Connected { .. }) => {
                self.phase = StreamPhase::Open;
                Ok(())
            }
            (StreamPhase::AwaitingConnected, _) => Err(ProtocolError::OutOfOrder {
                kind: frame.kind(),
                reason: "before connected",
            }),
            (StreamPhase::Open, Frame::Connected { .. }) => Err(ProtocolError::OutOfOrder {
                kind: frame.kind(),
                reason: "sent twice",
            }),
            (StreamPhase::Open, _) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_stream() {
        let mut seq = ServerFrameSequence::new();
        assert_eq!(seq.phase(), StreamPhase::AwaitingConnected);
        seq.advance(&Frame::connected("s1")).unwrap();
        seq.advance(&Frame::output("a")).unwrap();
        seq.advance(&Frame::output("b")).unwrap();
        seq.advance(&Frame::exit(0)).unwrap();
        assert!(seq.is_finished());
    }

    #[test]
    fn test_nothing_after_exit() {
        let mut seq = ServerFrameSequence::new();
        seq.advance(&Frame::connected("s1")).unwrap();
        seq.advance(&Frame::exit(0)).unwrap();
        assert!(matches!(
            seq.advance(&Frame::output("late")),
            Err(ProtocolError::OutOfOrder { reason: "after exit", .. })
        ));
        assert!(seq.advance(&Frame::exit(0)).is_err());
    }

    #[test]
    fn test_output_before_connected_rejected() {
        let mut seq = ServerFrameSequence::new();
        assert!(seq.advance(&Frame::output("early")).is_err());
        assert_eq!(seq.phase(), StreamPhase::AwaitingConnected);
    }

    #[test]
    fn test_error_exit_before_connected_allowed() {
        let mut seq = ServerFrameSequence::new();
        seq.advance(&Frame::session_error("spawn failed")).unwrap();
        assert!(seq.is_finished());
        assert!(seq.advance(&Frame::connected("s1")).is_err());
    }

    #[test]
    fn test_connected_only_once() {
        let mut seq = ServerFrameSequence::new();
        seq.advance(&Frame::connected("s1")).unwrap();
        assert!(matches!(
            seq.advance(&Frame::connected("s1")),
            Err(ProtocolError::OutOfOrder { reason: "sent twice", .. })
        ));
    }

    #[test]
    fn test_client_frames_rejected() {
        let mut seq = ServerFrameSequence::new();
        seq.advance(&Frame::connected("s1")).unwrap();
        assert!(seq.advance(&Frame::input("x")).is_err());
    }
}
