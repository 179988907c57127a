//! Session management module.
//!
//! This module provides PTY spawning, output routing and the registry of
//! live sessions. A session can be created, attached to by one bridge at a
//! time, resized, and destroyed.

pub mod output;
pub mod pty;
pub mod registry;

pub use output::{OutputRouter, OutputSink, PtyEvent, ReplayBuffer};
pub use pty::{ProcessState, PtyProcess, SessionError, SessionId, SpawnOptions};
pub use registry::{Attachment, Session, SessionInfo, SessionRegistry};
