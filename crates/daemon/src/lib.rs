//! # TermBridge Daemon Library
//!
//! This crate serves interactive shell sessions over WebSocket.
//!
//! ## Overview
//!
//! Each connection gets a bridge that pumps one shell session both ways.
//! The daemon provides:
//!
//! - **PTY Processes**: Spawn shells on pseudo-terminals with threaded I/O
//! - **Session Registry**: Track live sessions, enforce one bridge per session
//! - **Session Bridge**: Translate between frames and process I/O
//! - **WebSocket Server**: Route handshakes to new or existing sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      BridgeServer                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  WebSocket ──▶ SessionBridge ──▶ Attachment ──▶ Session  │
//! │                     ▲                             │      │
//! │                     └──── PtyEvent (mpsc) ◀── PtyProcess │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │        SessionRegistry (RwLock<HashMap>)           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{BridgeServer, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let server = BridgeServer::bind(&config).await?;
//!     let shutdown = server.shutdown_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!
//!     server.run().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, output routing and the session registry
//! - [`bridge`]: Per-connection session bridge
//! - [`server`]: WebSocket accept loop and routing

pub mod bridge;
pub mod config;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{AttachPolicy, Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    Attachment, ProcessState, PtyEvent, PtyProcess, Session, SessionError, SessionId,
    SessionInfo, SessionRegistry, SpawnOptions,
};

// Re-export bridge types for convenience
pub use bridge::{
    BridgeConfig, BridgeError, BridgeOutcome, BridgeState, CloseReason, SessionBridge,
    SessionTarget,
};

// Re-export server types for convenience
pub use server::{parse_target, BridgeServer};
