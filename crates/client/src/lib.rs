//! # TermBridge Client
//!
//! Client side of a TermBridge terminal session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  UiEvent   ┌────────────────┐  frames  ┌───────────┐
//! │    UI    │ ─────────► │ TerminalClient │ ◄──────► │  daemon   │
//! │ (render) │ ◄───────── │  └ Adapter     │    ws    │ (bridge)  │
//! └──────────┘ ClientEvent│    └ Grid      │          └───────────┘
//!                         └────────────────┘
//! ```
//!
//! [`TerminalAdapter`] holds all connection state and never touches a
//! socket, which keeps it testable. [`TerminalClient`] drives it over
//! tokio-tungstenite and adds resize debouncing and optional reconnects.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use terminal_client::{ClientConfig, TerminalClient, UiEvent};
//! use protocol::TerminalSize;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let url = url::Url::parse("ws://127.0.0.1:7681/session")?;
//! let config = ClientConfig::new(url, TerminalSize::new(80, 24));
//!
//! let (ui_tx, ui_rx) = tokio::sync::mpsc::channel(64);
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);
//! let client = tokio::spawn(TerminalClient::new(config).run(ui_rx, events_tx));
//!
//! ui_tx.send(UiEvent::Input("exit\r".into())).await?;
//! while let Some(event) = events_rx.recv().await {
//!     println!("{:?}", event);
//! }
//! let exit_code = client.await??;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod connection;
pub mod debounce;
pub mod error;
pub mod grid;
pub mod keys;
pub mod reconnect;
pub mod status;

pub use adapter::{ClientEvent, Effect, TerminalAdapter};
pub use connection::{session_url, ClientConfig, TerminalClient, UiEvent};
pub use debounce::{ResizeDebouncer, DEFAULT_RESIZE_DEBOUNCE};
pub use error::{ClientError, Result};
pub use grid::{fit, FontMetrics, SurfaceSize, TerminalGrid};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use status::{ConnectionStatus, StatusBanner};
