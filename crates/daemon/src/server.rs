//! WebSocket server wiring the registry and bridges together.
//!
//! Routes, relative to the configured path prefix:
//!
//! | path             | effect                         |
//! |------------------|--------------------------------|
//! | `{prefix}`       | start a new session            |
//! | `{prefix}/{id}`  | attach to an existing session  |
//!
//! `?cols=&rows=` sets the initial size of a new session. Any other path
//! is refused during the handshake with HTTP 404.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::TerminalSize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::{BridgeConfig, SessionBridge, SessionTarget};
use crate::config::Config;
use crate::session::SessionRegistry;

/// How long shutdown waits for open bridges.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Accepts WebSocket connections and runs a bridge for each one.
pub struct BridgeServer {
    listener: TcpListener,
    bridge: SessionBridge,
    path_prefix: Arc<str>,
    reaper_interval: Duration,
    idle_timeout: Duration,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
}

impl BridgeServer {
    /// Binds the listener and builds the registry.
    pub async fn bind(config: &Config) -> Result<Self> {
        let listener = TcpListener::bind(&config.server.bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;

        let shutdown_token = CancellationToken::new();
        let registry = Arc::new(SessionRegistry::new(config.session.max_sessions));
        let bridge = SessionBridge::new(
            registry,
            BridgeConfig::from_config(config),
            shutdown_token.clone(),
        );

        Ok(Self {
            listener,
            bridge,
            path_prefix: Arc::from(config.server.path_prefix.as_str()),
            reaper_interval: Duration::from_secs(config.session.reaper_interval_seconds.max(1)),
            idle_timeout: config.session.idle_timeout(),
            shutdown_token,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.bridge.registry()
    }

    /// Serves connections until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let registry = Arc::clone(self.bridge.registry());
        let reaper = registry.start_reaper_task(
            self.reaper_interval,
            self.idle_timeout,
            self.shutdown_token.clone(),
        );

        tracing::info!(
            address = %self.local_addr()?,
            path_prefix = %self.path_prefix,
            "Listening for terminal connections"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.bridge.clone();
                        let prefix = Arc::clone(&self.path_prefix);
                        self.tracker
                            .spawn(handle_connection(stream, peer, bridge, prefix));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        tracing::info!(bridges = self.tracker.len(), "Shutting down");

        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Bridges did not finish within the shutdown grace period");
        }

        registry.shutdown().await;
        if let Err(e) = reaper.await {
            tracing::warn!(error = %e, "Reaper task failed");
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: SessionBridge,
    path_prefix: Arc<str>,
) {
    let mut target = None;
    let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let uri = request.uri();
        match parse_target(uri.path(), uri.query(), &path_prefix) {
            Some(resolved) => {
                target = Some(resolved);
                Ok(response)
            }
            None => {
                tracing::debug!(peer = %peer, path = %uri.path(), "Rejecting unknown path");
                let mut refusal = ErrorResponse::new(Some("no such terminal endpoint".to_string()));
                *refusal.status_mut() = StatusCode::NOT_FOUND;
                Err(refusal)
            }
        }
    };

    let socket = match accept_hdr_async(stream, route).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let Some(target) = target else {
        return;
    };

    tracing::debug!(peer = %peer, target = ?target, "Connection accepted");
    let outcome = bridge.run(socket, target).await;
    tracing::debug!(peer = %peer, outcome = ?outcome, "Connection finished");
}

/// Maps a request path and query onto a session target.
pub fn parse_target(path: &str, query: Option<&str>, prefix: &str) -> Option<SessionTarget> {
    let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;

    if rest.is_empty() || rest == "/" {
        return Some(SessionTarget::New {
            size: query.and_then(parse_size),
        });
    }

    let id = rest.strip_prefix('/')?.trim_end_matches('/');
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(SessionTarget::Existing(id.to_string()))
}

/// Reads `cols` and `rows` from a query string. Both must be valid.
fn parse_size(query: &str) -> Option<TerminalSize> {
    let mut columns = None;
    let mut rows = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "cols" => columns = value.parse::<u16>().ok(),
            "rows" => rows = value.parse::<u16>().ok(),
            _ => {}
        }
    }

    let size = TerminalSize::new(columns?, rows?);
    size.is_valid().then_some(size)
}
