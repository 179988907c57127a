//! WebSocket driver for a terminal session.
//!
//! [`TerminalClient::run`] owns the socket. The UI talks to it through two
//! channels: [`UiEvent`]s in, [`ClientEvent`]s out.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{FrameCodec, TerminalSize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

use crate::adapter::{ClientEvent, Effect, TerminalAdapter};
use crate::debounce::{ResizeDebouncer, DEFAULT_RESIZE_DEBOUNCE};
use crate::error::{ClientError, Result};
use crate::grid::{fit, FontMetrics, SurfaceSize};
use crate::reconnect::ReconnectPolicy;

/// Settings for one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint for new sessions, e.g. `ws://127.0.0.1:7681/session`.
    pub url: Url,
    /// Attach to this session instead of starting one.
    pub session_id: Option<String>,
    pub initial_size: TerminalSize,
    pub font: FontMetrics,
    pub reconnect: ReconnectPolicy,
    pub resize_debounce: Duration,
}

impl ClientConfig {
    pub fn new(url: Url, initial_size: TerminalSize) -> Self {
        Self {
            url,
            session_id: None,
            initial_size,
            font: FontMetrics::default(),
            reconnect: ReconnectPolicy::default(),
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Input from the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Encoded keystrokes.
    Input(String),
    /// Pasted text.
    Paste(String),
    /// The rendering surface changed size.
    SurfaceResized(SurfaceSize),
    /// The user wants to leave.
    Close,
}

/// Why a single connection ended.
enum ConnectionEnd {
    UserClosed,
    Dropped,
}

/// Build the URL for a connection attempt.
///
/// Attaching appends `/{id}`; a new session carries its size as
/// `?cols=&rows=`.
pub fn session_url(base: &Url, session_id: Option<&str>, size: TerminalSize) -> Result<Url> {
    if !matches!(base.scheme(), "ws" | "wss") {
        return Err(ClientError::InvalidUrl(format!(
            "unsupported scheme {}",
            base.scheme()
        )));
    }

    let mut url = base.clone();
    url.set_query(None);
    match session_id {
        Some(id) => {
            let path = format!("{}/{}", base.path().trim_end_matches('/'), id);
            url.set_path(&path);
        }
        None => {
            url.query_pairs_mut()
                .append_pair("cols", &size.columns.to_string())
                .append_pair("rows", &size.rows.to_string());
        }
    }
    Ok(url)
}

pub struct TerminalClient {
    config: ClientConfig,
    adapter: TerminalAdapter,
    codec: FrameCodec,
    debouncer: ResizeDebouncer,
}

impl TerminalClient {
    pub fn new(config: ClientConfig) -> Self {
        let adapter = TerminalAdapter::new(config.initial_size);
        let debouncer = ResizeDebouncer::new(config.resize_debounce);
        Self {
            config,
            adapter,
            codec: FrameCodec::new(),
            debouncer,
        }
    }

    pub fn adapter(&self) -> &TerminalAdapter {
        &self.adapter
    }

    /// Run until the user closes, the shell exits, or the connection is
    /// lost for good.
    ///
    /// Returns the shell's exit code if the server reported one.
    pub async fn run(
        mut self,
        mut ui_rx: mpsc::Receiver<UiEvent>,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Result<Option<i32>> {
        let mut backoff = self.config.reconnect.backoff();

        loop {
            let effects = self.adapter.on_connecting();
            emit_all(effects, &events_tx).await?;

            let session_id = self
                .adapter
                .session_id()
                .map(str::to_string)
                .or_else(|| self.config.session_id.clone());
            let url = session_url(&self.config.url, session_id.as_deref(), self.adapter.size())?;

            tracing::debug!(url = %url, "Connecting");
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    match self.drive(socket, &mut ui_rx, &events_tx).await? {
                        ConnectionEnd::UserClosed => return Ok(self.adapter.exit_code()),
                        ConnectionEnd::Dropped => {}
                    }
                    if self.adapter.session_id().is_some() {
                        backoff.reset();
                    }
                }
                Err(e) => {
                    let effects = self.adapter.on_closed(Some(&e.to_string()));
                    emit_all(effects, &events_tx).await?;
                }
            }

            if !self.adapter.can_reconnect() {
                return Ok(self.adapter.exit_code());
            }
            let Some(delay) = backoff.next() else {
                return Ok(self.adapter.exit_code());
            };

            tracing::info!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Reconnecting");
            if !self.wait_before_retry(delay, &mut ui_rx, &events_tx).await? {
                return Ok(self.adapter.exit_code());
            }
        }
    }

    /// Sleep out a backoff delay. Returns false if the user closed meanwhile.
    async fn wait_before_retry(
        &mut self,
        delay: Duration,
        ui_rx: &mut mpsc::Receiver<UiEvent>,
        events_tx: &mpsc::Sender<ClientEvent>,
    ) -> Result<bool> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(true),
                event = ui_rx.recv() => match event {
                    Some(UiEvent::SurfaceResized(surface)) => {
                        let size = fit(surface, self.config.font);
                        let effects = self.adapter.on_resize(size);
                        emit_all(effects, events_tx).await?;
                    }
                    Some(UiEvent::Input(_)) | Some(UiEvent::Paste(_)) => {}
                    Some(UiEvent::Close) | None => return Ok(false),
                },
            }
        }
    }

    async fn drive<S>(
        &mut self,
        socket: WebSocketStream<S>,
        ui_rx: &mut mpsc::Receiver<UiEvent>,
        events_tx: &mpsc::Sender<ClientEvent>,
    ) -> Result<ConnectionEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut stream) = socket.split();

        loop {
            let effects = tokio::select! {
                biased;

                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.adapter.on_text(&text),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!("Dropping binary message");
                        Vec::new()
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let effects = self.adapter.on_closed(None);
                        emit_all(effects, events_tx).await?;
                        return Ok(ConnectionEnd::Dropped);
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        let effects = self.adapter.on_closed(Some(&e.to_string()));
                        emit_all(effects, events_tx).await?;
                        return Ok(ConnectionEnd::Dropped);
                    }
                },

                event = ui_rx.recv() => match event {
                    Some(UiEvent::Input(data)) | Some(UiEvent::Paste(data)) => {
                        self.adapter.on_input(data)
                    }
                    Some(UiEvent::SurfaceResized(surface)) => {
                        self.debouncer.push(fit(surface, self.config.font));
                        Vec::new()
                    }
                    Some(UiEvent::Close) | None => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            tracing::trace!(error = %e, "Close frame not sent");
                        }
                        return Ok(ConnectionEnd::UserClosed);
                    }
                },

                size = self.debouncer.ready() => self.adapter.on_resize(size),
            };

            for effect in effects {
                match effect {
                    Effect::Emit(event) => emit(event, events_tx).await?,
                    Effect::Send(frame) => {
                        let text = self.codec.encode(&frame)?;
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            let effects = self.adapter.on_closed(Some(&e.to_string()));
                            emit_all(effects, events_tx).await?;
                            return Ok(ConnectionEnd::Dropped);
                        }
                    }
                }
            }

            if self.adapter.is_finished() {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    tracing::trace!(error = %e, "Close frame not sent");
                }
                return Ok(ConnectionEnd::Dropped);
            }
        }
    }
}

async fn emit(event: ClientEvent, events_tx: &mpsc::Sender<ClientEvent>) -> Result<()> {
    events_tx
        .send(event)
        .await
        .map_err(|_| ClientError::ChannelClosed)
}

/// Forward the UI events among `effects`. Adapter states reached here never
/// request frames.
async fn emit_all(effects: Vec<Effect>, events_tx: &mpsc::Sender<ClientEvent>) -> Result<()> {
    for effect in effects {
        match effect {
            Effect::Emit(event) => emit(event, events_tx).await?,
            Effect::Send(frame) => {
                tracing::debug!(kind = frame.kind(), "Dropping frame with no connection")
            }
        }
    }
    Ok(())
}
