//! Session bridge.
//!
//! One bridge runs per WebSocket connection and pumps a session both ways:
//!
//! ```text
//! Attaching ──connected──▶ Active ──close/exit/error──▶ Closing
//! ```
//!
//! - **Attaching**: create or look up the session and take the attachment.
//!   Failures are reported with an exit-shaped error frame.
//! - **Active**: `input` frames go to the process, `resize` frames resize
//!   the pty, process output goes out as `output` frames as it arrives.
//! - **Closing**: detach, send `exit` if the process ended, destroy the
//!   session unless it is kept alive for reattachment, close the socket.

use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{
    Decoded, Frame, FrameCodec, ProtocolError, ServerFrameSequence, TerminalSize,
    Utf8StreamDecoder,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use crate::config::{AttachPolicy, Config};
use crate::session::{
    Attachment, PtyEvent, Session, SessionError, SessionId, SessionRegistry, SpawnOptions,
};

/// Capacity of the channel between a pty and its bridge.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Largest slice of replay output sent in one frame.
const REPLAY_CHUNK_SIZE: usize = 16 * 1024;

/// Errors that end a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The socket failed or was closed under us.
    #[error("transport error: {0}")]
    Transport(String),

    /// An outgoing frame could not be produced.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<WsError> for BridgeError {
    fn from(err: WsError) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

/// Which session a connection wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// Start a new shell, optionally at a given size.
    New { size: Option<TerminalSize> },
    /// Attach to an existing session.
    Existing(SessionId),
}

/// Lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Attaching,
    Active,
    Closing,
}

/// Why a bridge closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The shell exited.
    ProcessExited,
    /// The client closed the socket.
    ClientClosed,
    /// The socket failed.
    Transport(String),
    /// The process did not accept input in time.
    Backpressure,
    /// Too many consecutive per-message failures.
    TooManyFailures,
    /// Another bridge took the session over.
    TakenOver,
    /// The server is shutting down.
    Shutdown,
    /// The session could not be created or attached.
    AttachFailed(String),
}

/// Summary of a finished bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutcome {
    /// Session the bridge was attached to, if it got that far.
    pub session_id: Option<SessionId>,
    /// Why the bridge closed.
    pub reason: CloseReason,
    /// Exit code sent to the client, if any.
    pub exit_code: Option<i32>,
}

/// Settings shared by every bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Template for new sessions.
    pub spawn: SpawnOptions,
    /// What to do when a session already has a bridge.
    pub attach_policy: AttachPolicy,
    /// Leave sessions running when their bridge goes away.
    pub keep_alive_on_disconnect: bool,
    /// Consecutive per-message failures before the bridge closes.
    pub max_consecutive_failures: u32,
    /// Largest accepted incoming frame.
    pub max_frame_bytes: usize,
}

impl BridgeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            spawn: SpawnOptions::from_config(&config.session),
            attach_policy: config.session.attach_policy,
            keep_alive_on_disconnect: config.session.keep_alive_on_disconnect,
            max_consecutive_failures: config.session.max_consecutive_failures,
            max_frame_bytes: config.server.max_frame_bytes,
        }
    }
}

/// Outgoing half of a connection, enforcing frame order.
struct FrameWriter<K> {
    sink: K,
    codec: FrameCodec,
    sequence: ServerFrameSequence,
}

impl<K> FrameWriter<K>
where
    K: Sink<WsMessage, Error = WsError> + Unpin,
{
    fn new(sink: K, codec: FrameCodec) -> Self {
        Self {
            sink,
            codec,
            sequence: ServerFrameSequence::new(),
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), BridgeError> {
        self.sequence.advance(&frame)?;
        let text = self.codec.encode(&frame)?;
        self.sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Sends decoded output, skipping empty payloads.
    async fn send_output(&mut self, text: String) -> Result<(), BridgeError> {
        if text.is_empty() {
            return Ok(());
        }
        self.send(Frame::output(text)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.send(WsMessage::Close(None)).await {
            tracing::trace!(error = %e, "Close frame not sent");
        }
        if let Err(e) = self.sink.close().await {
            tracing::trace!(error = %e, "Socket already closed");
        }
    }
}

/// Result of handling one client message.
enum Step {
    Continue,
    Close(CloseReason),
}

/// Bridges WebSocket connections to sessions.
#[derive(Clone)]
pub struct SessionBridge {
    registry: Arc<SessionRegistry>,
    config: Arc<BridgeConfig>,
    shutdown: CancellationToken,
}

impl SessionBridge {
    pub fn new(
        registry: Arc<SessionRegistry>,
        config: BridgeConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Runs one connection to completion.
    pub async fn run<S>(&self, socket: S, target: SessionTarget) -> BridgeOutcome
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
    {
        let (sink, mut stream) = socket.split();
        let codec = FrameCodec::with_max_frame_size(self.config.max_frame_bytes);
        let mut writer = FrameWriter::new(sink, codec.clone());

        tracing::debug!(state = ?BridgeState::Attaching, target = ?target, "Bridge starting");

        let (event_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (attachment, replay) = match self.attach(&target, event_tx).await {
            Ok(attached) => attached,
            Err(e) => {
                tracing::warn!(target = ?target, error = %e, "Failed to attach bridge");
                if let Err(send_err) = writer.send(Frame::session_error(e.to_string())).await {
                    tracing::debug!(error = %send_err, "Error frame not sent");
                }
                writer.close().await;
                return BridgeOutcome {
                    session_id: None,
                    reason: CloseReason::AttachFailed(e.to_string()),
                    exit_code: None,
                };
            }
        };

        let session = Arc::clone(attachment.session());
        let session_id = session.id().clone();
        let mut decoder = Utf8StreamDecoder::new();
        let mut exit_code = None;

        let reason = match self
            .start(&mut writer, &session_id, &replay, &mut decoder)
            .await
        {
            Err(e) => CloseReason::Transport(e.to_string()),
            Ok(()) => {
                tracing::debug!(session_id = %session_id, state = ?BridgeState::Active, "Bridge active");
                self.pump(
                    &attachment,
                    &mut writer,
                    &mut stream,
                    &mut events,
                    &mut decoder,
                    &codec,
                    &mut exit_code,
                )
                .await
            }
        };

        tracing::debug!(
            session_id = %session_id,
            state = ?BridgeState::Closing,
            reason = ?reason,
            "Bridge closing"
        );

        // Unregisters the sink before anything else
        drop(attachment);

        let mut sent_exit = None;
        if let Some(code) = exit_code {
            let tail = decoder.finish();
            let result = match writer.send_output(tail).await {
                Ok(()) => writer.send(Frame::exit(code)).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => sent_exit = Some(code),
                Err(e) => tracing::debug!(session_id = %session_id, error = %e, "Exit frame not sent"),
            }
        }

        let alive = session.process().is_running();
        if should_destroy(&reason, alive, self.config.keep_alive_on_disconnect) {
            self.registry.destroy(&session_id).await;
        } else if alive {
            tracing::info!(session_id = %session_id, "Session left running for reattachment");
        }

        writer.close().await;

        tracing::info!(
            session_id = %session_id,
            reason = ?reason,
            exit_code = ?sent_exit,
            "Bridge closed"
        );

        BridgeOutcome {
            session_id: Some(session_id),
            reason,
            exit_code: sent_exit,
        }
    }

    /// Resolves the target and takes the attachment.
    async fn attach(
        &self,
        target: &SessionTarget,
        sink: crate::session::OutputSink,
    ) -> Result<(Attachment, Vec<u8>), SessionError> {
        match target {
            SessionTarget::New { size } => {
                let mut options = self.config.spawn.clone();
                if let Some(size) = size {
                    options = options.with_size(*size);
                }
                let session = self.registry.create_session(options).await?;
                match session.attach(self.config.attach_policy, sink).await {
                    Ok(attached) => Ok(attached),
                    Err(e) => {
                        self.registry.destroy(session.id()).await;
                        Err(e)
                    }
                }
            }
            SessionTarget::Existing(id) => {
                let session: Arc<Session> = self.registry.get(id).await?;
                session.attach(self.config.attach_policy, sink).await
            }
        }
    }

    /// Sends `connected` and any replayed output.
    async fn start<K>(
        &self,
        writer: &mut FrameWriter<K>,
        session_id: &SessionId,
        replay: &[u8],
        decoder: &mut Utf8StreamDecoder,
    ) -> Result<(), BridgeError>
    where
        K: Sink<WsMessage, Error = WsError> + Unpin,
    {
        writer.send(Frame::connected(session_id.clone())).await?;

        for chunk in replay.chunks(REPLAY_CHUNK_SIZE) {
            writer.send_output(decoder.decode(chunk)).await?;
        }
        if !replay.is_empty() {
            tracing::debug!(session_id = %session_id, bytes = replay.len(), "Replayed output");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump<K, R>(
        &self,
        attachment: &Attachment,
        writer: &mut FrameWriter<K>,
        stream: &mut R,
        events: &mut mpsc::Receiver<PtyEvent>,
        decoder: &mut Utf8StreamDecoder,
        codec: &FrameCodec,
        exit_code: &mut Option<i32>,
    ) -> CloseReason
    where
        K: Sink<WsMessage, Error = WsError> + Unpin,
        R: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let session_id = attachment.session().id();
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return CloseReason::Shutdown,

                _ = attachment.taken_over() => return CloseReason::TakenOver,

                event = events.recv() => match event {
                    Some(PtyEvent::Output(bytes)) => {
                        if let Err(e) = writer.send_output(decoder.decode(&bytes)).await {
                            return CloseReason::Transport(e.to_string());
                        }
                    }
                    Some(PtyEvent::Exited(code)) => {
                        *exit_code = Some(code);
                        return CloseReason::ProcessExited;
                    }
                    None => {
                        // The attachment holds a sender, so this only happens if the
                        // router went away with the process
                        *exit_code = attachment.session().process().exit_code();
                        return CloseReason::ProcessExited;
                    }
                },

                message = stream.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        match self.handle_text(attachment, codec, &text, &mut failures).await {
                            Step::Continue => {}
                            Step::Close(reason) => return reason,
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        tracing::warn!(
                            session_id = %session_id,
                            bytes = data.len(),
                            "Dropping binary message"
                        );
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return CloseReason::ClientClosed,
                    Some(Ok(_)) => {
                        // Ping/pong are answered by the WebSocket layer
                    }
                    Some(Err(e)) => return CloseReason::Transport(e.to_string()),
                },
            }
        }
    }

    async fn handle_text(
        &self,
        attachment: &Attachment,
        codec: &FrameCodec,
        text: &str,
        failures: &mut u32,
    ) -> Step {
        let session_id = attachment.session().id();

        let frame = match codec.decode(text) {
            Ok(Decoded::Frame(frame)) => frame,
            Ok(Decoded::Unknown(kind)) => {
                tracing::debug!(session_id = %session_id, kind = %kind, "Ignoring unknown frame kind");
                return Step::Continue;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Dropping malformed frame");
                return Step::Continue;
            }
        };

        let result = match frame {
            Frame::Input { data } => {
                tracing::trace!(session_id = %session_id, bytes = data.len(), "Input");
                attachment.write(data.as_bytes()).await
            }
            Frame::Resize { columns, rows } => attachment
                .resize(TerminalSize::new(columns, rows))
                .await
                .map(|_| ()),
            other => {
                tracing::debug!(
                    session_id = %session_id,
                    kind = other.kind(),
                    "Ignoring server-bound frame from client"
                );
                return Step::Continue;
            }
        };

        match result {
            Ok(()) => {
                *failures = 0;
                Step::Continue
            }
            Err(SessionError::Backpressure(_)) => Step::Close(CloseReason::Backpressure),
            Err(SessionError::Detached(_)) => Step::Close(CloseReason::TakenOver),
            Err(e) => {
                *failures += 1;
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    failures = *failures,
                    "Failed to forward client frame"
                );
                if *failures >= self.config.max_consecutive_failures {
                    Step::Close(CloseReason::TooManyFailures)
                } else {
                    Step::Continue
                }
            }
        }
    }
}

/// Decides whether a closing bridge takes its session down with it.
fn should_destroy(reason: &CloseReason, alive: bool, keep_alive: bool) -> bool {
    if !alive {
        return true;
    }
    match reason {
        CloseReason::TakenOver => false,
        _ => !keep_alive,
    }
}
