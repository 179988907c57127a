//! termbridge - connect the local terminal to a TermBridge session.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, DisableBracketedPaste, EnableBracketedPaste, Event};
use crossterm::execute;
use crossterm::terminal::{
    self, disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use protocol::TerminalSize;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use terminal_client::keys::{encode_key, is_detach_key};
use terminal_client::{
    ClientConfig, ClientEvent, ReconnectPolicy, StatusBanner, SurfaceSize, TerminalClient,
    UiEvent,
};

/// TermBridge terminal client
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server endpoint
    #[arg(default_value = "ws://127.0.0.1:7681/session")]
    url: String,

    /// Attach to an existing session
    #[arg(short, long)]
    session: Option<String>,

    /// Reconnect with backoff when the connection drops
    #[arg(long)]
    reconnect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file (nothing is logged otherwise)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Restores the local terminal when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        execute!(std::io::stdout(), EnterAlternateScreen, EnableBracketedPaste)
            .context("Failed to prepare terminal")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = execute!(std::io::stdout(), DisableBracketedPaste, LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    let url = Url::parse(&cli.url).with_context(|| format!("Invalid URL: {}", cli.url))?;
    let (columns, rows) = terminal::size().context("Failed to read terminal size")?;

    let mut config = ClientConfig::new(url, TerminalSize::new(columns.max(1), rows.max(1)));
    if let Some(id) = cli.session {
        config = config.with_session(id);
    }
    if cli.reconnect {
        config = config.with_reconnect(ReconnectPolicy::enabled());
    }

    let (ui_tx, ui_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);

    let result = {
        let _raw = RawModeGuard::enable()?;
        spawn_input_thread(ui_tx)?;
        let renderer = tokio::spawn(render_events(events_rx));

        let result = TerminalClient::new(config).run(ui_rx, events_tx).await;
        let banner = renderer.await.context("Renderer task failed")?;
        result.map(|code| (code, banner))
    };

    let (exit_code, banner) = result?;
    if let Some(text) = banner {
        eprintln!("{}", text);
    }
    tracing::info!(exit_code = ?exit_code, "Client finished");

    if let Some(code) = exit_code {
        if code != 0 {
            drop(log_guard);
            std::process::exit(code.clamp(1, 255));
        }
    }
    Ok(())
}

/// Read local terminal events on a blocking thread.
fn spawn_input_thread(ui_tx: mpsc::Sender<UiEvent>) -> Result<()> {
    thread::Builder::new()
        .name("termbridge-input".to_string())
        .spawn(move || {
            while !ui_tx.is_closed() {
                match event::poll(Duration::from_millis(100)) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to poll terminal events");
                        break;
                    }
                }

                let ui_event = match event::read() {
                    Ok(Event::Key(key)) if is_detach_key(&key) => UiEvent::Close,
                    Ok(Event::Key(key)) => match encode_key(key) {
                        Some(bytes) => UiEvent::Input(String::from_utf8_lossy(&bytes).into_owned()),
                        None => continue,
                    },
                    Ok(Event::Paste(text)) => UiEvent::Paste(text),
                    Ok(Event::Resize(columns, rows)) => {
                        UiEvent::SurfaceResized(SurfaceSize::new(columns as f64, rows as f64))
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read terminal event");
                        break;
                    }
                };

                let closing = ui_event == UiEvent::Close;
                if ui_tx.blocking_send(ui_event).is_err() || closing {
                    break;
                }
            }
        })
        .context("Failed to spawn input thread")?;
    Ok(())
}

/// Draw client events. Returns the banner showing when the stream ended.
async fn render_events(mut events_rx: mpsc::Receiver<ClientEvent>) -> Option<String> {
    let mut banner = StatusBanner::new();
    let mut exit_code = None;
    let mut stdout = std::io::stdout();

    while let Some(event) = events_rx.recv().await {
        match event {
            ClientEvent::Render(bytes) => {
                if let Err(e) = stdout.write_all(&bytes).and_then(|_| stdout.flush()) {
                    tracing::warn!(error = %e, "Failed to write to terminal");
                }
            }
            ClientEvent::StatusChanged { status, .. } => {
                banner.update(status, exit_code);
                if let Some(text) = banner.text() {
                    // Title bar keeps the screen contents intact
                    let _ = write!(stdout, "\x1b]0;termbridge: {}\x07", text);
                    let _ = stdout.flush();
                }
            }
            ClientEvent::SessionAssigned(id) => {
                tracing::info!(session_id = %id, "Session assigned");
                let _ = write!(stdout, "\x1b]0;termbridge: {}\x07", id);
                let _ = stdout.flush();
            }
            ClientEvent::Exited(code) => exit_code = Some(code),
        }
    }

    banner.text()
}

fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    // The terminal is in raw mode, so logs only ever go to a file
    let Some(path) = log_file else {
        return Ok(None);
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log file has no file name: {}", path.display()))?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["termbridge"]);
        assert_eq!(cli.url, "ws://127.0.0.1:7681/session");
        assert!(cli.session.is_none());
        assert!(!cli.reconnect);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_attach() {
        let cli = Cli::parse_from([
            "termbridge",
            "ws://example.com:9000/term",
            "--session",
            "abc",
            "--reconnect",
            "-v",
        ]);
        assert_eq!(cli.url, "ws://example.com:9000/term");
        assert_eq!(cli.session.as_deref(), Some("abc"));
        assert!(cli.reconnect);
        assert!(cli.verbose);
    }

    #[tokio::test]
    async fn test_render_events_final_banner() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ClientEvent::Exited(3)).await.unwrap();
        tx.send(ClientEvent::StatusChanged {
            status: terminal_client::ConnectionStatus::Disconnected,
            banner: None,
        })
        .await
        .unwrap();
        drop(tx);

        assert_eq!(
            render_events(rx).await.as_deref(),
            Some("Terminal session ended (exit code: 3)")
        );
    }
}
