//! TermBridge Daemon
//!
//! Serves interactive shell sessions over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::BridgeServer;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// TermBridge Daemon - serves interactive shell sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "termbridge-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start serving terminal sessions
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Shell to run for new sessions
        #[arg(long, value_name = "CMD")]
        shell: Option<String>,

        /// Keep sessions running after their client disconnects
        #[arg(long)]
        keep_alive: bool,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Serve {
            bind,
            shell,
            keep_alive,
        } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(shell) = shell {
                config.session.shell_command = shell;
            }
            if keep_alive {
                config.session.keep_alive_on_disconnect = true;
            }

            config.validate()?;

            let _log_guard = init_logging(
                &config.daemon.log_level,
                cli.verbose,
                config.daemon.log_file.as_deref(),
            )?;

            tracing::info!("TermBridge daemon starting...");
            tracing::debug!("Using config file: {:?}", config_path);

            let server = BridgeServer::bind(&config).await?;
            let shutdown = server.shutdown_token();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                shutdown.cancel();
            });

            server.run().await?;
            tracing::info!("TermBridge daemon stopped");
        }
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` wins over the configured level. With a log file the output
/// goes through a non-blocking writer whose guard must stay alive.
fn init_logging(
    level: &str,
    verbose: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_lowercase()));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(Some(guard))
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Failed to register signal handlers, using Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}
