//! Configuration management for the TermBridge daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termbridge/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{TerminalSize, DEFAULT_COLUMNS, DEFAULT_ROWS, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the WebSocket server listens on.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:7681";

/// Default URL path prefix for session endpoints.
pub const DEFAULT_PATH_PREFIX: &str = "/session";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("initial dimensions must be non-zero, got {0}x{1}")]
    InvalidDimensions(u16, u16),

    #[error("input_queue_capacity must be greater than 0, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("max_consecutive_failures must be greater than 0, got {0}")]
    InvalidFailureThreshold(u32),

    #[error("idle_timeout_seconds must be greater than 0, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("max_frame_bytes must be between 1024 and {max}, got {0}", max = MAX_FRAME_SIZE * 16)]
    InvalidMaxFrameBytes(usize),

    #[error("bind_address is not a valid socket address: {0}")]
    InvalidBindAddress(String),

    #[error("path_prefix must start with '/' and must not end with '/', got {0}")]
    InvalidPathPrefix(String),

    #[error("shell_command path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TermBridge daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket server configuration.
    pub server: ServerConfig,

    /// Session and bridge configuration.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_address: String,

    /// URL path for new sessions; `{path_prefix}/{id}` attaches to one.
    pub path_prefix: String,

    /// Largest accepted incoming text frame, in bytes.
    pub max_frame_bytes: usize,
}

/// Policy applied when a second bridge tries to attach to a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttachPolicy {
    /// Refuse the newcomer; the current bridge keeps the session.
    #[default]
    Reject,
    /// Detach the current bridge and hand the session to the newcomer.
    Takeover,
}

/// Session and bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable for new sessions.
    pub shell_command: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,

    /// Working directory for new sessions. Inherits the daemon's when unset.
    pub working_dir: Option<PathBuf>,

    /// Initial terminal width.
    pub initial_columns: u16,

    /// Initial terminal height.
    pub initial_rows: u16,

    /// Leave the shell running when its bridge disconnects.
    pub keep_alive_on_disconnect: bool,

    /// Seconds a session may stay without a bridge before it is destroyed.
    pub idle_timeout_seconds: u64,

    /// How often the idle reaper runs, in seconds.
    pub reaper_interval_seconds: u64,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// What happens when a second bridge attaches to a session.
    pub attach_policy: AttachPolicy,

    /// Number of input chunks buffered in front of the shell.
    pub input_queue_capacity: usize,

    /// How long a write may wait for queue space before failing.
    pub write_timeout_ms: u64,

    /// Consecutive forwarding failures tolerated before a bridge closes.
    pub max_consecutive_failures: u32,

    /// Bytes of recent output replayed when a bridge reattaches.
    pub replay_buffer_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            max_frame_bytes: MAX_FRAME_SIZE,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell_command: default_shell(),
            shell_args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            initial_columns: DEFAULT_COLUMNS,
            initial_rows: DEFAULT_ROWS,
            keep_alive_on_disconnect: false,
            idle_timeout_seconds: 300,
            reaper_interval_seconds: 30,
            max_sessions: 32,
            attach_policy: AttachPolicy::Reject,
            input_queue_capacity: 256,
            write_timeout_ms: 250,
            max_consecutive_failures: 8,
            replay_buffer_bytes: 64 * 1024,
        }
    }
}

impl SessionConfig {
    /// Initial terminal size for new sessions.
    pub fn initial_size(&self) -> TerminalSize {
        TerminalSize::new(self.initial_columns, self.initial_rows)
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Write timeout as a duration.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termbridge")
        .join("config.toml")
}

/// Returns the host's login shell.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMBRIDGE_SHELL: Override the shell command
    /// - TERMBRIDGE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMBRIDGE_BIND_ADDRESS: Override the listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(shell) = std::env::var("TERMBRIDGE_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell_command from environment: {}", shell);
                self.session.shell_command = shell;
            }
        }

        if let Ok(level) = std::env::var("TERMBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("TERMBRIDGE_BIND_ADDRESS") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_address from environment: {}", addr);
                self.server.bind_address = addr;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if !session.initial_size().is_valid() {
            return Err(ConfigError::InvalidDimensions(
                session.initial_columns,
                session.initial_rows,
            ));
        }

        if session.input_queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(
                session.input_queue_capacity,
            ));
        }

        if session.max_consecutive_failures == 0 {
            return Err(ConfigError::InvalidFailureThreshold(
                session.max_consecutive_failures,
            ));
        }

        // A zero timeout would let the reaper take a session before its
        // creating bridge attaches.
        if session.idle_timeout_seconds == 0 {
            return Err(ConfigError::InvalidIdleTimeout(session.idle_timeout_seconds));
        }

        let max_frame = self.server.max_frame_bytes;
        if !(1024..=MAX_FRAME_SIZE * 16).contains(&max_frame) {
            return Err(ConfigError::InvalidMaxFrameBytes(max_frame));
        }

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddress(
                self.server.bind_address.clone(),
            ));
        }

        let prefix = &self.server.path_prefix;
        if !prefix.starts_with('/') || (prefix.len() > 1 && prefix.ends_with('/')) {
            return Err(ConfigError::InvalidPathPrefix(prefix.clone()));
        }

        // Absolute paths must exist; bare names are looked up in PATH
        let shell_path = Path::new(&session.shell_command);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.shell_command.clone()));
            }
        } else if which::which(&session.shell_command).is_err() {
            return Err(ConfigError::InvalidShellPath(session.shell_command.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
