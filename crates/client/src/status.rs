//! Connection status and the banners shown for it.
//!
//! Banners never carry raw error details; those go to the log.

/// Banner while the connection is being set up.
pub const CONNECTING_BANNER: &str = "Connecting…";

/// Banner after a transport or attach failure.
pub const ERROR_BANNER: &str = "Connection error!";

/// Banner after the socket closed without the shell exiting.
pub const CLOSED_BANNER: &str = "Connection closed. Refresh to reconnect.";

/// State of the connection to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Errored,
}

/// Banner text for a status.
///
/// `exit_code` is the code from the server's `exit` frame, if one arrived.
pub fn banner_text(status: ConnectionStatus, exit_code: Option<i32>) -> Option<String> {
    match status {
        ConnectionStatus::Connecting => Some(CONNECTING_BANNER.to_string()),
        ConnectionStatus::Connected => None,
        ConnectionStatus::Errored => Some(ERROR_BANNER.to_string()),
        ConnectionStatus::Disconnected => Some(match exit_code {
            Some(code) => format!("Terminal session ended (exit code: {})", code),
            None => CLOSED_BANNER.to_string(),
        }),
    }
}

/// A dismissible status banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBanner {
    status: ConnectionStatus,
    exit_code: Option<i32>,
    dismissed: bool,
}

impl Default for StatusBanner {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            exit_code: None,
            dismissed: false,
        }
    }
}

impl StatusBanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show the banner for a new status. A change un-dismisses it.
    pub fn update(&mut self, status: ConnectionStatus, exit_code: Option<i32>) {
        if status != self.status || exit_code != self.exit_code {
            self.dismissed = false;
        }
        self.status = status;
        self.exit_code = exit_code;
    }

    pub fn dismiss(&mut self) {
        self.dismissed = true;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Text to display, or None when hidden.
    pub fn text(&self) -> Option<String> {
        if self.dismissed {
            return None;
        }
        banner_text(self.status, self.exit_code)
    }
}
