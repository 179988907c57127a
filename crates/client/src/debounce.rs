//! Trailing debounce for surface resize events.

use std::future;
use std::time::Duration;

use protocol::TerminalSize;
use tokio::time::{sleep_until, Instant};

/// Default quiet period before a resize is sent.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Holds the latest requested size until no new request arrives for the
/// configured delay.
#[derive(Debug)]
pub struct ResizeDebouncer {
    delay: Duration,
    pending: Option<(TerminalSize, Instant)>,
}

impl Default for ResizeDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_RESIZE_DEBOUNCE)
    }
}

impl ResizeDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Record a size and restart the quiet period.
    pub fn push(&mut self, size: TerminalSize) {
        self.pending = Some((size, Instant::now() + self.delay));
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, deadline)| deadline)
    }

    /// Take the pending size if its deadline has passed.
    pub fn poll_ready(&mut self, now: Instant) -> Option<TerminalSize> {
        match self.pending {
            Some((size, deadline)) if deadline <= now => {
                self.pending = None;
                Some(size)
            }
            _ => None,
        }
    }

    /// Wait for the pending size to settle.
    ///
    /// Never resolves while nothing is pending, so it can sit in a
    /// `select!` next to other sources.
    pub async fn ready(&mut self) -> TerminalSize {
        loop {
            match self.pending {
                Some((_, deadline)) => {
                    sleep_until(deadline).await;
                    if let Some(size) = self.poll_ready(Instant::now()) {
                        return size;
                    }
                }
                None => future::pending::<()>().await,
            }
        }
    }
}
