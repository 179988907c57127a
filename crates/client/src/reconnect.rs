//! Reconnect policy with exponential backoff.

use std::time::Duration;

use rand::Rng;

/// When and how often to reconnect after the socket drops.
///
/// Disabled by default. Reconnects never happen after the server sent
/// `exit`, since the session is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts.
    pub max_attempts: Option<u32>,
    /// Random spread applied to each delay, as a fraction of it.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Default backoff with reconnects turned on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Yields successive reconnect delays for a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn base_delay(&self) -> Duration {
        let factor = self.policy.multiplier.max(1.0).powi(self.attempt as i32);
        let millis = self.policy.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.policy.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if !self.policy.enabled {
            return None;
        }
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Some(base);
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let millis = (base.as_millis() as f64 * (1.0 + spread)).max(0.0);
        Some(Duration::from_millis(millis as u64).min(self.policy.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::enabled()
        }
    }

    #[test]
    fn test_disabled_by_default() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.enabled);
        assert_eq!(policy.backoff().next(), None);
    }

    #[test]
    fn test_exponential_growth_with_cap() {
        let delays: Vec<u64> = exact()
            .backoff()
            .take(9)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = exact().with_max_attempts(2).backoff();
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ReconnectPolicy::enabled().backoff();
        for _ in 0..20 {
            let delay = backoff.next().unwrap();
            assert!(delay <= Duration::from_secs(30));
        }
        let first = ReconnectPolicy::enabled().backoff().next().unwrap();
        assert!(first >= Duration::from_millis(450) && first <= Duration::from_millis(550));
    }
}
