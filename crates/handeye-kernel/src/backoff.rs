//! [`Backoff`] – bounded exponential delay between reconnect attempts.
//!
//! After a lost link or a failed connection step the peripheral session waits
//! [`Backoff::next_delay`] before scanning again.  The delay doubles on each
//! consecutive failure up to [`ReconnectPolicy::max_delay`].  Once
//! [`ReconnectPolicy::max_attempts`] is reached `next_delay` returns `None`
//! and the caller stops retrying on its own.

use std::time::Duration;

use tracing::debug;

/// Tunables for [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Consecutive retries allowed before giving up.  `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: Some(10),
        }
    }
}

/// Consecutive-failure counter driving a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let factor = 1u32 << self.attempts.min(16);
        let delay = self
            .policy
            .initial_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay);
        self.attempts += 1;
        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "reconnect backoff");
        Some(delay)
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    /// Clear the failure streak (after a successful connection).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
