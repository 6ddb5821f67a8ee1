//! [`RateLimiter`] – minimum-interval gate for outbound telemetry.
//!
//! Frames arrive at whatever rate the sensor delivers them; the peripheral
//! only wants an update every so often.  The limiter owns a [`SendWindow`]
//! (last send time + minimum interval) and answers one question per frame:
//! may this frame start a send cycle?
//!
//! Checking never mutates the window.  The caller records the send time with
//! [`RateLimiter::record`] once the payload has been handed to the link, so a
//! frame that is dropped earlier (e.g. a degenerate grid) does not consume the
//! window.  Frames inside the window are discarded, never queued.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use handeye_kernel::rate_limiter::RateLimiter;
//!
//! let t0 = Instant::now();
//! let mut limiter = RateLimiter::new(Duration::from_secs(1));
//!
//! assert!(limiter.allows(t0));
//! limiter.record(t0);
//! assert!(!limiter.allows(t0 + Duration::from_millis(500)));
//! assert!(limiter.allows(t0 + Duration::from_millis(1001)));
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default minimum spacing between two telemetry sends.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// When the pipeline stamps the send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Record after every hand-off to the link, even when the link was not
    /// ready and the payload was dropped.
    #[default]
    AfterAttempt,
    /// Record only when the write was actually dispatched to the transport.
    AfterDelivery,
}

/// Last-send timestamp plus the fixed minimum interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    last_send: Option<Instant>,
    min_interval: Duration,
}

impl SendWindow {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_send: None,
            min_interval,
        }
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for SendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

/// Gates how often a frame may produce a wire send.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    window: SendWindow,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            window: SendWindow::new(min_interval),
        }
    }

    /// `true` when no send has been recorded yet or strictly more than the
    /// minimum interval has elapsed since the last one.
    pub fn allows(&self, now: Instant) -> bool {
        match self.window.last_send {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.window.min_interval,
        }
    }

    /// Stamp the window with the time of a completed hand-off.
    pub fn record(&mut self, now: Instant) {
        self.window.last_send = Some(now);
    }

    /// Forget the last send so the next frame is allowed immediately.
    pub fn reset(&mut self) {
        self.window.last_send = None;
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }
}
