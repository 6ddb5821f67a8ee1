//! `handeye-kernel` – pacing and retry rules.
//!
//! Regulates how often the rest of the stack is allowed to act.  It holds no
//! I/O of its own.
//!
//! # Modules
//!
//! - [`rate_limiter`] – [`RateLimiter`][rate_limiter::RateLimiter]:
//!   minimum-interval gate over a [`SendWindow`][rate_limiter::SendWindow];
//!   frames inside the window are dropped, never queued.
//! - [`backoff`] – [`Backoff`][backoff::Backoff]: bounded exponential delay
//!   between reconnect attempts of the peripheral link.

pub mod backoff;
pub mod rate_limiter;

pub use backoff::{Backoff, ReconnectPolicy};
pub use rate_limiter::{DEFAULT_MIN_INTERVAL, RateLimiter, SendWindow, WindowPolicy};
