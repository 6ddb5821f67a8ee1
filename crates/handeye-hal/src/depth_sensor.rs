//! Generic `DepthSensor` trait for depth-capture hardware.

use std::time::Duration;

use handeye_types::{DepthFrame, HandEyeError};

/// A depth camera, time-of-flight module or any other source of dense depth
/// frames.
pub trait DepthSensor: Send {
    /// Stable identifier for this sensor, e.g. `"front_tof"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::InvalidFrame`] when the device hands back a
    /// malformed buffer and [`HandEyeError::Transport`] when it cannot be
    /// reached.
    fn capture(&mut self) -> Result<DepthFrame, HandEyeError>;

    /// Told once, before the first capture, how often the caller will poll.
    /// Sensors that stamp frames themselves ignore it.
    fn set_frame_period(&mut self, _period: Duration) {}
}
