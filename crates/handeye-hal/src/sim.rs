//! Simulated depth sensor for demos and headless tests.
//!
//! [`SimDepthSensor`] renders a flat wall with a square obstacle sweeping
//! left to right in front of it.  A sparse, deterministic pattern of pixels
//! reads NaN, the way real time-of-flight sensors drop returns.
//!
//! # Example
//!
//! ```rust
//! use handeye_hal::depth_sensor::DepthSensor;
//! use handeye_hal::sim::SimDepthSensor;
//!
//! let mut sensor = SimDepthSensor::new("sim_tof", 64, 48);
//! let frame = sensor.capture().unwrap();
//! assert_eq!(frame.width(), 64);
//! ```

use std::time::Duration;

use handeye_types::{DepthFrame, HandEyeError};

use crate::depth_sensor::DepthSensor;

/// Pixel dropout period; roughly one reading in this many is NaN.
const DROPOUT_PERIOD: usize = 53;

pub struct SimDepthSensor {
    id: String,
    width: usize,
    height: usize,
    wall_distance: f32,
    obstacle_distance: Option<f32>,
    frame_period: Duration,
    dropouts: bool,
    frames: u64,
}

impl SimDepthSensor {
    /// A sensor looking at a wall 2 m away with an obstacle at 0.6 m.  Frames
    /// are stamped 30 fps apart until a frame period is set.
    pub fn new(id: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            wall_distance: 2.0,
            obstacle_distance: Some(0.6),
            frame_period: Duration::from_micros(33_333),
            dropouts: true,
            frames: 0,
        }
    }

    pub fn with_wall(mut self, meters: f32) -> Self {
        self.wall_distance = meters;
        self
    }

    /// `None` removes the obstacle.
    pub fn with_obstacle(mut self, meters: Option<f32>) -> Self {
        self.obstacle_distance = meters;
        self
    }

    pub fn without_dropouts(mut self) -> Self {
        self.dropouts = false;
        self
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames
    }

    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }

    /// Horizontal span `[x0, x1)` covered by the obstacle in frame `n`.
    fn obstacle_columns(&self, n: u64) -> (usize, usize) {
        let side = (self.width / 4).max(1);
        let travel = self.width.saturating_sub(side).max(1);
        let x0 = (n as usize).wrapping_mul(2) % travel;
        (x0, x0 + side)
    }
}

impl DepthSensor for SimDepthSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_frame_period(&mut self, period: Duration) {
        self.frame_period = period;
    }

    fn capture(&mut self) -> Result<DepthFrame, HandEyeError> {
        let n = self.frames;
        let (x0, x1) = self.obstacle_columns(n);
        let (y0, y1) = (self.height / 3, self.height - self.height / 3);
        let timestamp = self.frame_period.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX));
        let wall = self.wall_distance;
        let obstacle = self.obstacle_distance;
        let dropouts = self.dropouts;
        let width = self.width;

        let frame = DepthFrame::from_fn(self.width, self.height, timestamp, |x, y| {
            if dropouts && (y * width + x + n as usize) % DROPOUT_PERIOD == 0 {
                return f32::NAN;
            }
            match obstacle {
                Some(d) if (x0..x1).contains(&x) && (y0..y1).contains(&y) => d,
                _ => wall,
            }
        })?;
        self.frames += 1;
        Ok(frame)
    }
}
