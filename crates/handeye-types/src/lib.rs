//! `handeye-types` – shared data model for the HandEye depth telemetry stack.
//!
//! Every other crate in the workspace speaks in these types: raw
//! [`DepthFrame`]s coming from the sensor, the [`RegionGrid`] /
//! [`QuantizedGrid`] summaries, the 9-byte [`TelemetryMessage`] that goes on
//! the wire, the [`PeripheralState`] of the wireless link, and the [`Event`]s
//! routed over the internal bus.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of rows / columns in every grid.
pub const GRID_DIM: usize = 3;

/// Number of cells in every grid and bytes in every [`TelemetryMessage`].
pub const GRID_CELLS: usize = GRID_DIM * GRID_DIM;

/// Wire slot indices of the 9-byte telemetry payload.
///
/// The receiving firmware decodes the payload with this table; it is not
/// self-describing.  Slot `n` is cell `(n / 3, n % 3)` of a [`RegionGrid`].
///
/// | Slot | Region |
/// |---|---|
/// | 0 | top-left corner, synthesized |
/// | 1 | top-center |
/// | 2 | top-right corner, synthesized |
/// | 3 | bottom-left |
/// | 4 | middle-left |
/// | 5 | bottom-center |
/// | 6 | center |
/// | 7 | bottom-right |
/// | 8 | middle-right |
pub mod layout {
    pub const TOP_LEFT_SYNTH: usize = 0;
    pub const TOP_CENTER: usize = 1;
    pub const TOP_RIGHT_SYNTH: usize = 2;
    pub const BOTTOM_LEFT: usize = 3;
    pub const MIDDLE_LEFT: usize = 4;
    pub const BOTTOM_CENTER: usize = 5;
    pub const CENTER: usize = 6;
    pub const BOTTOM_RIGHT: usize = 7;
    pub const MIDDLE_RIGHT: usize = 8;
}

// ─────────────────────────────────────────────────────────────────────────────
// Depth frames and grids
// ─────────────────────────────────────────────────────────────────────────────

/// A dense depth measurement pushed by the frame source.
///
/// `depths` is row-major, one reading in meters per pixel.  NaN, infinite,
/// zero and negative readings mean "no reading" for that pixel.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    width: usize,
    height: usize,
    depths: Vec<f32>,
    /// Sensor clock timestamp of the capture.
    timestamp: Duration,
}

impl DepthFrame {
    /// Wrap a raw depth buffer.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::InvalidFrame`] when either dimension is zero or
    /// the buffer length is not `width * height`.
    pub fn new(
        width: usize,
        height: usize,
        depths: Vec<f32>,
        timestamp: Duration,
    ) -> Result<Self, HandEyeError> {
        if width == 0 || height == 0 {
            return Err(HandEyeError::InvalidFrame(format!(
                "dimensions must be positive, got {width}x{height}"
            )));
        }
        let expected = width.checked_mul(height).ok_or_else(|| {
            HandEyeError::InvalidFrame(format!("{width}x{height} overflows usize"))
        })?;
        if depths.len() != expected {
            return Err(HandEyeError::InvalidFrame(format!(
                "buffer holds {} readings, {width}x{height} needs {expected}",
                depths.len()
            )));
        }
        Ok(Self {
            width,
            height,
            depths,
            timestamp,
        })
    }

    /// Build a frame by evaluating `depth_at(x, y)` for every pixel.
    pub fn from_fn(
        width: usize,
        height: usize,
        timestamp: Duration,
        mut depth_at: impl FnMut(usize, usize) -> f32,
    ) -> Result<Self, HandEyeError> {
        let mut depths = Vec::with_capacity(width.saturating_mul(height));
        for y in 0..height {
            for x in 0..width {
                depths.push(depth_at(x, y));
            }
        }
        Self::new(width, height, depths, timestamp)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depths(&self) -> &[f32] {
        &self.depths
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Reading at pixel `(x, y)`, or `None` outside the frame.
    pub fn depth_at(&self, x: usize, y: usize) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.depths.get(y * self.width + x).copied()
    }
}

/// 3×3 matrix of region depth averages in meters, stored in wire order.
///
/// Row-major flattening of `cells` yields the [`layout`] slot order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionGrid {
    cells: [[f32; GRID_DIM]; GRID_DIM],
}

impl RegionGrid {
    pub fn new(cells: [[f32; GRID_DIM]; GRID_DIM]) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[[f32; GRID_DIM]; GRID_DIM] {
        &self.cells
    }

    /// Value at wire slot `slot` (see [`layout`]).
    ///
    /// # Panics
    ///
    /// Panics if `slot >= GRID_CELLS`.
    pub fn slot(&self, slot: usize) -> f32 {
        self.cells[slot / GRID_DIM][slot % GRID_DIM]
    }

    /// Row-major flattening (wire order).
    pub fn flatten(&self) -> [f32; GRID_CELLS] {
        let mut out = [0.0; GRID_CELLS];
        for (i, v) in self.cells.iter().flatten().enumerate() {
            out[i] = *v;
        }
        out
    }
}

/// 3×3 matrix of single-byte depth values, same order as [`RegionGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedGrid {
    cells: [[u8; GRID_DIM]; GRID_DIM],
}

impl QuantizedGrid {
    pub fn new(cells: [[u8; GRID_DIM]; GRID_DIM]) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[[u8; GRID_DIM]; GRID_DIM] {
        &self.cells
    }

    /// Value at wire slot `slot` (see [`layout`]).
    ///
    /// # Panics
    ///
    /// Panics if `slot >= GRID_CELLS`.
    pub fn slot(&self, slot: usize) -> u8 {
        self.cells[slot / GRID_DIM][slot % GRID_DIM]
    }
}

/// The 9-byte wire payload.  No header, length prefix or checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TelemetryMessage([u8; GRID_CELLS]);

impl TelemetryMessage {
    pub fn new(bytes: [u8; GRID_CELLS]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GRID_CELLS] {
        &self.0
    }
}

impl From<[u8; GRID_CELLS]> for TelemetryMessage {
    fn from(bytes: [u8; GRID_CELLS]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for TelemetryMessage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peripheral link
// ─────────────────────────────────────────────────────────────────────────────

/// Service the HandEye firmware advertises.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);

/// Characteristic the depth payload is written to.
pub const DEFAULT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0c857149_c4fb_43ba_b0dc_7ecf72de141e);

/// Advertised name of the HandEye firmware.
pub const DEFAULT_PERIPHERAL_NAME: &str = "HandEyeESP32";

/// Connection lifecycle of the wireless peripheral link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    /// The only state in which telemetry is written.
    Ready,
}

impl PeripheralState {
    pub fn is_ready(self) -> bool {
        self == PeripheralState::Ready
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeripheralState::Disconnected => "disconnected",
            PeripheralState::Scanning => "scanning",
            PeripheralState::Connecting => "connecting",
            PeripheralState::Connected => "connected",
            PeripheralState::DiscoveringServices => "discovering-services",
            PeripheralState::DiscoveringCharacteristics => "discovering-characteristics",
            PeripheralState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Identity of the one peripheral the link talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// When set, scanning is unrestricted and candidates are matched by
    /// advertised name.  When `None`, scanning is restricted to `service`.
    pub name: Option<String>,
}

impl Default for PeripheralTarget {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE_UUID,
            characteristic: DEFAULT_CHARACTERISTIC_UUID,
            name: Some(DEFAULT_PERIPHERAL_NAME.to_string()),
        }
    }
}

/// GATT write flavour used for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Acknowledged write; the transport reports a write result.
    #[default]
    WithResponse,
    /// Unacknowledged write.
    WithoutResponse,
}

impl std::str::FromStr for WriteMode {
    type Err = HandEyeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "with_response" => Ok(WriteMode::WithResponse),
            "without_response" => Ok(WriteMode::WithoutResponse),
            other => Err(HandEyeError::Config(format!("unknown write mode '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"handeye-hal::link"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Stamp `payload` with a fresh id and the current wall-clock time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Why a frame did not produce a wire write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    RateLimited,
    DegenerateGrid,
    NotReady(PeripheralState),
    TransportRejected(String),
}

/// Variants of data routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    LinkStateChanged {
        from: PeripheralState,
        to: PeripheralState,
    },
    PeripheralDiscovered {
        name: Option<String>,
        rssi: Option<i16>,
        services: Vec<Uuid>,
    },
    TelemetrySent(TelemetryMessage),
    FrameDropped(DropReason),
    HardwareFault {
        component: String,
        message: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Global error type for the HandEye stack.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HandEyeError {
    #[error("Invalid depth frame: {0}")]
    InvalidFrame(String),

    #[error("Degenerate grid: maximum cell value {max} is not a positive finite number")]
    DegenerateGrid { max: f32 },

    #[error("Invalid telemetry payload: expected {expected} bytes, got {actual}")]
    InvalidPayload { expected: usize, actual: usize },

    #[error("Transport error during {operation}: {details}")]
    Transport { operation: String, details: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
