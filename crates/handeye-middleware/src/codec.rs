//! Telemetry wire codec.
//!
//! # Payload
//!
//! ```text
//! ┌────┬────┬────┬────┬────┬────┬────┬────┬────┐
//! │ s0 │ s1 │ s2 │ s3 │ s4 │ s5 │ s6 │ s7 │ s8 │   9 bytes, no framing
//! └────┴────┴────┴────┴────┴────┴────┴────┴────┘
//! ```
//!
//! Slot `n` is cell `(n / 3, n % 3)` of the [`QuantizedGrid`]; the region each
//! slot describes is listed in [`handeye_types::layout`].  Each byte is the
//! region depth divided by the message's own maximum, scaled to `0..=255`.
//! There is no header, length prefix or checksum; the peripheral must know
//! the slot table out of band.

use handeye_types::{GRID_CELLS, GRID_DIM, HandEyeError, QuantizedGrid, TelemetryMessage};

/// Flatten `grid` row-major into the 9-byte payload.
pub fn encode(grid: &QuantizedGrid) -> TelemetryMessage {
    let mut bytes = [0u8; GRID_CELLS];
    for (i, b) in grid.cells().iter().flatten().enumerate() {
        bytes[i] = *b;
    }
    TelemetryMessage::new(bytes)
}

/// Rebuild a [`QuantizedGrid`] from a received payload.
///
/// # Errors
///
/// Returns [`HandEyeError::InvalidPayload`] unless `payload` is exactly 9
/// bytes long.
pub fn decode(payload: &[u8]) -> Result<QuantizedGrid, HandEyeError> {
    if payload.len() != GRID_CELLS {
        return Err(HandEyeError::InvalidPayload {
            expected: GRID_CELLS,
            actual: payload.len(),
        });
    }
    let mut cells = [[0u8; GRID_DIM]; GRID_DIM];
    for (i, b) in payload.iter().enumerate() {
        cells[i / GRID_DIM][i % GRID_DIM] = *b;
    }
    Ok(QuantizedGrid::new(cells))
}
