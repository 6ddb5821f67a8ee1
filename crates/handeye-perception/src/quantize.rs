//! Per-message max-scaled quantization of a [`RegionGrid`] into bytes.
//!
//! Every cell is divided by the grid's own maximum, clamped to `[0, 1]` and
//! scaled to `0..=255`.  The maximum itself is not transmitted, so absolute
//! depth cannot be recovered from the payload alone.

use handeye_types::{GRID_DIM, HandEyeError, QuantizedGrid, RegionGrid};

/// A quantized grid together with the scale it was normalized by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantization {
    pub grid: QuantizedGrid,
    /// The grid maximum in meters; maps to byte 255.
    pub scale: f32,
}

/// Quantize `grid` against its own maximum.
///
/// # Errors
///
/// Returns [`HandEyeError::DegenerateGrid`] when the maximum is not a
/// positive finite number (all cells zero or negative).  Callers skip the
/// send rather than transmitting an all-zero payload.
pub fn quantize(grid: &RegionGrid) -> Result<Quantization, HandEyeError> {
    let max = grid.flatten().into_iter().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() || max <= 0.0 {
        return Err(HandEyeError::DegenerateGrid { max });
    }

    let mut cells = [[0u8; GRID_DIM]; GRID_DIM];
    for (out_row, in_row) in cells.iter_mut().zip(grid.cells()) {
        for (out, &v) in out_row.iter_mut().zip(in_row) {
            *out = to_byte(v / max);
        }
    }

    Ok(Quantization {
        grid: QuantizedGrid::new(cells),
        scale: max,
    })
}

fn to_byte(normalized: f32) -> u8 {
    // NaN saturates to 0 in the cast.
    (normalized.clamp(0.0, 1.0) * 255.0).round().clamp(0.0, 255.0) as u8
}
