//! Region-average depth grid.
//!
//! Reduces a dense [`DepthFrame`] to the 3×3 [`RegionGrid`] that is sent to
//! the HandEye peripheral.
//!
//! # Partitioning
//!
//! Each axis is split into three spans of `floor(size / 3)` pixels; the last
//! span absorbs the remainder, so a 10-pixel-wide frame is split `3 / 3 / 4`.
//!
//! # Region statistic
//!
//! A region's value is the mean of its readings that are finite and strictly
//! positive.  A region without a single valid reading averages `0.0`.
//!
//! # Corner synthesis
//!
//! The top-left and top-right regions are not used as measured.  Each is
//! replaced by the mean of the three measured regions touching it:
//!
//! ```text
//!   TL* = (TC + ML + C) / 3        TR* = (TC + MR + C) / 3
//! ```
//!
//! # Wire order
//!
//! The synthesized row `[TL*, TC, TR*]` comes first, followed by the remaining
//! measured regions column by column (left → right), bottom region before middle region
//! within each column.  See [`handeye_types::layout`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use handeye_perception::grid::aggregate;
//! use handeye_types::DepthFrame;
//!
//! let frame = DepthFrame::from_fn(6, 6, Duration::ZERO, |_, _| 2.0).unwrap();
//! let grid = aggregate(&frame);
//! assert!(grid.flatten().iter().all(|v| (*v - 2.0).abs() < 1e-6));
//! ```

use std::fmt::Write as _;

use handeye_types::{DepthFrame, GRID_DIM, RegionGrid};
use tracing::trace;

/// Geometric row index of the top third of the frame (lowest buffer rows).
const TOP: usize = 0;
const MIDDLE: usize = 1;
/// Geometric row index of the bottom third (highest buffer rows).
const BOTTOM: usize = 2;

const LEFT: usize = 0;
const CENTER: usize = 1;
const RIGHT: usize = 2;

/// Measured region means in geometric order: `[row][col]`, row 0 at the top
/// of the frame, col 0 at the left.
pub type RegionMeans = [[f32; GRID_DIM]; GRID_DIM];

// ────────────────────────────────────────────────────────────────────────────
// Aggregation
// ────────────────────────────────────────────────────────────────────────────

/// Reduce `frame` to its wire-ordered [`RegionGrid`].  Never fails.
pub fn aggregate(frame: &DepthFrame) -> RegionGrid {
    let m = region_means(frame);

    let top_left = (m[TOP][CENTER] + m[MIDDLE][LEFT] + m[MIDDLE][CENTER]) / 3.0;
    let top_right = (m[TOP][CENTER] + m[MIDDLE][RIGHT] + m[MIDDLE][CENTER]) / 3.0;

    let mut slots = Vec::with_capacity(GRID_DIM * GRID_DIM);
    slots.extend([top_left, m[TOP][CENTER], top_right]);
    for col in [LEFT, CENTER, RIGHT] {
        for row in [BOTTOM, MIDDLE] {
            slots.push(m[row][col]);
        }
    }

    let mut cells = [[0.0; GRID_DIM]; GRID_DIM];
    for (i, v) in slots.into_iter().enumerate() {
        cells[i / GRID_DIM][i % GRID_DIM] = v;
    }
    RegionGrid::new(cells)
}

/// Mean valid depth of each of the nine regions, in geometric order.
pub fn region_means(frame: &DepthFrame) -> RegionMeans {
    let cols = spans(frame.width());
    let rows = spans(frame.height());

    let mut sums = [[0.0f64; GRID_DIM]; GRID_DIM];
    let mut counts = [[0u64; GRID_DIM]; GRID_DIM];

    for (ry, &(y0, y1)) in rows.iter().enumerate() {
        for y in y0..y1 {
            let row = &frame.depths()[y * frame.width()..(y + 1) * frame.width()];
            for (rx, &(x0, x1)) in cols.iter().enumerate() {
                for &d in &row[x0..x1] {
                    if is_valid(d) {
                        sums[ry][rx] += f64::from(d);
                        counts[ry][rx] += 1;
                    }
                }
            }
        }
    }

    let mut means = [[0.0f32; GRID_DIM]; GRID_DIM];
    for ry in 0..GRID_DIM {
        for rx in 0..GRID_DIM {
            if counts[ry][rx] > 0 {
                means[ry][rx] = (sums[ry][rx] / counts[ry][rx] as f64) as f32;
            } else {
                trace!(row = ry, col = rx, "region has no valid readings");
            }
        }
    }
    means
}

/// Half-open pixel spans of the three thirds of an axis of length `size`.
pub fn spans(size: usize) -> [(usize, usize); GRID_DIM] {
    let step = size / GRID_DIM;
    [(0, step), (step, 2 * step), (2 * step, size)]
}

fn is_valid(depth: f32) -> bool {
    depth.is_finite() && depth > 0.0
}

// ────────────────────────────────────────────────────────────────────────────
// Point-sampled debug grid
// ────────────────────────────────────────────────────────────────────────────

/// Sample single pixels at the centers of the nine thirds.
///
/// Returns geometric order (row 0 at the top).  NaN readings become `0.0`.
/// This is a cheap debug view, not the telemetry statistic.
pub fn point_sample(frame: &DepthFrame) -> RegionMeans {
    let (w, h) = (frame.width(), frame.height());
    let xs = [w / 6, w / 2, (w * 5) / 6];
    let ys = [h / 6, h / 2, (h * 5) / 6];

    let mut grid = [[0.0; GRID_DIM]; GRID_DIM];
    for (ry, &y) in ys.iter().enumerate() {
        for (rx, &x) in xs.iter().enumerate() {
            let d = frame.depth_at(x, y).unwrap_or(f32::NAN);
            grid[ry][rx] = if d.is_nan() { 0.0 } else { d };
        }
    }
    grid
}

/// Render a 3×3 matrix as tab-separated rows with two decimals.
pub fn format_table(cells: &[[f32; GRID_DIM]; GRID_DIM]) -> String {
    let mut out = String::new();
    for (i, row) in cells.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, v) in row.iter().enumerate() {
            if j > 0 {
                out.push('\t');
            }
            let _ = write!(out, "{v:.2}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use handeye_types::layout;
    use std::time::Duration;

    fn frame(w: usize, h: usize, f: impl FnMut(usize, usize) -> f32) -> DepthFrame {
        DepthFrame::from_fn(w, h, Duration::ZERO, f).unwrap()
    }

    /// Each region gets a distinct constant value `1 + 3*row + col`.
    fn labelled_frame(w: usize, h: usize) -> DepthFrame {
        let cols = spans(w);
        let rows = spans(h);
        let third = |spans: &[(usize, usize); 3], p: usize| {
            spans.iter().position(|&(a, b)| p >= a && p < b).unwrap()
        };
        frame(w, h, |x, y| (1 + 3 * third(&rows, y) + third(&cols, x)) as f32)
    }

    /// Mean over valid pixels in a pixel rectangle, computed the slow way.
    fn manual_mean(f: &DepthFrame, xs: (usize, usize), ys: (usize, usize)) -> f32 {
        let mut sum = 0.0f64;
        let mut n = 0u32;
        for y in ys.0..ys.1 {
            for x in xs.0..xs.1 {
                let d = f.depth_at(x, y).unwrap();
                if d.is_finite() && d > 0.0 {
                    sum += d as f64;
                    n += 1;
                }
            }
        }
        if n == 0 { 0.0 } else { (sum / n as f64) as f32 }
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn spans_give_remainder_to_last_third() {
        assert_eq!(spans(9), [(0, 3), (3, 6), (6, 9)]);
        assert_eq!(spans(10), [(0, 3), (3, 6), (6, 10)]);
        assert_eq!(spans(11), [(0, 3), (3, 6), (6, 11)]);
        assert_eq!(spans(256), [(0, 85), (85, 170), (170, 256)]);
    }

    #[test]
    fn every_cell_is_finite_and_non_negative() {
        for (w, h) in [(3, 3), (4, 5), (7, 3), (10, 11), (64, 48)] {
            let f = frame(w, h, |x, y| match (x + 2 * y) % 5 {
                0 => f32::NAN,
                1 => -1.0,
                2 => f32::INFINITY,
                3 => 0.0,
                _ => 0.5 + x as f32 * 0.1,
            });
            let grid = aggregate(&f);
            assert_eq!(grid.flatten().len(), 9);
            for v in grid.flatten() {
                assert!(v.is_finite() && v >= 0.0, "{w}x{h} produced {v}");
            }
        }
    }

    #[test]
    fn region_without_valid_pixels_averages_zero() {
        // Bottom-left region of a 9x9 frame is rows 6..9, cols 0..3.
        let f = frame(9, 9, |x, y| {
            if x < 3 && y >= 6 {
                match (x + y) % 3 {
                    0 => f32::NAN,
                    1 => -2.0,
                    _ => 0.0,
                }
            } else {
                1.5
            }
        });
        let grid = aggregate(&f);
        assert_eq!(grid.slot(layout::BOTTOM_LEFT), 0.0);
        assert!(approx(grid.slot(layout::MIDDLE_LEFT), 1.5));
    }

    #[test]
    fn invalid_pixels_do_not_dilute_the_mean() {
        let f = frame(3, 3, |x, y| if (x + y) % 2 == 0 { 3.0 } else { f32::NAN });
        let means = region_means(&f);
        for row in means {
            for v in row {
                assert!(v == 0.0 || approx(v, 3.0));
            }
        }
        let f = frame(6, 6, |x, _| if x % 2 == 0 { 2.0 } else { -4.0 });
        assert!(approx(region_means(&f)[MIDDLE][CENTER], 2.0));
    }

    #[test]
    fn wire_order_is_pinned() {
        // Region values: top row 1 2 3, middle 4 5 6, bottom 7 8 9.
        let grid = aggregate(&labelled_frame(12, 9));
        let tl = (2.0 + 4.0 + 5.0) / 3.0;
        let tr = (2.0 + 6.0 + 5.0) / 3.0;
        let expected = [tl, 2.0, tr, 7.0, 4.0, 8.0, 5.0, 9.0, 6.0];
        for (slot, (got, want)) in grid.flatten().iter().zip(expected).enumerate() {
            assert!(approx(*got, want), "slot {slot}: got {got}, want {want}");
        }
    }

    #[test]
    fn wire_order_holds_with_uneven_spans() {
        let grid = aggregate(&labelled_frame(10, 11));
        assert!(approx(grid.slot(layout::TOP_CENTER), 2.0));
        assert!(approx(grid.slot(layout::BOTTOM_LEFT), 7.0));
        assert!(approx(grid.slot(layout::MIDDLE_LEFT), 4.0));
        assert!(approx(grid.slot(layout::BOTTOM_CENTER), 8.0));
        assert!(approx(grid.slot(layout::CENTER), 5.0));
        assert!(approx(grid.slot(layout::BOTTOM_RIGHT), 9.0));
        assert!(approx(grid.slot(layout::MIDDLE_RIGHT), 6.0));
    }

    #[test]
    fn synthesized_corners_are_neighbour_means() {
        let f = frame(30, 21, |x, y| {
            if (x * 7 + y * 3) % 11 == 0 {
                f32::NAN
            } else {
                0.3 + x as f32 * 0.05 + y as f32 * 0.02
            }
        });
        let cols = spans(30);
        let rows = spans(21);
        let top_center = manual_mean(&f, cols[1], rows[0]);
        let middle_left = manual_mean(&f, cols[0], rows[1]);
        let center = manual_mean(&f, cols[1], rows[1]);
        let middle_right = manual_mean(&f, cols[2], rows[1]);

        let grid = aggregate(&f);
        assert!(approx(
            grid.slot(layout::TOP_LEFT_SYNTH),
            (top_center + middle_left + center) / 3.0
        ));
        assert!(approx(
            grid.slot(layout::TOP_RIGHT_SYNTH),
            (top_center + middle_right + center) / 3.0
        ));
    }

    #[test]
    fn measured_top_corners_are_ignored() {
        let base = aggregate(&frame(9, 9, |_, _| 1.0));
        let spiked = aggregate(&frame(9, 9, |x, y| {
            if y < 3 && (x < 3 || x >= 6) { 50.0 } else { 1.0 }
        }));
        assert_eq!(base, spiked);
    }

    #[test]
    fn uniform_frame_gives_uniform_grid() {
        let grid = aggregate(&frame(192, 256, |_, _| 2.0));
        for v in grid.flatten() {
            assert!(approx(v, 2.0));
        }
    }

    #[test]
    fn tiny_frame_degrades_to_zeros() {
        let grid = aggregate(&frame(1, 1, |_, _| 4.0));
        // Only the bottom-right third is non-empty.
        assert!(approx(grid.slot(layout::BOTTOM_RIGHT), 4.0));
        assert_eq!(grid.slot(layout::CENTER), 0.0);
    }

    #[test]
    fn point_sample_reads_third_centers() {
        let f = frame(12, 12, |x, y| if (x, y) == (2, 2) { f32::NAN } else { (y * 100 + x) as f32 });
        let grid = point_sample(&f);
        assert_eq!(grid[0][0], 0.0);
        assert_eq!(grid[0][1], 206.0);
        assert_eq!(grid[1][1], 606.0);
        assert_eq!(grid[2][2], 1010.0);
    }

    #[test]
    fn format_table_uses_two_decimals() {
        let table = format_table(&[[1.0, 2.5, 0.124], [0.0; 3], [10.0, 0.0, 3.333]]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "1.00\t2.50\t0.12");
        assert_eq!(lines[2], "10.00\t0.00\t3.33");
    }
}
