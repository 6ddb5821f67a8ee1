//! `handeye-perception` – depth-frame reduction.
//!
//! Turns a dense per-pixel depth buffer into the nine bytes the HandEye
//! peripheral understands.
//!
//! # Modules
//!
//! - [`grid`] – [`aggregate`][grid::aggregate]: averages the frame into a 3×3
//!   [`RegionGrid`][handeye_types::RegionGrid] with synthesized top corners,
//!   plus a point-sampled debug view.
//! - [`quantize`] – [`quantize`][quantize::quantize]: max-scales a grid into
//!   single-byte cells, rejecting degenerate (all non-positive) grids.

pub mod grid;
pub mod quantize;

pub use grid::{aggregate, format_table, point_sample, region_means};
pub use quantize::{Quantization, quantize};
