//! `handeye-runtime` – Pipeline orchestration
//!
//! Wires frame sources, the perception stages and the peripheral link into
//! one running process.
//!
//! # Modules
//!
//! - [`pipeline`] – [`TelemetryPipeline`][pipeline::TelemetryPipeline]:
//!   aggregate, rate-check, quantize, encode and hand off each depth frame;
//!   [`PipelineRuntime`][pipeline::PipelineRuntime] owns the pipeline task,
//!   the link actor and the frame pump for the life of the process.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   installs the global `tracing` subscriber with an optional OTLP span
//!   exporter.

pub mod pipeline;
pub mod telemetry;

pub use pipeline::{
    DEFAULT_FRAME_QUEUE, FrameOutcome, PipelineConfig, PipelineRuntime, PipelineStats, PumpStats, QueuedFrame,
    RuntimeReport, TelemetryPipeline, spawn_frame_pump,
};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
