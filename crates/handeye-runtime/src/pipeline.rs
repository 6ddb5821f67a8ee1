//! [`TelemetryPipeline`] – depth frames in, 9-byte telemetry out.
//!
//! Each accepted frame runs through:
//!
//! 1. **Aggregate** – [`aggregate`] reduces the frame to a [`RegionGrid`][handeye_types::RegionGrid].
//! 2. **Rate check** – frames inside the send window are dropped.
//! 3. **Quantize** – a degenerate grid (no positive depth) skips the send
//!    and leaves the window untouched.
//! 4. **Encode** – [`codec::encode`] flattens the grid into the payload.
//! 5. **Hand off** – the payload is offered to the [`LinkHandle`]; only a
//!    Ready link writes it.
//! 6. **Record** – the send window is stamped per [`WindowPolicy`].
//!
//! Every outcome is counted in [`PipelineStats`] and published on the bus:
//! delivered payloads on [`Topic::Telemetry`], drops on [`Topic::Alerts`].
//!
//! Queued frames carry their arrival time, and the rate check runs against
//! it, so a frame that waited in the queue cannot slip past the window.
//!
//! [`PipelineRuntime`] wires the pipeline, the link actor and an optional
//! frame pump together and tears them down in order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use handeye_hal::{DepthSensor, LinkActor, LinkConfig, LinkHandle, LinkStats, SendOutcome};
use handeye_kernel::{DEFAULT_MIN_INTERVAL, RateLimiter, WindowPolicy};
use handeye_middleware::{BleTransport, EventBus, Topic, codec};
use handeye_perception::{aggregate, format_table, point_sample, quantize};
use handeye_types::{
    DepthFrame, DropReason, Event, EventPayload, HandEyeError, PeripheralState, TelemetryMessage,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const EVENT_SOURCE: &str = "handeye-runtime::pipeline";

/// Frames buffered between the source and the pipeline before new ones are
/// dropped.
pub const DEFAULT_FRAME_QUEUE: usize = 4;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Minimum spacing between two sends.
    pub min_send_interval: Duration,
    pub window_policy: WindowPolicy,
    /// Capacity of the frame channel.
    pub frame_queue: usize,
    pub link: LinkConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_send_interval: DEFAULT_MIN_INTERVAL,
            window_policy: WindowPolicy::default(),
            frame_queue: DEFAULT_FRAME_QUEUE,
            link: LinkConfig::default(),
        }
    }
}

/// A frame waiting for the pipeline, stamped when it entered the queue.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: DepthFrame,
    pub arrived: Instant,
}

impl QueuedFrame {
    /// Stamp `frame` with the current time of the Tokio clock.
    pub fn now(frame: DepthFrame) -> Self {
        Self {
            frame,
            arrived: tokio::time::Instant::now().into_std(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// What became of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The payload was handed to a Ready link.
    Sent(TelemetryMessage),
    RateLimited,
    /// No region had a positive depth.
    Degenerate,
    NotReady(PeripheralState),
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub sent: u64,
    pub rate_limited: u64,
    pub degenerate: u64,
    pub not_ready: u64,
    pub rejected: u64,
}

impl PipelineStats {
    fn count(&mut self, outcome: &FrameOutcome) {
        self.frames += 1;
        match outcome {
            FrameOutcome::Sent(_) => self.sent += 1,
            FrameOutcome::RateLimited => self.rate_limited += 1,
            FrameOutcome::Degenerate => self.degenerate += 1,
            FrameOutcome::NotReady(_) => self.not_ready += 1,
            FrameOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TelemetryPipeline
// ─────────────────────────────────────────────────────────────────────────────

pub struct TelemetryPipeline {
    limiter: RateLimiter,
    policy: WindowPolicy,
    link: LinkHandle,
    bus: EventBus,
    stats: PipelineStats,
}

impl TelemetryPipeline {
    pub fn new(config: &PipelineConfig, link: LinkHandle, bus: EventBus) -> Self {
        Self {
            limiter: RateLimiter::new(config.min_send_interval),
            policy: config.window_policy,
            link,
            bus,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Run one frame through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] when the link actor has stopped.
    /// Every other failure is a [`FrameOutcome`].
    pub async fn process_frame(
        &mut self,
        frame: &DepthFrame,
        now: Instant,
    ) -> Result<FrameOutcome, HandEyeError> {
        let grid = aggregate(frame);
        debug!(
            ts_ms = frame.timestamp().as_millis() as u64,
            sampled = %format_table(&point_sample(frame)),
            "depth frame"
        );

        let outcome = if !self.limiter.allows(now) {
            FrameOutcome::RateLimited
        } else {
            match quantize(&grid) {
                Ok(q) => {
                    let message = codec::encode(&q.grid);
                    debug!(scale_m = q.scale, payload = ?message.as_bytes(), "quantized grid");
                    let sent = self.link.send(message).await?;
                    if self.policy == WindowPolicy::AfterAttempt || sent.is_dispatched() {
                        self.limiter.record(now);
                    }
                    match sent {
                        SendOutcome::Dispatched => FrameOutcome::Sent(message),
                        SendOutcome::NotReady(state) => FrameOutcome::NotReady(state),
                        SendOutcome::Rejected(reason) => FrameOutcome::Rejected(reason),
                    }
                }
                Err(HandEyeError::DegenerateGrid { max }) => {
                    debug!(max, "degenerate grid, skipping send");
                    FrameOutcome::Degenerate
                }
                Err(e) => return Err(e),
            }
        };

        self.stats.count(&outcome);
        self.publish(&outcome);
        Ok(outcome)
    }

    /// Drain `frames` until every sender is gone or the link stops.
    pub async fn run(mut self, mut frames: mpsc::Receiver<QueuedFrame>) -> PipelineStats {
        while let Some(queued) = frames.recv().await {
            if let Err(e) = self.process_frame(&queued.frame, queued.arrived).await {
                warn!(error = %e, "link unavailable, stopping pipeline");
                break;
            }
        }
        info!(stats = ?self.stats, "telemetry pipeline stopped");
        self.stats
    }

    fn publish(&self, outcome: &FrameOutcome) {
        let (topic, payload) = match outcome {
            FrameOutcome::Sent(message) => (Topic::Telemetry, EventPayload::TelemetrySent(*message)),
            FrameOutcome::RateLimited => (Topic::Alerts, EventPayload::FrameDropped(DropReason::RateLimited)),
            FrameOutcome::Degenerate => (
                Topic::Alerts,
                EventPayload::FrameDropped(DropReason::DegenerateGrid),
            ),
            FrameOutcome::NotReady(state) => (
                Topic::Alerts,
                EventPayload::FrameDropped(DropReason::NotReady(*state)),
            ),
            FrameOutcome::Rejected(reason) => (
                Topic::Alerts,
                EventPayload::FrameDropped(DropReason::TransportRejected(reason.clone())),
            ),
        };
        let _ = self.bus.publish_to(topic, Event::new(EVENT_SOURCE, payload));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame pump
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub captured: u64,
    /// Frames discarded because the queue was full.
    pub dropped: u64,
    pub capture_errors: u64,
}

/// Capture period for `fps`, rejecting rates whose period is zero or does
/// not fit in a [`Duration`].
fn frame_period(fps: f64) -> Result<Duration, HandEyeError> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(HandEyeError::Config(format!("frame rate must be positive, got {fps}")));
    }
    Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|period| !period.is_zero())
        .ok_or_else(|| HandEyeError::Config(format!("frame rate {fps} is out of range")))
}

/// Poll `sensor` at `fps` and push frames into `frames` without blocking.
///
/// The sensor is told the capture period before the first frame.  The pump
/// stops when `stop` flips to `true` or the receiver is gone.
///
/// # Errors
///
/// Returns [`HandEyeError::Config`] unless `fps` is a positive finite number
/// with a non-zero, representable period.
pub fn spawn_frame_pump(
    mut sensor: Box<dyn DepthSensor>,
    fps: f64,
    frames: mpsc::Sender<QueuedFrame>,
    mut stop: watch::Receiver<bool>,
) -> Result<JoinHandle<PumpStats>, HandEyeError> {
    let period = frame_period(fps)?;
    sensor.set_frame_period(period);

    Ok(tokio::spawn(async move {
        let mut stats = PumpStats::default();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(sensor = sensor.id(), fps, "frame pump started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let frame = match sensor.capture() {
                Ok(frame) => frame,
                Err(e) => {
                    stats.capture_errors += 1;
                    warn!(sensor = sensor.id(), error = %e, "frame capture failed");
                    continue;
                }
            };
            stats.captured += 1;
            match frames.try_send(QueuedFrame::now(frame)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    debug!("frame queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }

        info!(?stats, "frame pump stopped");
        stats
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// PipelineRuntime
// ─────────────────────────────────────────────────────────────────────────────

/// Final counters of a [`PipelineRuntime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeReport {
    pub pipeline: PipelineStats,
    pub link: LinkStats,
    pub pump: Option<PumpStats>,
}

/// The process-wide pipeline: constructed once, shut down once.
pub struct PipelineRuntime {
    frames: mpsc::Sender<QueuedFrame>,
    link: LinkHandle,
    link_task: JoinHandle<LinkStats>,
    pipeline_task: JoinHandle<PipelineStats>,
    pump: Option<(watch::Sender<bool>, JoinHandle<PumpStats>)>,
}

impl PipelineRuntime {
    /// Start the link actor and the pipeline task on the current runtime.
    pub fn start(config: PipelineConfig, transport: Arc<dyn BleTransport>, bus: EventBus) -> Self {
        let (link, link_task) = LinkActor::spawn(config.link.clone(), transport, bus.clone());
        let (frames, rx) = mpsc::channel(config.frame_queue.max(1));
        let pipeline = TelemetryPipeline::new(&config, link.clone(), bus);
        let pipeline_task = tokio::spawn(pipeline.run(rx));
        info!(
            min_send_interval_ms = config.min_send_interval.as_millis() as u64,
            window_policy = ?config.window_policy,
            "telemetry pipeline started"
        );
        Self {
            frames,
            link,
            link_task,
            pipeline_task,
            pump: None,
        }
    }

    /// Offer a frame without waiting.  Returns `false` if the queue was full
    /// (or the pipeline has stopped) and the frame was dropped.
    pub fn submit(&self, frame: DepthFrame) -> bool {
        match self.frames.try_send(QueuedFrame::now(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("frame queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Feed the pipeline from `sensor` at `fps` until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Config`] for an invalid frame rate or when a
    /// sensor is already attached.
    pub fn attach_sensor(&mut self, sensor: Box<dyn DepthSensor>, fps: f64) -> Result<(), HandEyeError> {
        if self.pump.is_some() {
            return Err(HandEyeError::Config("a depth sensor is already attached".to_string()));
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = spawn_frame_pump(sensor, fps, self.frames.clone(), stop_rx)?;
        self.pump = Some((stop_tx, task));
        Ok(())
    }

    /// Stop the pump, drain queued frames, release the peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] if one of the tasks panicked.
    pub async fn shutdown(self) -> Result<RuntimeReport, HandEyeError> {
        let pump = match self.pump {
            Some((stop, task)) => {
                let _ = stop.send(true);
                Some(task.await.map_err(join_error)?)
            }
            None => None,
        };

        drop(self.frames);
        let pipeline = self.pipeline_task.await.map_err(join_error)?;

        // The actor may already be gone if the pipeline stopped on a closed link.
        let _ = self.link.shutdown().await;
        let link = self.link_task.await.map_err(join_error)?;

        Ok(RuntimeReport {
            pipeline,
            link,
            pump,
        })
    }
}

fn join_error(e: tokio::task::JoinError) -> HandEyeError {
    HandEyeError::Channel(format!("task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use handeye_hal::SimDepthSensor;
    use handeye_middleware::{SimPeripheral, SimTransport};
    use handeye_types::layout;

    const W: usize = 12;
    const H: usize = 9;

    fn frame(depth_at: impl FnMut(usize, usize) -> f32) -> DepthFrame {
        DepthFrame::from_fn(W, H, Duration::ZERO, depth_at).unwrap()
    }

    async fn ready_link(radio: &Arc<SimTransport>, bus: &EventBus) -> LinkHandle {
        let transport: Arc<dyn BleTransport> = radio.clone();
        let (link, _task) = LinkActor::spawn(LinkConfig::default(), transport, bus.clone());
        for _ in 0..200 {
            if link.snapshot().await.unwrap().state.is_ready() {
                return link;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("link never became ready");
    }

    fn handeye_radio() -> Arc<SimTransport> {
        Arc::new(SimTransport::new(true).with_peripheral(SimPeripheral::handeye("aa")))
    }

    #[tokio::test(start_paused = true)]
    async fn uniform_frame_sends_nine_full_bytes() {
        let radio = handeye_radio();
        let bus = EventBus::default();
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);
        let link = ready_link(&radio, &bus).await;
        let mut pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);

        let t0 = std::time::Instant::now();
        let outcome = pipeline.process_frame(&frame(|_, _| 2.0), t0).await.unwrap();

        assert_eq!(outcome, FrameOutcome::Sent(TelemetryMessage::new([255; 9])));
        assert_eq!(radio.writes()[0].payload, vec![255; 9]);
        let event = telemetry.try_recv().unwrap();
        assert!(matches!(event.payload, EventPayload::TelemetrySent(m) if m.as_bytes() == &[255; 9]));
    }

    #[tokio::test(start_paused = true)]
    async fn nearest_region_scales_others() {
        let radio = handeye_radio();
        let bus = EventBus::default();
        let link = ready_link(&radio, &bus).await;
        let mut pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);

        // Bottom-left third at 4 m, the rest at 1 m.
        let f = frame(|x, y| if x < W / 3 && y >= 2 * H / 3 { 4.0 } else { 1.0 });
        let outcome = pipeline.process_frame(&f, std::time::Instant::now()).await.unwrap();

        let mut expected = [64u8; 9];
        expected[layout::BOTTOM_LEFT] = 255;
        assert_eq!(outcome, FrameOutcome::Sent(TelemetryMessage::new(expected)));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_inside_window_are_rate_limited() {
        let radio = handeye_radio();
        let bus = EventBus::default();
        let link = ready_link(&radio, &bus).await;
        let mut pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);
        let f = frame(|_, _| 1.0);
        let t0 = std::time::Instant::now();

        assert!(matches!(pipeline.process_frame(&f, t0).await.unwrap(), FrameOutcome::Sent(_)));
        assert_eq!(
            pipeline.process_frame(&f, t0 + Duration::from_millis(500)).await.unwrap(),
            FrameOutcome::RateLimited
        );
        assert!(matches!(
            pipeline.process_frame(&f, t0 + Duration::from_millis(1001)).await.unwrap(),
            FrameOutcome::Sent(_)
        ));
        assert_eq!(radio.writes().len(), 2);
        assert_eq!(pipeline.stats().rate_limited, 1);
        assert_eq!(pipeline.stats().frames, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn degenerate_frame_leaves_window_open() {
        let radio = handeye_radio();
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let link = ready_link(&radio, &bus).await;
        let mut pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);
        let t0 = std::time::Instant::now();

        let blank = frame(|_, _| f32::NAN);
        assert_eq!(pipeline.process_frame(&blank, t0).await.unwrap(), FrameOutcome::Degenerate);
        assert!(radio.writes().is_empty());
        assert!(matches!(
            alerts.try_recv().unwrap().payload,
            EventPayload::FrameDropped(DropReason::DegenerateGrid)
        ));

        let wall = frame(|_, _| 2.0);
        assert!(matches!(pipeline.process_frame(&wall, t0).await.unwrap(), FrameOutcome::Sent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_attempt_consumes_window_by_default() {
        let radio = Arc::new(SimTransport::new(false));
        let transport: Arc<dyn BleTransport> = radio.clone();
        let bus = EventBus::default();
        let (link, _task) = LinkActor::spawn(LinkConfig::default(), transport, bus.clone());
        let mut pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);
        let f = frame(|_, _| 1.0);
        let t0 = std::time::Instant::now();

        assert_eq!(
            pipeline.process_frame(&f, t0).await.unwrap(),
            FrameOutcome::NotReady(PeripheralState::Disconnected)
        );
        assert_eq!(
            pipeline.process_frame(&f, t0 + Duration::from_millis(500)).await.unwrap(),
            FrameOutcome::RateLimited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn after_delivery_policy_keeps_window_open_when_not_ready() {
        let radio = Arc::new(SimTransport::new(false));
        let transport: Arc<dyn BleTransport> = radio.clone();
        let bus = EventBus::default();
        let (link, _task) = LinkActor::spawn(LinkConfig::default(), transport, bus.clone());
        let config = PipelineConfig {
            window_policy: WindowPolicy::AfterDelivery,
            ..PipelineConfig::default()
        };
        let mut pipeline = TelemetryPipeline::new(&config, link, bus);
        let f = frame(|_, _| 1.0);
        let t0 = std::time::Instant::now();

        for offset in [0, 100, 200] {
            assert!(matches!(
                pipeline.process_frame(&f, t0 + Duration::from_millis(offset)).await.unwrap(),
                FrameOutcome::NotReady(_)
            ));
        }
        assert_eq!(pipeline.stats().not_ready, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_streams_simulated_sensor_end_to_end() {
        let radio = handeye_radio();
        let transport: Arc<dyn BleTransport> = radio.clone();
        let mut runtime = PipelineRuntime::start(PipelineConfig::default(), transport, EventBus::default());
        runtime
            .attach_sensor(Box::new(SimDepthSensor::new("sim", 32, 24)), 30.0)
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let report = runtime.shutdown().await.unwrap();

        assert!(report.pipeline.frames > 0);
        assert!(report.pipeline.sent >= 2);
        assert!(report.pipeline.rate_limited > 0);
        assert_eq!(report.link.writes_dispatched, report.pipeline.sent);
        assert_eq!(radio.writes().len() as u64, report.pipeline.sent);
        assert!(report.pump.unwrap().captured > 0);
        assert!(radio.connected().is_none());
    }

    #[tokio::test]
    async fn pump_rejects_invalid_frame_rate() {
        for fps in [0.0, -5.0, f64::NAN, f64::INFINITY, 1e12, 1e-300] {
            let (tx, _rx) = mpsc::channel(1);
            let (_stop_tx, stop_rx) = watch::channel(false);
            let result = spawn_frame_pump(Box::new(SimDepthSensor::new("sim", 4, 4)), fps, tx, stop_rx);
            assert!(matches!(result, Err(HandEyeError::Config(_))), "fps {fps} accepted");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pump_stamps_frames_at_its_own_rate() {
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let sensor = SimDepthSensor::new("sim", 6, 6);
        let pump = spawn_frame_pump(Box::new(sensor), 10.0, tx, stop_rx).unwrap();

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(b.frame.timestamp() - a.frame.timestamp(), Duration::from_millis(100));
        assert!(b.arrived > a.arrived);

        stop_tx.send(true).unwrap();
        assert!(pump.await.unwrap().captured >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_frames_drop_when_queue_is_full() {
        let radio = handeye_radio();
        let transport: Arc<dyn BleTransport> = radio.clone();
        let config = PipelineConfig {
            frame_queue: 2,
            ..PipelineConfig::default()
        };
        let runtime = PipelineRuntime::start(config, transport, EventBus::default());
        for _ in 0..200 {
            if runtime.link().snapshot().await.unwrap().state.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(runtime.link().snapshot().await.unwrap().state.is_ready());

        // No await between submissions, so the pipeline task cannot drain.
        let wall = || frame(|_, _| 2.0);
        assert!(runtime.submit(wall()));
        assert!(runtime.submit(wall()));
        assert!(!runtime.submit(wall()));

        let report = runtime.shutdown().await.unwrap();
        assert_eq!(report.pipeline.frames, 2);
        assert_eq!(report.pipeline.sent, 1);
        // Both frames arrived at the same instant, so the second one is inside the window.
        assert_eq!(report.pipeline.rate_limited, 1);
        assert_eq!(report.link.writes_dispatched, 1);
        assert_eq!(radio.writes().len(), 1);
        assert!(report.pump.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_frames_are_rate_checked_at_arrival() {
        let radio = handeye_radio();
        let bus = EventBus::default();
        let link = ready_link(&radio, &bus).await;
        let pipeline = TelemetryPipeline::new(&PipelineConfig::default(), link, bus);
        let (tx, rx) = mpsc::channel(4);
        let t0 = std::time::Instant::now();

        // The second frame arrived inside the window; processing it later must not let it through.
        for offset in [0, 500] {
            let queued = QueuedFrame {
                frame: frame(|_, _| 1.0),
                arrived: t0 + Duration::from_millis(offset),
            };
            tx.send(queued).await.unwrap();
        }
        drop(tx);

        let stats = pipeline.run(rx).await;
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.rate_limited, 1);
    }
}
