//! [`PeripheralSession`] – connection lifecycle of the single telemetry peripheral.
//!
//! The session is a pure state machine.  It never touches the radio itself:
//! every input ([`TransportEvent`], a send attempt, a timer tick) returns the
//! [`Request`]s the caller must submit to the [`BleTransport`].  The
//! [`LinkActor`][crate::link::LinkActor] is the only owner in production.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──radio on──▶ Scanning ──match──▶ Connecting ──▶ Connected
//!      ▲                                                            │
//!      │ failure / timeout / link loss            DiscoveringServices
//!      │ (backoff, then rescan)                                     │
//!      └──────────────── Ready ◀── DiscoveringCharacteristics ◀─────┘
//! ```
//!
//! Every transition into `Disconnected` clears the peripheral handles and
//! advances the [`Epoch`]; callbacks still in flight for the abandoned
//! attempt are recognised by their old epoch and dropped.

use std::time::{Duration, Instant};

use handeye_kernel::{Backoff, ReconnectPolicy};
use handeye_middleware::{
    Advertisement, BleTransport, CharacteristicInfo, Epoch, PeripheralId, ScanFilter,
    TransportEvent,
};
use handeye_types::{HandEyeError, PeripheralState, PeripheralTarget, TelemetryMessage, WriteMode};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline for each connection step once a candidate was picked.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the timer that evaluates step deadlines and backoff.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Everything the link needs to find and talk to its peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub target: PeripheralTarget,
    pub write_mode: WriteMode,
    /// Applies to Connecting, Connected and both discovery states.
    pub step_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub tick_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: PeripheralTarget::default(),
            write_mode: WriteMode::default(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session outputs
// ────────────────────────────────────────────────────────────────────────────

/// A transport operation the session wants performed.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    StartScan {
        filter: ScanFilter,
        epoch: Epoch,
    },
    StopScan,
    Connect {
        peripheral: PeripheralId,
        epoch: Epoch,
    },
    Disconnect {
        peripheral: PeripheralId,
    },
    DiscoverServices {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
        epoch: Epoch,
    },
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        epoch: Epoch,
    },
    Write {
        peripheral: PeripheralId,
        characteristic: Uuid,
        message: TelemetryMessage,
        mode: WriteMode,
        epoch: Epoch,
    },
}

impl Request {
    /// Hand this request to `transport`.
    ///
    /// # Errors
    ///
    /// Propagates the transport's refusal unchanged.
    pub async fn submit(&self, transport: &dyn BleTransport) -> Result<(), HandEyeError> {
        match self {
            Request::StartScan { filter, epoch } => transport.start_scan(filter.clone(), *epoch).await,
            Request::StopScan => transport.stop_scan().await,
            Request::Connect { peripheral, epoch } => transport.connect(peripheral, *epoch).await,
            Request::Disconnect { peripheral } => transport.disconnect(peripheral).await,
            Request::DiscoverServices {
                peripheral,
                services,
                epoch,
            } => transport.discover_services(peripheral, services, *epoch).await,
            Request::DiscoverCharacteristics {
                peripheral,
                service,
                characteristics,
                epoch,
            } => {
                transport
                    .discover_characteristics(peripheral, *service, characteristics, *epoch)
                    .await
            }
            Request::Write {
                peripheral,
                characteristic,
                message,
                mode,
                epoch,
            } => {
                transport
                    .write(peripheral, *characteristic, message.as_bytes(), *mode, *epoch)
                    .await
            }
        }
    }

    fn epoch(&self) -> Option<Epoch> {
        match self {
            Request::StartScan { epoch, .. }
            | Request::Connect { epoch, .. }
            | Request::DiscoverServices { epoch, .. }
            | Request::DiscoverCharacteristics { epoch, .. }
            | Request::Write { epoch, .. } => Some(*epoch),
            Request::StopScan | Request::Disconnect { .. } => None,
        }
    }
}

/// Result of offering one telemetry payload to the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The write was submitted to the transport.
    Dispatched,
    /// The link was not Ready; the payload was dropped.
    NotReady(PeripheralState),
    /// The transport refused the write submission.
    Rejected(String),
}

impl SendOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, SendOutcome::Dispatched)
    }
}

/// What [`PeripheralSession::send`] decided plus the requests to carry it out.
#[derive(Debug, Clone, PartialEq)]
pub struct SendPlan {
    pub outcome: SendOutcome,
    pub requests: Vec<Request>,
}

/// Observable happenings the owner forwards to the event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    StateChanged {
        from: PeripheralState,
        to: PeripheralState,
    },
    Discovered(Advertisement),
}

/// Link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub writes_dispatched: u64,
    pub writes_confirmed: u64,
    pub writes_failed: u64,
    /// Payloads offered while the link was not Ready.
    pub sends_dropped: u64,
    pub connections: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// PeripheralSession
// ────────────────────────────────────────────────────────────────────────────

pub struct PeripheralSession {
    config: LinkConfig,
    state: PeripheralState,
    epoch: Epoch,
    radio_powered: bool,
    peripheral: Option<PeripheralId>,
    characteristic: Option<CharacteristicInfo>,
    step_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    backoff: Backoff,
    stats: LinkStats,
    notices: Vec<SessionNotice>,
}

impl PeripheralSession {
    /// A session in `Disconnected`, waiting for the radio to report in.
    pub fn new(config: LinkConfig) -> Self {
        let backoff = Backoff::new(config.reconnect);
        Self {
            config,
            state: PeripheralState::Disconnected,
            epoch: Epoch::default(),
            radio_powered: false,
            peripheral: None,
            characteristic: None,
            step_deadline: None,
            retry_at: None,
            backoff,
            stats: LinkStats::default(),
            notices: Vec::new(),
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn peripheral(&self) -> Option<&PeripheralId> {
        self.peripheral.as_ref()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// When the next automatic scan is due, if one is scheduled.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Take the notices accumulated since the last call.
    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Feed one transport callback.
    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) -> Vec<Request> {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch {
                debug!(%epoch, current = %self.epoch, "ignoring stale transport callback");
                return Vec::new();
            }
        }

        match event {
            TransportEvent::RadioState { powered } => self.on_radio_state(powered, now),
            TransportEvent::Discovered { advertisement, .. } => self.on_discovered(advertisement, now),
            TransportEvent::Connected { peripheral, .. } => self.on_connected(peripheral, now),
            TransportEvent::ConnectFailed {
                peripheral, reason, ..
            } => {
                if self.state != PeripheralState::Connecting || !self.is_current(&peripheral) {
                    return Vec::new();
                }
                self.fail_attempt(&format!("connect failed: {reason}"), false, now)
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
                ..
            } => self.on_services(peripheral, services, now),
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
                ..
            } => self.on_characteristics(peripheral, service, characteristics, now),
            TransportEvent::Disconnected {
                peripheral, reason, ..
            } => {
                if self.state != PeripheralState::Disconnected {
                    warn!(
                        %peripheral,
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "peripheral link lost"
                    );
                    self.enter_disconnected(now);
                }
                Vec::new()
            }
            TransportEvent::WriteResult {
                peripheral, result, ..
            } => {
                match result {
                    Ok(()) => self.stats.writes_confirmed += 1,
                    Err(reason) => {
                        self.stats.writes_failed += 1;
                        warn!(%peripheral, %reason, "telemetry write failed");
                    }
                }
                Vec::new()
            }
        }
    }

    /// Offer one payload.  Only a Ready link produces a write.
    ///
    /// When reconnect attempts are exhausted, a send attempt restarts
    /// discovery with a fresh backoff.
    pub fn send(&mut self, message: TelemetryMessage, now: Instant) -> SendPlan {
        if self.state.is_ready() {
            if let (Some(peripheral), Some(characteristic)) =
                (self.peripheral.clone(), self.characteristic)
            {
                self.stats.writes_dispatched += 1;
                return SendPlan {
                    outcome: SendOutcome::Dispatched,
                    requests: vec![Request::Write {
                        peripheral,
                        characteristic: characteristic.uuid,
                        message,
                        mode: self.config.write_mode,
                        epoch: self.epoch,
                    }],
                };
            }
        }

        let state = self.state;
        self.stats.sends_dropped += 1;
        debug!(%state, "peripheral not ready, dropping telemetry");

        let mut requests = Vec::new();
        if state == PeripheralState::Disconnected
            && self.retry_at.is_none()
            && self.backoff.is_exhausted()
        {
            info!("reconnect attempts exhausted earlier, restarting discovery");
            self.backoff.reset();
            requests = self.begin_scan(now);
        }
        SendPlan {
            outcome: SendOutcome::NotReady(state),
            requests,
        }
    }

    /// Evaluate step deadlines and due rescans.
    pub fn tick(&mut self, now: Instant) -> Vec<Request> {
        match self.state {
            PeripheralState::Connecting
            | PeripheralState::Connected
            | PeripheralState::DiscoveringServices
            | PeripheralState::DiscoveringCharacteristics => {
                if self.step_deadline.is_some_and(|deadline| now >= deadline) {
                    let step = self.state;
                    return self.fail_attempt(&format!("{step} timed out"), true, now);
                }
                Vec::new()
            }
            PeripheralState::Disconnected => {
                if self.retry_at.is_some_and(|at| now >= at) {
                    self.begin_scan(now)
                } else {
                    Vec::new()
                }
            }
            PeripheralState::Scanning | PeripheralState::Ready => Vec::new(),
        }
    }

    /// The transport refused to accept `request`.
    pub fn request_failed(&mut self, request: &Request, reason: &str, now: Instant) -> Vec<Request> {
        if request.epoch().is_some_and(|epoch| epoch != self.epoch) {
            return Vec::new();
        }
        match request {
            Request::StartScan { .. } => {
                warn!(%reason, "scan could not be started");
                self.enter_disconnected(now);
                Vec::new()
            }
            Request::Connect { .. }
            | Request::DiscoverServices { .. }
            | Request::DiscoverCharacteristics { .. } => self.fail_attempt(reason, true, now),
            Request::Write { .. } => {
                self.stats.writes_failed += 1;
                warn!(%reason, "telemetry write refused by transport");
                Vec::new()
            }
            Request::StopScan | Request::Disconnect { .. } => {
                debug!(?request, %reason, "housekeeping request refused");
                Vec::new()
            }
        }
    }

    // ── transitions ─────────────────────────────────────────────────────────

    fn on_radio_state(&mut self, powered: bool, now: Instant) -> Vec<Request> {
        self.radio_powered = powered;
        if powered {
            info!("radio powered on");
            if self.state == PeripheralState::Disconnected {
                self.backoff.reset();
                return self.begin_scan(now);
            }
        } else {
            warn!("radio unavailable");
            if self.state != PeripheralState::Disconnected {
                self.enter_disconnected(now);
            }
            self.retry_at = None;
        }
        Vec::new()
    }

    fn on_discovered(&mut self, advertisement: Advertisement, now: Instant) -> Vec<Request> {
        if self.state != PeripheralState::Scanning {
            return Vec::new();
        }
        info!(
            peripheral = %advertisement.peripheral,
            name = advertisement.name.as_deref().unwrap_or("<unnamed>"),
            rssi = ?advertisement.rssi,
            services = ?advertisement.services,
            "discovered peripheral"
        );
        let matched = self.matches_target(&advertisement);
        let peripheral = advertisement.peripheral.clone();
        self.notices.push(SessionNotice::Discovered(advertisement));
        if !matched {
            return Vec::new();
        }

        self.peripheral = Some(peripheral.clone());
        self.set_state(PeripheralState::Connecting);
        self.step_deadline = Some(now + self.config.step_timeout);
        vec![
            Request::StopScan,
            Request::Connect {
                peripheral,
                epoch: self.epoch,
            },
        ]
    }

    fn on_connected(&mut self, peripheral: PeripheralId, now: Instant) -> Vec<Request> {
        if self.state != PeripheralState::Connecting || !self.is_current(&peripheral) {
            return Vec::new();
        }
        self.stats.connections += 1;
        self.set_state(PeripheralState::Connected);
        self.set_state(PeripheralState::DiscoveringServices);
        self.step_deadline = Some(now + self.config.step_timeout);
        vec![Request::DiscoverServices {
            peripheral,
            services: vec![self.config.target.service],
            epoch: self.epoch,
        }]
    }

    fn on_services(&mut self, peripheral: PeripheralId, services: Vec<Uuid>, now: Instant) -> Vec<Request> {
        if self.state != PeripheralState::DiscoveringServices || !self.is_current(&peripheral) {
            return Vec::new();
        }
        let service = self.config.target.service;
        if !services.contains(&service) {
            return self.fail_attempt(&format!("service {service} not offered"), true, now);
        }
        self.set_state(PeripheralState::DiscoveringCharacteristics);
        self.step_deadline = Some(now + self.config.step_timeout);
        vec![Request::DiscoverCharacteristics {
            peripheral,
            service,
            characteristics: vec![self.config.target.characteristic],
            epoch: self.epoch,
        }]
    }

    fn on_characteristics(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
        now: Instant,
    ) -> Vec<Request> {
        if self.state != PeripheralState::DiscoveringCharacteristics
            || !self.is_current(&peripheral)
            || service != self.config.target.service
        {
            return Vec::new();
        }
        let wanted = self.config.target.characteristic;
        let Some(characteristic) = characteristics.into_iter().find(|c| c.uuid == wanted) else {
            return self.fail_attempt(&format!("characteristic {wanted} not offered"), true, now);
        };
        if !characteristic.supports(self.config.write_mode) {
            warn!(
                characteristic = %wanted,
                mode = ?self.config.write_mode,
                "characteristic does not advertise the configured write mode"
            );
        }
        self.characteristic = Some(characteristic);
        self.step_deadline = None;
        self.backoff.reset();
        self.set_state(PeripheralState::Ready);
        info!(%peripheral, characteristic = %wanted, "peripheral ready for telemetry");
        Vec::new()
    }

    fn begin_scan(&mut self, now: Instant) -> Vec<Request> {
        self.retry_at = None;
        if !self.radio_powered {
            debug!(at = ?now, "radio off, postponing scan");
            return Vec::new();
        }
        self.epoch = self.epoch.next();
        self.set_state(PeripheralState::Scanning);
        vec![Request::StartScan {
            filter: self.scan_filter(),
            epoch: self.epoch,
        }]
    }

    /// Abandon the current attempt and schedule a retry.
    fn fail_attempt(&mut self, reason: &str, disconnect: bool, now: Instant) -> Vec<Request> {
        warn!(%reason, state = %self.state, epoch = %self.epoch, "connection attempt failed");
        let requests = match (&self.peripheral, disconnect) {
            (Some(peripheral), true) => vec![Request::Disconnect {
                peripheral: peripheral.clone(),
            }],
            _ => Vec::new(),
        };
        self.enter_disconnected(now);
        requests
    }

    fn enter_disconnected(&mut self, now: Instant) {
        self.peripheral = None;
        self.characteristic = None;
        self.step_deadline = None;
        self.epoch = self.epoch.next();
        self.set_state(PeripheralState::Disconnected);
        self.schedule_retry(now);
    }

    fn schedule_retry(&mut self, now: Instant) {
        if !self.radio_powered {
            self.retry_at = None;
            return;
        }
        self.retry_at = match self.backoff.next_delay() {
            Some(delay) => Some(now + delay),
            None => {
                warn!(
                    attempts = self.backoff.attempts(),
                    "reconnect attempts exhausted, waiting for the next send"
                );
                None
            }
        };
    }

    fn set_state(&mut self, to: PeripheralState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!(%from, %to, epoch = %self.epoch, "link state changed");
        self.notices.push(SessionNotice::StateChanged { from, to });
    }

    fn matches_target(&self, advertisement: &Advertisement) -> bool {
        match &self.config.target.name {
            Some(name) => advertisement.name.as_deref() == Some(name.as_str()),
            None => advertisement.services.contains(&self.config.target.service),
        }
    }

    fn scan_filter(&self) -> ScanFilter {
        match self.config.target.name {
            Some(_) => ScanFilter::Unrestricted,
            None => ScanFilter::Services(vec![self.config.target.service]),
        }
    }

    fn is_current(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(peripheral)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handeye_types::{DEFAULT_CHARACTERISTIC_UUID, DEFAULT_PERIPHERAL_NAME, DEFAULT_SERVICE_UUID};

    const MS: Duration = Duration::from_millis(1);

    fn device() -> PeripheralId {
        PeripheralId("24:6f:28:aa:bb:cc".to_string())
    }

    fn advert(name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            peripheral: device(),
            name: name.map(str::to_string),
            rssi: Some(-61),
            services,
        }
    }

    fn handeye_advert() -> Advertisement {
        advert(Some(DEFAULT_PERIPHERAL_NAME), vec![DEFAULT_SERVICE_UUID])
    }

    fn writable() -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: DEFAULT_CHARACTERISTIC_UUID,
            write: true,
            write_without_response: true,
        }
    }

    /// Drive a fresh session from power-on to Ready.
    fn ready_session(t0: Instant) -> PeripheralSession {
        let mut s = PeripheralSession::new(LinkConfig::default());
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        let e = s.epoch();
        s.handle_event(
            TransportEvent::Discovered {
                epoch: e,
                advertisement: handeye_advert(),
            },
            t0,
        );
        s.handle_event(
            TransportEvent::Connected {
                epoch: e,
                peripheral: device(),
            },
            t0,
        );
        s.handle_event(
            TransportEvent::ServicesDiscovered {
                epoch: e,
                peripheral: device(),
                services: vec![DEFAULT_SERVICE_UUID],
            },
            t0,
        );
        s.handle_event(
            TransportEvent::CharacteristicsDiscovered {
                epoch: e,
                peripheral: device(),
                service: DEFAULT_SERVICE_UUID,
                characteristics: vec![writable()],
            },
            t0,
        );
        s
    }

    #[test]
    fn radio_on_starts_unrestricted_scan_when_name_is_set() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        let reqs = s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        assert_eq!(s.state(), PeripheralState::Scanning);
        assert_eq!(
            reqs,
            vec![Request::StartScan {
                filter: ScanFilter::Unrestricted,
                epoch: Epoch(1)
            }]
        );
    }

    #[test]
    fn without_name_scan_is_restricted_to_service() {
        let t0 = Instant::now();
        let mut config = LinkConfig::default();
        config.target.name = None;
        let mut s = PeripheralSession::new(config);
        let reqs = s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        assert_eq!(
            reqs,
            vec![Request::StartScan {
                filter: ScanFilter::Services(vec![DEFAULT_SERVICE_UUID]),
                epoch: Epoch(1)
            }]
        );

        // An unnamed advertiser of the service is accepted.
        let reqs = s.handle_event(
            TransportEvent::Discovered {
                epoch: s.epoch(),
                advertisement: advert(None, vec![DEFAULT_SERVICE_UUID]),
            },
            t0,
        );
        assert_eq!(s.state(), PeripheralState::Connecting);
        assert_eq!(reqs.len(), 2);
    }

    #[test]
    fn name_filter_ignores_other_advertisers() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        let reqs = s.handle_event(
            TransportEvent::Discovered {
                epoch: s.epoch(),
                advertisement: advert(Some("Headphones"), vec![DEFAULT_SERVICE_UUID]),
            },
            t0,
        );
        assert!(reqs.is_empty());
        assert_eq!(s.state(), PeripheralState::Scanning);
        assert!(
            s.drain_notices()
                .iter()
                .any(|n| matches!(n, SessionNotice::Discovered(_)))
        );
    }

    #[test]
    fn radio_off_stays_disconnected() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        let reqs = s.handle_event(TransportEvent::RadioState { powered: false }, t0);
        assert!(reqs.is_empty());
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert!(s.tick(t0 + Duration::from_secs(60)).is_empty());

        let reqs = s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        assert_eq!(s.state(), PeripheralState::Scanning);
        assert_eq!(reqs.len(), 1);
    }

    #[test]
    fn handshake_reaches_ready_and_writes() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        assert_eq!(s.state(), PeripheralState::Ready);
        assert_eq!(s.peripheral(), Some(&device()));

        let states: Vec<PeripheralState> = s
            .drain_notices()
            .into_iter()
            .filter_map(|n| match n {
                SessionNotice::StateChanged { to, .. } => Some(to),
                SessionNotice::Discovered(_) => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                PeripheralState::Scanning,
                PeripheralState::Connecting,
                PeripheralState::Connected,
                PeripheralState::DiscoveringServices,
                PeripheralState::DiscoveringCharacteristics,
                PeripheralState::Ready,
            ]
        );

        let msg = TelemetryMessage::new([255; 9]);
        let plan = s.send(msg, t0);
        assert_eq!(plan.outcome, SendOutcome::Dispatched);
        assert_eq!(
            plan.requests,
            vec![Request::Write {
                peripheral: device(),
                characteristic: DEFAULT_CHARACTERISTIC_UUID,
                message: msg,
                mode: WriteMode::WithResponse,
                epoch: s.epoch(),
            }]
        );
        assert_eq!(s.stats().writes_dispatched, 1);
        assert_eq!(s.stats().connections, 1);
    }

    #[test]
    fn write_results_are_counted() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        for result in [Ok(()), Ok(()), Err("gatt error 0x0e".to_string())] {
            s.handle_event(
                TransportEvent::WriteResult {
                    epoch: s.epoch(),
                    peripheral: device(),
                    characteristic: DEFAULT_CHARACTERISTIC_UUID,
                    result,
                },
                t0,
            );
        }
        assert_eq!(s.stats().writes_confirmed, 2);
        assert_eq!(s.stats().writes_failed, 1);
    }

    #[test]
    fn disconnect_while_ready_makes_sends_not_ready() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        let before = s.epoch();
        s.handle_event(
            TransportEvent::Disconnected {
                epoch: before,
                peripheral: device(),
                reason: None,
            },
            t0,
        );
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert!(s.peripheral().is_none());
        assert!(s.epoch() > before);

        let plan = s.send(TelemetryMessage::new([1; 9]), t0);
        assert_eq!(plan.outcome, SendOutcome::NotReady(PeripheralState::Disconnected));
        assert!(plan.requests.is_empty());
        assert_eq!(s.stats().sends_dropped, 1);
    }

    #[test]
    fn stale_callbacks_after_rescan_are_ignored() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        let old = s.epoch();
        s.handle_event(
            TransportEvent::Disconnected {
                epoch: old,
                peripheral: device(),
                reason: Some("supervision timeout".to_string()),
            },
            t0,
        );

        // Rescan after the first backoff delay.
        let reqs = s.tick(t0 + 500 * MS);
        assert_eq!(s.state(), PeripheralState::Scanning);
        assert!(matches!(reqs[..], [Request::StartScan { .. }]));

        for stale in [
            TransportEvent::Connected {
                epoch: old,
                peripheral: device(),
            },
            TransportEvent::Discovered {
                epoch: old,
                advertisement: handeye_advert(),
            },
            TransportEvent::Disconnected {
                epoch: old,
                peripheral: device(),
                reason: None,
            },
        ] {
            assert!(s.handle_event(stale, t0 + 600 * MS).is_empty());
            assert_eq!(s.state(), PeripheralState::Scanning);
        }
    }

    #[test]
    fn reconnect_waits_for_backoff() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        s.handle_event(
            TransportEvent::Disconnected {
                epoch: s.epoch(),
                peripheral: device(),
                reason: None,
            },
            t0,
        );
        assert_eq!(s.retry_at(), Some(t0 + 500 * MS));
        assert!(s.tick(t0 + 499 * MS).is_empty());
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert_eq!(s.tick(t0 + 500 * MS).len(), 1);
    }

    #[test]
    fn step_timeout_disconnects_and_schedules_retry() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        s.handle_event(
            TransportEvent::Discovered {
                epoch: s.epoch(),
                advertisement: handeye_advert(),
            },
            t0,
        );
        assert_eq!(s.state(), PeripheralState::Connecting);

        assert!(s.tick(t0 + Duration::from_secs(9)).is_empty());
        let reqs = s.tick(t0 + DEFAULT_STEP_TIMEOUT);
        assert_eq!(reqs, vec![Request::Disconnect { peripheral: device() }]);
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert!(s.retry_at().is_some());
    }

    #[test]
    fn missing_service_fails_the_attempt() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        let e = s.epoch();
        s.handle_event(
            TransportEvent::Discovered {
                epoch: e,
                advertisement: handeye_advert(),
            },
            t0,
        );
        s.handle_event(
            TransportEvent::Connected {
                epoch: e,
                peripheral: device(),
            },
            t0,
        );
        let reqs = s.handle_event(
            TransportEvent::ServicesDiscovered {
                epoch: e,
                peripheral: device(),
                services: vec![Uuid::nil()],
            },
            t0,
        );
        assert_eq!(reqs, vec![Request::Disconnect { peripheral: device() }]);
        assert_eq!(s.state(), PeripheralState::Disconnected);
    }

    #[test]
    fn connect_failure_retries_without_disconnect_request() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        let e = s.epoch();
        s.handle_event(
            TransportEvent::Discovered {
                epoch: e,
                advertisement: handeye_advert(),
            },
            t0,
        );
        let reqs = s.handle_event(
            TransportEvent::ConnectFailed {
                epoch: e,
                peripheral: device(),
                reason: "refused".to_string(),
            },
            t0,
        );
        assert!(reqs.is_empty());
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert_eq!(s.retry_at(), Some(t0 + 500 * MS));
    }

    #[test]
    fn exhausted_backoff_is_restarted_by_send() {
        let t0 = Instant::now();
        let mut config = LinkConfig::default();
        config.reconnect.max_attempts = Some(1);
        let mut s = PeripheralSession::new(config);
        s.handle_event(TransportEvent::RadioState { powered: true }, t0);

        // The first failure schedules a retry, the second exhausts the policy.
        for at in [t0, t0 + Duration::from_secs(1)] {
            s.tick(at);
            assert_eq!(s.state(), PeripheralState::Scanning);
            let e = s.epoch();
            s.handle_event(
                TransportEvent::Discovered {
                    epoch: e,
                    advertisement: handeye_advert(),
                },
                at,
            );
            s.handle_event(
                TransportEvent::ConnectFailed {
                    epoch: e,
                    peripheral: device(),
                    reason: "refused".to_string(),
                },
                at,
            );
        }
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert_eq!(s.retry_at(), None);
        assert!(s.tick(t0 + Duration::from_secs(60)).is_empty());

        let plan = s.send(TelemetryMessage::new([0; 9]), t0 + Duration::from_secs(61));
        assert_eq!(plan.outcome, SendOutcome::NotReady(PeripheralState::Disconnected));
        assert!(matches!(plan.requests[..], [Request::StartScan { .. }]));
        assert_eq!(s.state(), PeripheralState::Scanning);
    }

    #[test]
    fn refused_scan_falls_back_to_disconnected() {
        let t0 = Instant::now();
        let mut s = PeripheralSession::new(LinkConfig::default());
        let reqs = s.handle_event(TransportEvent::RadioState { powered: true }, t0);
        s.request_failed(&reqs[0], "adapter busy", t0);
        assert_eq!(s.state(), PeripheralState::Disconnected);
        assert!(s.retry_at().is_some());
    }

    #[test]
    fn refused_write_is_counted_as_failure() {
        let t0 = Instant::now();
        let mut s = ready_session(t0);
        let plan = s.send(TelemetryMessage::new([9; 9]), t0);
        s.request_failed(&plan.requests[0], "queue full", t0);
        assert_eq!(s.state(), PeripheralState::Ready);
        assert_eq!(s.stats().writes_failed, 1);
    }
}
