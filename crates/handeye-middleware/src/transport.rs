//! The wireless transport seam.
//!
//! HandEye never talks to a radio stack directly.  The peripheral session
//! issues requests through the [`BleTransport`] trait and observes their
//! completion through [`TransportEvent`]s delivered on the [`EventSink`] it
//! registered with the transport.  Requests are fire-and-forget: the
//! returned future resolves once the request has been submitted, not when the
//! operation completes.
//!
//! # Epochs
//!
//! Every request that starts an asynchronous operation carries the session's
//! current [`Epoch`], and the transport echoes it back in the matching
//! callback.  A callback carrying an older epoch belongs to an attempt the
//! session has already abandoned and is ignored.

use std::fmt;

use async_trait::async_trait;
use handeye_types::{HandEyeError, WriteMode};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Generation counter of the peripheral session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Platform handle of a remote peripheral (address or OS identifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which advertisements a scan reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    /// Report every advertiser; the caller filters.
    Unrestricted,
    /// Report only advertisers of at least one of these services.
    Services(Vec<Uuid>),
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicInfo {
    pub fn supports(&self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.write,
            WriteMode::WithoutResponse => self.write_without_response,
        }
    }
}

/// Completion callbacks delivered by a [`BleTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The radio became available (`true`) or unavailable.
    RadioState { powered: bool },
    Discovered {
        epoch: Epoch,
        advertisement: Advertisement,
    },
    Connected {
        epoch: Epoch,
        peripheral: PeripheralId,
    },
    ConnectFailed {
        epoch: Epoch,
        peripheral: PeripheralId,
        reason: String,
    },
    ServicesDiscovered {
        epoch: Epoch,
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        epoch: Epoch,
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    Disconnected {
        epoch: Epoch,
        peripheral: PeripheralId,
        reason: Option<String>,
    },
    /// Delivery confirmation of an acknowledged write.
    WriteResult {
        epoch: Epoch,
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<(), String>,
    },
}

impl TransportEvent {
    /// Epoch echoed by this callback; `None` for radio state changes.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            TransportEvent::RadioState { .. } => None,
            TransportEvent::Discovered { epoch, .. }
            | TransportEvent::Connected { epoch, .. }
            | TransportEvent::ConnectFailed { epoch, .. }
            | TransportEvent::ServicesDiscovered { epoch, .. }
            | TransportEvent::CharacteristicsDiscovered { epoch, .. }
            | TransportEvent::Disconnected { epoch, .. }
            | TransportEvent::WriteResult { epoch, .. } => Some(*epoch),
        }
    }
}

/// Channel the transport pushes [`TransportEvent`]s into.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Request side of a wireless central (scanner + GATT client).
///
/// # Contract
///
/// * `register` hands the transport the sink for all later callbacks.  The
///   transport reports the current radio state on it as soon as it is known.
/// * Every other method only submits a request.  An `Err` means the request
///   was refused outright; no callback will follow for it.
#[async_trait]
pub trait BleTransport: Send + Sync {
    fn register(&self, sink: EventSink);

    async fn start_scan(&self, filter: ScanFilter, epoch: Epoch) -> Result<(), HandEyeError>;

    async fn stop_scan(&self) -> Result<(), HandEyeError>;

    async fn connect(&self, peripheral: &PeripheralId, epoch: Epoch) -> Result<(), HandEyeError>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), HandEyeError>;

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
        epoch: Epoch,
    ) -> Result<(), HandEyeError>;

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
        epoch: Epoch,
    ) -> Result<(), HandEyeError>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
        epoch: Epoch,
    ) -> Result<(), HandEyeError>;
}
