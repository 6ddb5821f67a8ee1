//! In-process simulated radio for tests and demos without hardware.
//!
//! [`SimTransport`] implements [`BleTransport`] against a list of
//! [`SimPeripheral`]s.  Every request completes immediately: the matching
//! [`TransportEvent`] is pushed onto the registered sink before the request
//! future resolves.  Writes are recorded and can be inspected with
//! [`SimTransport::writes`].
//!
//! # Example
//!
//! ```rust
//! use handeye_middleware::sim_transport::{SimPeripheral, SimTransport};
//!
//! let radio = SimTransport::new(true).with_peripheral(SimPeripheral::handeye("sim-0"));
//! assert!(radio.connected().is_none());
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use handeye_types::{
    DEFAULT_PERIPHERAL_NAME, HandEyeError, PeripheralTarget, WriteMode, layout,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec;
use crate::transport::{
    Advertisement, BleTransport, CharacteristicInfo, Epoch, EventSink, PeripheralId, ScanFilter,
    TransportEvent,
};

/// A peripheral living inside the simulated radio.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub advertisement: Advertisement,
    /// GATT table: service UUID and its characteristics.
    pub services: Vec<(Uuid, Vec<CharacteristicInfo>)>,
    /// When `false` every connection attempt fails.
    pub accept_connections: bool,
}

impl SimPeripheral {
    /// A peripheral exposing the stock HandEye firmware GATT table.
    pub fn handeye(address: &str) -> Self {
        Self::for_target(address, &PeripheralTarget::default())
    }

    /// A peripheral that advertises and serves exactly what `target` looks for.
    pub fn for_target(address: &str, target: &PeripheralTarget) -> Self {
        Self {
            advertisement: Advertisement {
                peripheral: PeripheralId(address.to_string()),
                name: Some(
                    target
                        .name
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PERIPHERAL_NAME.to_string()),
                ),
                rssi: Some(-58),
                services: vec![target.service],
            },
            services: vec![(
                target.service,
                vec![CharacteristicInfo {
                    uuid: target.characteristic,
                    write: true,
                    write_without_response: true,
                }],
            )],
            accept_connections: true,
        }
    }

    /// An unrelated advertiser with no GATT services of interest.
    pub fn bystander(address: &str, name: &str) -> Self {
        Self {
            advertisement: Advertisement {
                peripheral: PeripheralId(address.to_string()),
                name: Some(name.to_string()),
                rssi: Some(-80),
                services: Vec::new(),
            },
            services: Vec::new(),
            accept_connections: true,
        }
    }

    pub fn rejecting_connections(mut self) -> Self {
        self.accept_connections = false;
        self
    }
}

/// A payload the simulated peripheral received.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenPayload {
    pub peripheral: PeripheralId,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
    pub mode: WriteMode,
    pub epoch: Epoch,
}

#[derive(Default)]
struct SimState {
    sink: Option<EventSink>,
    powered: bool,
    peripherals: Vec<SimPeripheral>,
    scanning: Option<Epoch>,
    connection: Option<(PeripheralId, Epoch)>,
    writes: Vec<WrittenPayload>,
}

impl SimState {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }

    fn peripheral(&self, id: &PeripheralId) -> Option<&SimPeripheral> {
        self.peripherals
            .iter()
            .find(|p| &p.advertisement.peripheral == id)
    }

    fn require_powered(&self, operation: &str) -> Result<(), HandEyeError> {
        if self.powered {
            Ok(())
        } else {
            Err(transport_error(operation, "radio is powered off"))
        }
    }

    fn require_connected(&self, operation: &str, id: &PeripheralId) -> Result<(), HandEyeError> {
        match &self.connection {
            Some((connected, _)) if connected == id => Ok(()),
            _ => Err(transport_error(operation, &format!("{id} is not connected"))),
        }
    }
}

fn transport_error(operation: &str, details: &str) -> HandEyeError {
    HandEyeError::Transport {
        operation: operation.to_string(),
        details: details.to_string(),
    }
}

fn matches_filter(filter: &ScanFilter, advertisement: &Advertisement) -> bool {
    match filter {
        ScanFilter::Unrestricted => true,
        ScanFilter::Services(wanted) => advertisement.services.iter().any(|s| wanted.contains(s)),
    }
}

/// Simulated wireless central.
#[derive(Default)]
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl SimTransport {
    pub fn new(powered: bool) -> Self {
        Self {
            state: Mutex::new(SimState {
                powered,
                ..SimState::default()
            }),
        }
    }

    pub fn with_peripheral(self, peripheral: SimPeripheral) -> Self {
        self.lock().peripherals.push(peripheral);
        self
    }

    /// Switch the radio on or off.  Powering off silently drops any link.
    pub fn set_powered(&self, powered: bool) {
        let mut state = self.lock();
        state.powered = powered;
        if !powered {
            state.scanning = None;
            state.connection = None;
        }
        state.emit(TransportEvent::RadioState { powered });
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        if let Some((peripheral, epoch)) = state.connection.take() {
            info!(%peripheral, "simulated link loss");
            state.emit(TransportEvent::Disconnected {
                epoch,
                peripheral,
                reason: Some("link supervision timeout".to_string()),
            });
        }
    }

    pub fn writes(&self) -> Vec<WrittenPayload> {
        self.lock().writes.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning.is_some()
    }

    pub fn connected(&self) -> Option<PeripheralId> {
        self.lock().connection.as_ref().map(|(id, _)| id.clone())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BleTransport for SimTransport {
    fn register(&self, sink: EventSink) {
        let mut state = self.lock();
        let powered = state.powered;
        state.sink = Some(sink);
        state.emit(TransportEvent::RadioState { powered });
    }

    async fn start_scan(&self, filter: ScanFilter, epoch: Epoch) -> Result<(), HandEyeError> {
        let mut state = self.lock();
        state.require_powered("start_scan")?;
        state.scanning = Some(epoch);
        debug!(?filter, %epoch, "sim scan started");
        for p in &state.peripherals {
            if matches_filter(&filter, &p.advertisement) {
                state.emit(TransportEvent::Discovered {
                    epoch,
                    advertisement: p.advertisement.clone(),
                });
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), HandEyeError> {
        self.lock().scanning = None;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId, epoch: Epoch) -> Result<(), HandEyeError> {
        let mut state = self.lock();
        state.require_powered("connect")?;
        let accepted = state.peripheral(peripheral).map(|p| p.accept_connections);
        match accepted {
            Some(true) => {
                state.connection = Some((peripheral.clone(), epoch));
                state.emit(TransportEvent::Connected {
                    epoch,
                    peripheral: peripheral.clone(),
                });
            }
            Some(false) => state.emit(TransportEvent::ConnectFailed {
                epoch,
                peripheral: peripheral.clone(),
                reason: "peripheral refused the connection".to_string(),
            }),
            None => state.emit(TransportEvent::ConnectFailed {
                epoch,
                peripheral: peripheral.clone(),
                reason: "peripheral out of range".to_string(),
            }),
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), HandEyeError> {
        let mut state = self.lock();
        if !matches!(&state.connection, Some((id, _)) if id == peripheral) {
            return Ok(());
        }
        if let Some((peripheral, epoch)) = state.connection.take() {
            state.emit(TransportEvent::Disconnected {
                epoch,
                peripheral,
                reason: Some("disconnect requested".to_string()),
            });
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralId,
        services: &[Uuid],
        epoch: Epoch,
    ) -> Result<(), HandEyeError> {
        let state = self.lock();
        state.require_connected("discover_services", peripheral)?;
        let found = state
            .peripheral(peripheral)
            .map(|p| {
                p.services
                    .iter()
                    .map(|(uuid, _)| *uuid)
                    .filter(|uuid| services.is_empty() || services.contains(uuid))
                    .collect()
            })
            .unwrap_or_default();
        state.emit(TransportEvent::ServicesDiscovered {
            epoch,
            peripheral: peripheral.clone(),
            services: found,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
        epoch: Epoch,
    ) -> Result<(), HandEyeError> {
        let state = self.lock();
        state.require_connected("discover_characteristics", peripheral)?;
        let found = state
            .peripheral(peripheral)
            .and_then(|p| p.services.iter().find(|(uuid, _)| *uuid == service))
            .map(|(_, chars)| {
                chars
                    .iter()
                    .filter(|c| characteristics.is_empty() || characteristics.contains(&c.uuid))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        state.emit(TransportEvent::CharacteristicsDiscovered {
            epoch,
            peripheral: peripheral.clone(),
            service,
            characteristics: found,
        });
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        payload: &[u8],
        mode: WriteMode,
        epoch: Epoch,
    ) -> Result<(), HandEyeError> {
        let mut state = self.lock();
        state.require_connected("write", peripheral)?;
        if let Ok(grid) = codec::decode(payload) {
            debug!(
                %peripheral,
                center = grid.slot(layout::CENTER),
                top_center = grid.slot(layout::TOP_CENTER),
                "sim peripheral received grid"
            );
        }
        state.writes.push(WrittenPayload {
            peripheral: peripheral.clone(),
            characteristic,
            payload: payload.to_vec(),
            mode,
            epoch,
        });
        if mode == WriteMode::WithResponse {
            state.emit(TransportEvent::WriteResult {
                epoch,
                peripheral: peripheral.clone(),
                characteristic,
                result: Ok(()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handeye_types::{DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};
    use tokio::sync::mpsc;

    fn registered(radio: &SimTransport) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        radio.register(tx);
        rx
    }

    #[tokio::test]
    async fn register_reports_radio_state() {
        let radio = SimTransport::new(true);
        let mut rx = registered(&radio);
        assert_eq!(rx.recv().await, Some(TransportEvent::RadioState { powered: true }));
    }

    #[tokio::test]
    async fn service_filter_hides_bystanders() -> Result<(), Box<dyn std::error::Error>> {
        let radio = SimTransport::new(true)
            .with_peripheral(SimPeripheral::bystander("bb", "Headphones"))
            .with_peripheral(SimPeripheral::handeye("aa"));
        let mut rx = registered(&radio);
        rx.recv().await;

        radio
            .start_scan(ScanFilter::Services(vec![DEFAULT_SERVICE_UUID]), Epoch(1))
            .await?;
        match rx.try_recv()? {
            TransportEvent::Discovered { advertisement, .. } => {
                assert_eq!(advertisement.peripheral, PeripheralId("aa".to_string()));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        radio.start_scan(ScanFilter::Unrestricted, Epoch(2)).await?;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn full_handshake_and_write() -> Result<(), Box<dyn std::error::Error>> {
        let radio = SimTransport::new(true).with_peripheral(SimPeripheral::handeye("aa"));
        let mut rx = registered(&radio);
        rx.recv().await;
        let id = PeripheralId("aa".to_string());

        radio.connect(&id, Epoch(3)).await?;
        assert!(matches!(rx.try_recv()?, TransportEvent::Connected { epoch: Epoch(3), .. }));

        radio.discover_services(&id, &[DEFAULT_SERVICE_UUID], Epoch(3)).await?;
        assert!(matches!(
            rx.try_recv()?,
            TransportEvent::ServicesDiscovered { services, .. } if services == vec![DEFAULT_SERVICE_UUID]
        ));

        radio
            .discover_characteristics(&id, DEFAULT_SERVICE_UUID, &[DEFAULT_CHARACTERISTIC_UUID], Epoch(3))
            .await?;
        assert!(matches!(
            rx.try_recv()?,
            TransportEvent::CharacteristicsDiscovered { characteristics, .. } if characteristics.len() == 1
        ));

        radio
            .write(&id, DEFAULT_CHARACTERISTIC_UUID, &[255; 9], WriteMode::WithResponse, Epoch(3))
            .await?;
        assert!(matches!(rx.try_recv()?, TransportEvent::WriteResult { result: Ok(()), .. }));
        assert_eq!(radio.writes().len(), 1);
        assert_eq!(radio.writes()[0].payload, vec![255; 9]);
        Ok(())
    }

    #[tokio::test]
    async fn write_without_connection_is_refused() {
        let radio = SimTransport::new(true).with_peripheral(SimPeripheral::handeye("aa"));
        let result = radio
            .write(
                &PeripheralId("aa".to_string()),
                DEFAULT_CHARACTERISTIC_UUID,
                &[0; 9],
                WriteMode::WithoutResponse,
                Epoch(1),
            )
            .await;
        assert!(matches!(result, Err(HandEyeError::Transport { .. })));
        assert!(radio.writes().is_empty());
    }

    #[tokio::test]
    async fn rejecting_peripheral_fails_connect() -> Result<(), Box<dyn std::error::Error>> {
        let radio =
            SimTransport::new(true).with_peripheral(SimPeripheral::handeye("aa").rejecting_connections());
        let mut rx = registered(&radio);
        rx.recv().await;
        radio.connect(&PeripheralId("aa".to_string()), Epoch(1)).await?;
        assert!(matches!(rx.try_recv()?, TransportEvent::ConnectFailed { .. }));
        assert!(radio.connected().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn drop_link_reports_disconnect_with_connection_epoch() -> Result<(), Box<dyn std::error::Error>> {
        let radio = SimTransport::new(true).with_peripheral(SimPeripheral::handeye("aa"));
        let mut rx = registered(&radio);
        rx.recv().await;
        radio.connect(&PeripheralId("aa".to_string()), Epoch(9)).await?;
        rx.try_recv()?;

        radio.drop_link();
        assert!(matches!(rx.try_recv()?, TransportEvent::Disconnected { epoch: Epoch(9), .. }));
        assert!(radio.connected().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn powered_off_radio_refuses_scan() {
        let radio = SimTransport::new(false);
        let result = radio.start_scan(ScanFilter::Unrestricted, Epoch(1)).await;
        assert!(result.is_err());
        assert!(!radio.is_scanning());
    }
}
