//! [`BleTransport`] backed by the host's Bluetooth adapter through `bluest`.
//!
//! Every request is submitted by spawning a Tokio task that drives the
//! `bluest` call and reports its completion on the registered sink.  Device,
//! service and characteristic handles discovered along the way are cached
//! per [`PeripheralId`] so later requests can find them again.
//!
//! Requires a Tokio runtime: [`BleTransport::register`] spawns the adapter
//! watcher.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), handeye_types::HandEyeError> {
//! use std::sync::Arc;
//! use handeye_middleware::{BleTransport, BluestTransport};
//!
//! let radio: Arc<dyn BleTransport> = Arc::new(BluestTransport::new().await?);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, AdvertisingDevice, Characteristic, ConnectionEvent, Device, Service};
use futures_util::{StreamExt, pin_mut};
use handeye_types::{HandEyeError, WriteMode};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{
    Advertisement, BleTransport, CharacteristicInfo, Epoch, EventSink, PeripheralId, ScanFilter,
    TransportEvent,
};

#[derive(Default)]
struct BluestState {
    sink: Option<EventSink>,
    devices: HashMap<PeripheralId, Device>,
    services: HashMap<(PeripheralId, Uuid), Service>,
    characteristics: HashMap<(PeripheralId, Uuid), Characteristic>,
    connection: Option<(PeripheralId, Epoch)>,
    radio_task: Option<JoinHandle<()>>,
    scan_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
}

impl BluestState {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            let _ = sink.send(event);
        }
    }

    /// Drop every handle belonging to `peripheral`.
    fn forget_gatt(&mut self, peripheral: &PeripheralId) {
        self.services.retain(|(id, _), _| id != peripheral);
        self.characteristics.retain(|(id, _), _| id != peripheral);
    }
}

/// Wireless central on the default system adapter.
pub struct BluestTransport {
    adapter: Adapter,
    state: Arc<Mutex<BluestState>>,
}

impl BluestTransport {
    /// Open the default Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Transport`] when the host has no adapter.
    pub async fn new() -> Result<Self, HandEyeError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| transport_error("open_adapter", "no Bluetooth adapter found"))?;
        info!("Bluetooth adapter opened");
        Ok(Self {
            adapter,
            state: Arc::new(Mutex::new(BluestState::default())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BluestState> {
        lock(&self.state)
    }

    fn device(&self, operation: &str, peripheral: &PeripheralId) -> Result<Device, HandEyeError> {
        self.lock()
            .devices
            .get(peripheral)
            .cloned()
            .ok_or_else(|| transport_error(operation, format!("{peripheral} was never discovered")))
    }

    fn require_connected(&self, operation: &str, peripheral: &PeripheralId) -> Result<(), HandEyeError> {
        match &self.lock().connection {
            Some((connected, _)) if connected == peripheral => Ok(()),
            _ => Err(transport_error(operation, format!("{peripheral} is not connected"))),
        }
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        let state = self.lock();
        for task in [&state.radio_task, &state.scan_task, &state.link_task].into_iter().flatten() {
            task.abort();
        }
    }
}

fn lock(state: &Mutex<BluestState>) -> MutexGuard<'_, BluestState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(state: &Mutex<BluestState>, event: TransportEvent) {
    lock(state).emit(event);
}

fn transport_error(operation: &str, details: impl fmt::Display) -> HandEyeError {
    HandEyeError::Transport {
        operation: operation.to_string(),
        details: details.to_string(),
    }
}

fn peripheral_id(device: &Device) -> PeripheralId {
    PeripheralId(format!("{:?}", device.id()))
}

/// Service UUIDs handed to the adapter; empty scans for every advertiser.
fn scan_services(filter: &ScanFilter) -> Vec<Uuid> {
    match filter {
        ScanFilter::Unrestricted => Vec::new(),
        ScanFilter::Services(services) => services.clone(),
    }
}

fn advertisement(found: &AdvertisingDevice) -> Advertisement {
    Advertisement {
        peripheral: peripheral_id(&found.device),
        name: found.adv_data.local_name.clone(),
        rssi: found.rssi,
        services: found.adv_data.services.clone(),
    }
}

/// Keep the handles whose UUID was asked for; an empty request keeps all.
fn retain_wanted<T>(found: Vec<T>, wanted: &[Uuid], uuid: impl Fn(&T) -> Uuid) -> Vec<T> {
    found
        .into_iter()
        .filter(|item| wanted.is_empty() || wanted.contains(&uuid(item)))
        .collect()
}

#[async_trait]
impl BleTransport for BluestTransport {
    fn register(&self, sink: EventSink) {
        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let mut guard = self.lock();
        guard.sink = Some(sink);
        if let Some(previous) = guard.radio_task.take() {
            previous.abort();
        }
        guard.radio_task = Some(tokio::spawn(async move {
            let powered = adapter.is_available().await.unwrap_or(false);
            emit(&state, TransportEvent::RadioState { powered });

            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "adapter events unavailable");
                    return;
                }
            };
            pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    Ok(AdapterEvent::Available) => emit(&state, TransportEvent::RadioState { powered: true }),
                    Ok(AdapterEvent::Unavailable) => {
                        let mut guard = lock(&state);
                        guard.connection = None;
                        guard.emit(TransportEvent::RadioState { powered: false });
                    }
                    Err(e) => warn!(error = %e, "adapter event error"),
                }
            }
        }));
    }

    async fn start_scan(&self, filter: ScanFilter, epoch: Epoch) -> Result<(), HandEyeError> {
        let available = self
            .adapter
            .is_available()
            .await
            .map_err(|e| transport_error("start_scan", e))?;
        if !available {
            return Err(transport_error("start_scan", "radio is powered off"));
        }

        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let services = scan_services(&filter);
        debug!(?filter, %epoch, "scan started");
        let task = tokio::spawn(async move {
            let found = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "scan failed to start");
                    return;
                }
            };
            pin_mut!(found);
            while let Some(device) = found.next().await {
                let advertisement = advertisement(&device);
                let mut guard = lock(&state);
                guard
                    .devices
                    .insert(advertisement.peripheral.clone(), device.device);
                guard.emit(TransportEvent::Discovered { epoch, advertisement });
            }
        });

        if let Some(previous) = self.lock().scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), HandEyeError> {
        // Dropping the advertisement stream ends the scan.
        if let Some(task) = self.lock().scan_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId, epoch: Epoch) -> Result<(), HandEyeError> {
        let device = self.device("connect", peripheral)?;
        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let id = peripheral.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = adapter.connect_device(&device).await {
                emit(
                    &state,
                    TransportEvent::ConnectFailed {
                        epoch,
                        peripheral: id,
                        reason: e.to_string(),
                    },
                );
                return;
            }
            {
                let mut guard = lock(&state);
                guard.connection = Some((id.clone(), epoch));
                guard.emit(TransportEvent::Connected {
                    epoch,
                    peripheral: id.clone(),
                });
            }

            let events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(peripheral = %id, error = %e, "cannot watch connection state");
                    return;
                }
            };
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    let mut guard = lock(&state);
                    if matches!(&guard.connection, Some((current, e)) if *current == id && *e == epoch) {
                        guard.connection = None;
                        guard.forget_gatt(&id);
                        guard.emit(TransportEvent::Disconnected {
                            epoch,
                            peripheral: id.clone(),
                            reason: Some("link lost".to_string()),
                        });
                    }
                    break;
                }
            }
        });

        if let Some(previous) = self.lock().link_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<(), HandEyeError> {
        let connection = {
            let mut guard = self.lock();
            if !matches!(&guard.connection, Some((id, _)) if id == peripheral) {
                return Ok(());
            }
            if let Some(task) = guard.link_task.take() {
                task.abort();
            }
            guard.forget_gatt(peripheral);
            guard.connection.take()
        };

        let device = self.device("disconnect", peripheral)?;
        if let Err(e) = self.adapter.disconnect_device(&device).await {
            warn!(%peripheral, error = %e, "disconnect failed");
        }
        if let Some((peripheral, epoch)) = connection {
            self.lock().emit(TransportEvent::Disconnected {
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
        self.require_connected("discover_services", peripheral)?;
        let device = self.device("discover_services", peripheral)?;
        let state = self.state.clone();
        let id = peripheral.clone();
        let wanted = services.to_vec();

        tokio::spawn(async move {
            let found = match device.discover_services().await {
                Ok(found) => retain_wanted(found, &wanted, Service::uuid),
                Err(e) => {
                    warn!(peripheral = %id, error = %e, "service discovery failed");
                    Vec::new()
                }
            };
            let mut guard = lock(&state);
            let uuids = found.iter().map(Service::uuid).collect();
            for service in found {
                guard.services.insert((id.clone(), service.uuid()), service);
            }
            guard.emit(TransportEvent::ServicesDiscovered {
                epoch,
                peripheral: id,
                services: uuids,
            });
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
        self.require_connected("discover_characteristics", peripheral)?;
        let handle = self
            .lock()
            .services
            .get(&(peripheral.clone(), service))
            .cloned()
            .ok_or_else(|| {
                transport_error("discover_characteristics", format!("service {service} not discovered"))
            })?;
        let state = self.state.clone();
        let id = peripheral.clone();
        let wanted = characteristics.to_vec();

        tokio::spawn(async move {
            let found = match handle.discover_characteristics().await {
                Ok(found) => retain_wanted(found, &wanted, Characteristic::uuid),
                Err(e) => {
                    warn!(peripheral = %id, %service, error = %e, "characteristic discovery failed");
                    Vec::new()
                }
            };

            let mut infos = Vec::with_capacity(found.len());
            for characteristic in &found {
                match characteristic.properties().await {
                    Ok(props) => infos.push(CharacteristicInfo {
                        uuid: characteristic.uuid(),
                        write: props.write,
                        write_without_response: props.write_without_response,
                    }),
                    Err(e) => warn!(uuid = %characteristic.uuid(), error = %e, "unreadable characteristic properties"),
                }
            }

            let mut guard = lock(&state);
            for characteristic in found {
                guard
                    .characteristics
                    .insert((id.clone(), characteristic.uuid()), characteristic);
            }
            guard.emit(TransportEvent::CharacteristicsDiscovered {
                epoch,
                peripheral: id,
                service,
                characteristics: infos,
            });
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
        self.require_connected("write", peripheral)?;
        let handle = self
            .lock()
            .characteristics
            .get(&(peripheral.clone(), characteristic))
            .cloned()
            .ok_or_else(|| transport_error("write", format!("characteristic {characteristic} not discovered")))?;
        let state = self.state.clone();
        let id = peripheral.clone();
        let payload = payload.to_vec();

        tokio::spawn(async move {
            match mode {
                WriteMode::WithResponse => {
                    let result = handle.write(&payload).await.map_err(|e| e.to_string());
                    emit(
                        &state,
                        TransportEvent::WriteResult {
                            epoch,
                            peripheral: id,
                            characteristic,
                            result,
                        },
                    );
                }
                WriteMode::WithoutResponse => {
                    if let Err(e) = handle.write_without_response(&payload).await {
                        warn!(peripheral = %id, error = %e, "unacknowledged write failed");
                    }
                }
            }
        });
        Ok(())
    }
}
