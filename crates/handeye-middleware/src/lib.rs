//! `handeye-middleware` – Routing and wire plumbing
//!
//! Moves telemetry between the pipeline, the peripheral link and anyone
//! listening in, without caring how the radio underneath works.
//!
//! # Modules
//!
//! - [`bus`] – Topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.
//! - [`codec`] – The 9-byte telemetry payload format.
//! - [`transport`] – The [`BleTransport`] seam between the peripheral session
//!   and a concrete radio stack.
//! - [`sim_transport`] – An in-process radio with scriptable peripherals.
//! - `bluest_transport` – The host Bluetooth adapter (feature `ble`).

#[cfg(feature = "ble")]
pub mod bluest_transport;
pub mod bus;
pub mod codec;
pub mod sim_transport;
pub mod transport;

#[cfg(feature = "ble")]
pub use bluest_transport::BluestTransport;
pub use bus::{EventBus, Topic, TopicReceiver};
pub use sim_transport::{SimPeripheral, SimTransport, WrittenPayload};
pub use transport::{
    Advertisement, BleTransport, CharacteristicInfo, Epoch, EventSink, PeripheralId, ScanFilter,
    TransportEvent,
};
