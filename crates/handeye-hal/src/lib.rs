//! `handeye-hal` – Hardware edge of HandEye
//!
//! # Modules
//!
//! - [`depth_sensor`] – The [`DepthSensor`] trait frame sources implement.
//! - [`sim`] – A synthetic depth sensor for running without hardware.
//! - [`session`] – The [`PeripheralSession`] connection state machine.
//! - [`link`] – The [`LinkActor`] that owns the session and its
//!   [`LinkHandle`].

pub mod depth_sensor;
pub mod link;
pub mod session;
pub mod sim;

pub use depth_sensor::DepthSensor;
pub use link::{LinkActor, LinkHandle, LinkSnapshot};
pub use session::{
    DEFAULT_STEP_TIMEOUT, DEFAULT_TICK_INTERVAL, LinkConfig, LinkStats, PeripheralSession, Request,
    SendOutcome, SendPlan, SessionNotice,
};
pub use sim::SimDepthSensor;
