//! [`LinkActor`] – the single owner of the [`PeripheralSession`].
//!
//! Transport callbacks and send requests both arrive as messages on the
//! actor's channels, so the session is mutated by exactly one task and a send
//! never observes a half-finished transition.  A periodic tick drives step
//! deadlines and reconnect backoff.
//!
//! Callers talk to the actor through a cloneable [`LinkHandle`].

use std::collections::VecDeque;
use std::sync::Arc;

use handeye_middleware::{BleTransport, Epoch, EventBus, PeripheralId, Topic, TransportEvent};
use handeye_types::{Event, EventPayload, HandEyeError, PeripheralState, TelemetryMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::{LinkConfig, LinkStats, PeripheralSession, Request, SendOutcome, SessionNotice};

const EVENT_SOURCE: &str = "handeye-hal::link";
const COMMAND_CAPACITY: usize = 32;

/// Point-in-time view of the link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub state: PeripheralState,
    pub epoch: Epoch,
    pub peripheral: Option<PeripheralId>,
    pub stats: LinkStats,
}

enum LinkCommand {
    Send {
        message: TelemetryMessage,
        reply: oneshot::Sender<SendOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<LinkSnapshot>,
    },
    Shutdown,
}

/// Cloneable front door of a running [`LinkActor`].
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    /// Offer one payload to the peripheral.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] when the actor has stopped.
    pub async fn send(&self, message: TelemetryMessage) -> Result<SendOutcome, HandEyeError> {
        let (reply, rx) = oneshot::channel();
        self.request(LinkCommand::Send { message, reply }).await?;
        rx.await.map_err(|_| closed())
    }

    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] when the actor has stopped.
    pub async fn snapshot(&self) -> Result<LinkSnapshot, HandEyeError> {
        let (reply, rx) = oneshot::channel();
        self.request(LinkCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| closed())
    }

    /// Ask the actor to release the peripheral and stop.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] when the actor has already stopped.
    pub async fn shutdown(&self) -> Result<(), HandEyeError> {
        self.request(LinkCommand::Shutdown).await
    }

    async fn request(&self, command: LinkCommand) -> Result<(), HandEyeError> {
        self.commands.send(command).await.map_err(|_| closed())
    }
}

fn closed() -> HandEyeError {
    HandEyeError::Channel("link actor has stopped".to_string())
}

pub struct LinkActor {
    session: PeripheralSession,
    transport: Arc<dyn BleTransport>,
    bus: EventBus,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::Receiver<LinkCommand>,
}

impl LinkActor {
    /// Register with `transport` and start the actor on the current runtime.
    ///
    /// The returned task resolves with the final [`LinkStats`] once the actor
    /// has shut down.
    pub fn spawn(
        config: LinkConfig,
        transport: Arc<dyn BleTransport>,
        bus: EventBus,
    ) -> (LinkHandle, JoinHandle<LinkStats>) {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        transport.register(event_tx);

        let actor = Self {
            session: PeripheralSession::new(config),
            transport,
            bus,
            events,
            commands,
        };
        let task = tokio::spawn(actor.run());
        (LinkHandle { commands: command_tx }, task)
    }

    async fn run(mut self) -> LinkStats {
        let mut ticker = tokio::time::interval(self.session.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(peripheral = ?self.session.config().target, "link actor started");

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    let requests = self.session.handle_event(event, now());
                    self.submit(requests).await;
                }
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Send { message, reply }) => {
                        let outcome = self.send(message).await;
                        let _ = reply.send(outcome);
                    }
                    Some(LinkCommand::Snapshot { reply }) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(LinkCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    let requests = self.session.tick(now());
                    self.submit(requests).await;
                }
            }
            self.publish_notices();
        }

        self.release().await;
        let stats = self.session.stats();
        info!(?stats, "link actor stopped");
        stats
    }

    async fn send(&mut self, message: TelemetryMessage) -> SendOutcome {
        let plan = self.session.send(message, now());
        match self.submit(plan.requests).await {
            Some(reason) if plan.outcome.is_dispatched() => SendOutcome::Rejected(reason),
            _ => plan.outcome,
        }
    }

    /// Submit `requests` in order, feeding refusals back into the session.
    /// Returns the reason if a write was refused.
    async fn submit(&mut self, requests: Vec<Request>) -> Option<String> {
        let mut queue: VecDeque<Request> = requests.into();
        let mut write_refusal = None;
        while let Some(request) = queue.pop_front() {
            debug!(?request, "submitting transport request");
            if let Err(e) = request.submit(self.transport.as_ref()).await {
                let reason = e.to_string();
                warn!(error = %reason, "transport refused request");
                let _ = self.bus.publish_to(
                    Topic::Alerts,
                    Event::new(
                        EVENT_SOURCE,
                        EventPayload::HardwareFault {
                            component: "ble-transport".to_string(),
                            message: reason.clone(),
                        },
                    ),
                );
                if matches!(request, Request::Write { .. }) {
                    write_refusal = Some(reason.clone());
                }
                queue.extend(self.session.request_failed(&request, &reason, now()));
            }
        }
        write_refusal
    }

    fn publish_notices(&mut self) {
        for notice in self.session.drain_notices() {
            let payload = match notice {
                SessionNotice::StateChanged { from, to } => {
                    info!(%from, %to, "peripheral link state");
                    EventPayload::LinkStateChanged { from, to }
                }
                SessionNotice::Discovered(advertisement) => EventPayload::PeripheralDiscovered {
                    name: advertisement.name,
                    rssi: advertisement.rssi,
                    services: advertisement.services,
                },
            };
            let _ = self
                .bus
                .publish_to(Topic::Link, Event::new(EVENT_SOURCE, payload));
        }
    }

    fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.session.state(),
            epoch: self.session.epoch(),
            peripheral: self.session.peripheral().cloned(),
            stats: self.session.stats(),
        }
    }

    async fn release(&self) {
        let result = match (self.session.state(), self.session.peripheral()) {
            (PeripheralState::Scanning, _) => self.transport.stop_scan().await,
            (_, Some(peripheral)) => self.transport.disconnect(peripheral).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to release peripheral on shutdown");
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
