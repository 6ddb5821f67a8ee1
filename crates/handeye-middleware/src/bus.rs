//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every subscriber receives
//! every message without any single subscriber blocking the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Telemetry`] | Payloads handed to the peripheral |
//! | [`Topic::Link`] | Peripheral state changes and discovered candidates |
//! | [`Topic::Alerts`] | Dropped frames and transport faults |

use handeye_types::{Event, HandEyeError};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes of the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every 9-byte payload the pipeline hands to the link.
    Telemetry,
    /// Connection lifecycle of the peripheral.
    Link,
    /// Frames that produced no write, transport faults.
    Alerts,
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    telemetry: broadcast::Sender<Event>,
    link: broadcast::Sender<Event>,
    alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic channel.
    pub fn new(capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity);
        let (link, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        Self {
            telemetry,
            link,
            alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    ///
    /// # Errors
    ///
    /// Returns [`HandEyeError::Channel`] when nobody is subscribed to the
    /// topic.  Publishers that do not care about an audience ignore it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, HandEyeError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| HandEyeError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Telemetry => &self.telemetry,
            Topic::Link => &self.link,
            Topic::Alerts => &self.alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   messages were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking poll for an already-buffered event.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handeye_types::{DropReason, EventPayload, PeripheralState};

    fn link_event() -> Event {
        Event::new(
            "handeye-hal::link",
            EventPayload::LinkStateChanged {
                from: PeripheralState::Disconnected,
                to: PeripheralState::Scanning,
            },
        )
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Link, link_event());
        assert!(matches!(result, Err(HandEyeError::Channel(_))));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut sub1 = bus.subscribe_to(Topic::Link);
        let mut sub2 = bus.subscribe_to(Topic::Link);

        let event = link_event();
        assert_eq!(bus.publish_to(Topic::Link, event.clone())?, 2);

        assert_eq!(sub1.recv().await?.id, event.id);
        assert_eq!(sub2.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let _link = bus.subscribe_to(Topic::Link);

        bus.publish_to(Topic::Link, link_event())?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "Alerts subscriber must not see a Link event");
        assert_eq!(alerts.topic(), Topic::Alerts);
        Ok(())
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe_to(Topic::Alerts);
        for _ in 0..100 {
            let _ = bus.publish_to(
                Topic::Alerts,
                Event::new("test", EventPayload::FrameDropped(DropReason::RateLimited)),
            );
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
