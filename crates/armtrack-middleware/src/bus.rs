//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A subscriber that falls behind loses the oldest events of its
//! lane and is told how many it missed.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::JointSensor`] | Encoder samples, high rate |
//! | [`Topic::VisualSensor`] | Depth frames, low rate |
//! | [`Topic::Estimates`] | Fused estimates for publishers |
//! | [`Topic::SystemAlerts`] | Sensor faults and stream timeouts |

use armtrack_types::{Event, SensorStream, TrackError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 1024;

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JointSensor,
    VisualSensor,
    Estimates,
    SystemAlerts,
}

impl Topic {
    /// The sensor lane carrying `stream`.
    pub fn for_stream(stream: SensorStream) -> Self {
        match stream {
            SensorStream::Joint => Topic::JointSensor,
            SensorStream::Visual => Topic::VisualSensor,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    joint_sensor: broadcast::Sender<Event>,
    visual_sensor: broadcast::Sender<Event>,
    estimates: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (joint_sensor, _) = broadcast::channel(capacity);
        let (visual_sensor, _) = broadcast::channel(capacity);
        let (estimates, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            joint_sensor,
            visual_sensor,
            estimates,
            system_alerts,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event,
    /// or [`TrackError::Channel`] when nobody is subscribed to the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, TrackError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| TrackError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::JointSensor => &self.joint_sensor,
            Topic::VisualSensor => &self.visual_sensor,
            Topic::Estimates => &self.estimates,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
#[derive(Debug)]
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, logging and skipping over lag.
    ///
    /// Returns `None` once every sender is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
