//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  A subscriber that falls behind loses the oldest messages
//! (best-effort delivery) and is told how many it missed.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Tf`] | Dynamic transforms (marker observations) |
//! | [`Topic::TfStatic`] | Latched transforms (camera mounts, fixtures) |
//! | [`Topic::Markers`] | Raw marker-detection batches |
//! | [`Topic::PartImages`] | Logical-camera part reports |
//! | [`Topic::CmdVel`] | Velocity commands for the drive base |
//! | [`Topic::SystemAlerts`] | Faults and disconnect notices |
//!
//! # Latching
//!
//! [`EventBus::publish_latched`] keeps the latest event per key on its topic.
//! Every later [`EventBus::subscribe_to`] on that topic first replays the
//! retained events, then continues with live traffic.
//!
//! # Example
//!
//! ```rust
//! use markernav_middleware::bus::{EventBus, Topic};
//! use markernav_types::{Event, EventPayload, VelocityCommand};
//!
//! let bus = EventBus::default();
//! let mut rx = bus.subscribe_to(Topic::CmdVel);
//! let sent = bus
//!     .publish_to(
//!         Topic::CmdVel,
//!         Event::new("doc", EventPayload::Velocity(VelocityCommand::stop())),
//!     )
//!     .unwrap();
//! assert_eq!(sent, 1);
//! assert!(rx.try_recv().is_some());
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use markernav_types::{Event, NavError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all first-class routing topics on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Dynamic transforms.
    Tf,
    /// Latched transforms, replayed to late subscribers.
    TfStatic,
    /// Marker-detection batches from the fiducial detector.
    Markers,
    /// Logical-camera part reports.
    PartImages,
    /// Velocity commands produced by the control loop.
    CmdVel,
    /// Critical events: faults, transport disconnects.
    SystemAlerts,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Tf,
        Topic::TfStatic,
        Topic::Markers,
        Topic::PartImages,
        Topic::CmdVel,
        Topic::SystemAlerts,
    ];
}

type LatchedStore = HashMap<Topic, BTreeMap<String, Event>>;

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels and latched store.
#[derive(Clone, Debug)]
pub struct EventBus {
    senders: HashMap<Topic, broadcast::Sender<Event>>,
    latched: Arc<Mutex<LatchedStore>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, as [`broadcast::channel`] does.
    pub fn new(capacity: usize) -> Self {
        let senders = Topic::ALL
            .iter()
            .map(|&topic| (topic, broadcast::channel(capacity).0))
            .collect();
        Self {
            senders,
            latched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Returns `Ok(0)` when no subscribers are currently listening on the
    /// topic (this is a normal condition, not an error).
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, NavError> {
        let sender = self.topic_sender(topic)?;
        Ok(sender.send(event).unwrap_or(0))
    }

    /// Publish `event` and retain it under `key` for late subscribers.
    ///
    /// A later latched publish with the same key replaces the retained event.
    pub fn publish_latched(
        &self,
        topic: Topic,
        key: impl Into<String>,
        event: Event,
    ) -> Result<usize, NavError> {
        let sender = self.topic_sender(topic)?;
        // Storing and sending under one lock keeps subscribe_to from seeing
        // the event both in its backlog and on the live channel.
        let mut latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
        latched
            .entry(topic)
            .or_default()
            .insert(key.into(), event.clone());
        Ok(sender.send(event).unwrap_or(0))
    }

    /// Subscribe to a specific [`Topic`] channel.
    ///
    /// Latched events on the topic are delivered first, in key order.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        let latched = self.latched.lock().unwrap_or_else(PoisonError::into_inner);
        let backlog = latched
            .get(&topic)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default();
        let receiver = self
            .senders
            .get(&topic)
            .map(broadcast::Sender::subscribe);
        TopicReceiver {
            topic,
            backlog,
            receiver,
        }
    }

    /// Number of latched events retained on `topic`.
    pub fn latched_count(&self, topic: Topic) -> usize {
        self.latched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, BTreeMap::len)
    }

    /// Number of live receivers on `topic`.
    pub fn receiver_count(&self, topic: Topic) -> usize {
        self.senders
            .get(&topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn topic_sender(&self, topic: Topic) -> Result<&broadcast::Sender<Event>, NavError> {
        self.senders
            .get(&topic)
            .ok_or_else(|| NavError::Channel(format!("no channel for topic {topic:?}")))
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
    backlog: VecDeque<Event>,
    receiver: Option<broadcast::Receiver<Event>>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a latched or live event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.  The caller decides whether to
    ///   continue or abort.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        match self.receiver.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }

    /// Like [`recv`](Self::recv) but skips over lag notices, logging them.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            match self.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.  Returns `None` when nothing is ready.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        let rx = self.receiver.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}
