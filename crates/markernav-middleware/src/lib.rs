//! `markernav-middleware` – The Nervous System
//!
//! Routes transforms, observations and commands between the controller's
//! components and external clients without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels, with per-topic latching.
//! - [`transport`] – The [`Transport`] seam the broadcaster and listener use.
//! - [`broadcaster`] – Best-effort transform publisher (dynamic and latched).
//! - [`listener`] – Keeps a transform buffer fed from the transport,
//!   resubscribing after disconnects.
//! - [`rosbridge`] – rosbridge-compatible WebSocket bridge that translates
//!   ROS JSON traffic to and from the bus.

pub mod broadcaster;
pub mod bus;
pub mod listener;
pub mod rosbridge;
pub mod transport;

pub use broadcaster::TransformBroadcaster;
pub use bus::{EventBus, Topic, TopicReceiver};
pub use listener::TransformListener;
pub use rosbridge::RosBridge;
pub use transport::Transport;
