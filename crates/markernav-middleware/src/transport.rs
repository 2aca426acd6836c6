//! The transform transport seam.
//!
//! [`Transport`] is what the broadcaster publishes into and what the listener
//! subscribes to.  The in-process [`EventBus`] implements it with two lanes:
//! dynamic transforms on [`Topic::Tf`] and latched ones on
//! [`Topic::TfStatic`], the latter replayed to every new subscription.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use markernav_types::{Event, EventPayload, NavError, TransformMessage};

use crate::bus::{EventBus, Topic, TopicReceiver};

/// Event source tag used for transforms entering the bus.
pub const TRANSFORM_SOURCE: &str = "markernav-middleware::transport";

/// A pub/sub channel for transform messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue `msg` for delivery.  Never waits on subscribers.
    ///
    /// Returns the number of subscribers the message was handed to.
    fn publish_transform(&self, msg: TransformMessage) -> Result<usize, NavError>;

    /// Open a new subscription.  Latched transforms published before the call
    /// are delivered first.  The stream ends when the transport drops the
    /// subscription; callers resubscribe.
    async fn subscribe_transforms(&self) -> Result<BoxStream<'static, TransformMessage>, NavError>;
}

/// Key under which a latched edge is retained.
pub fn latch_key(parent: &str, child: &str) -> String {
    format!("{parent}->{child}")
}

#[async_trait]
impl Transport for EventBus {
    fn publish_transform(&self, msg: TransformMessage) -> Result<usize, NavError> {
        let TransformMessage { transform, latched } = msg;
        if latched {
            let key = latch_key(&transform.parent_frame, &transform.child_frame);
            let event = Event::new(TRANSFORM_SOURCE, EventPayload::Transform(transform));
            self.publish_latched(Topic::TfStatic, key, event)
        } else {
            let event = Event::new(TRANSFORM_SOURCE, EventPayload::Transform(transform));
            self.publish_to(Topic::Tf, event)
        }
    }

    async fn subscribe_transforms(&self) -> Result<BoxStream<'static, TransformMessage>, NavError> {
        let statics = transform_stream(self.subscribe_to(Topic::TfStatic), true);
        let dynamics = transform_stream(self.subscribe_to(Topic::Tf), false);
        Ok(stream::select(statics, dynamics).boxed())
    }
}

fn transform_stream(rx: TopicReceiver, latched: bool) -> BoxStream<'static, TransformMessage> {
    stream::unfold(rx, move |mut rx| async move {
        loop {
            let event = rx.next_event().await?;
            if let EventPayload::Transform(transform) = event.payload {
                return Some((TransformMessage { transform, latched }, rx));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use markernav_types::{StampedTransform, Timestamp, Transform3D};
    use std::time::Duration;

    fn msg(parent: &str, child: &str, ms: u64, latched: bool) -> TransformMessage {
        TransformMessage {
            transform: StampedTransform::new(
                parent,
                child,
                Timestamp::from_millis(ms),
                Transform3D::identity(),
            ),
            latched,
        }
    }

    #[tokio::test]
    async fn dynamic_transforms_reach_live_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut stream = bus.subscribe_transforms().await?;

        bus.publish_transform(msg("camera_link", "aruco_marker_5", 100, false))?;

        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await?
            .ok_or("stream ended")?;
        assert!(!received.latched);
        assert_eq!(received.transform.child_frame, "aruco_marker_5");
        Ok(())
    }

    #[tokio::test]
    async fn latched_transforms_replay_to_late_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        bus.publish_transform(msg("base_link", "camera_link", 0, true))?;
        // Dynamic traffic with nobody listening is simply dropped.
        assert_eq!(bus.publish_transform(msg("camera_link", "aruco_marker_1", 5, false))?, 0);

        let mut stream = bus.subscribe_transforms().await?;
        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await?
            .ok_or("stream ended")?;
        assert!(received.latched);
        assert_eq!(received.transform.parent_frame, "base_link");
        assert_eq!(received.transform.child_frame, "camera_link");

        let nothing_more = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(nothing_more.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn non_transform_events_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut stream = bus.subscribe_transforms().await?;

        bus.publish_to(
            Topic::Tf,
            Event::new(
                "test",
                EventPayload::Fault {
                    component: "x".into(),
                    message: "y".into(),
                },
            ),
        )?;
        bus.publish_transform(msg("a", "b", 1, false))?;

        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await?
            .ok_or("stream ended")?;
        assert_eq!(received.transform.child_frame, "b");
        Ok(())
    }

    #[test]
    fn latch_key_format() {
        assert_eq!(latch_key("base_link", "camera_link"), "base_link->camera_link");
    }
}
