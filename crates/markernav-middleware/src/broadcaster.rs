//! Publishes transform observations into the shared [`Transport`].

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use markernav_types::{NavError, StampedTransform, TransformMessage};
use tracing::{debug, warn};

use crate::transport::Transport;

/// Best-effort transform publisher.
///
/// One capability, two modes: dynamic for per-observation transforms and
/// latched for fixed fixtures such as a camera mount.  Publishing never waits
/// on subscribers; failures are counted and logged at most once per second.
pub struct TransformBroadcaster {
    transport: Arc<dyn Transport>,
    published: AtomicU64,
    failed: AtomicU64,
    error_log: DefaultDirectRateLimiter,
}

impl TransformBroadcaster {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            error_log: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    /// Publish `transform`, latched or dynamic.
    pub fn publish(&self, transform: StampedTransform, latched: bool) -> Result<usize, NavError> {
        let parent = transform.parent_frame.clone();
        let child = transform.child_frame.clone();
        match self
            .transport
            .publish_transform(TransformMessage { transform, latched })
        {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!(%parent, %child, latched, receivers, "transform published");
                Ok(receivers)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if self.error_log.check().is_ok() {
                    warn!(%parent, %child, error = %e, "transform publish failed");
                }
                Err(e)
            }
        }
    }

    pub fn send_transform(&self, transform: StampedTransform) -> Result<usize, NavError> {
        self.publish(transform, false)
    }

    pub fn send_static_transform(&self, transform: StampedTransform) -> Result<usize, NavError> {
        self.publish(transform, true)
    }

    /// Transforms handed to the transport so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Transforms the transport refused.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, Topic};
    use async_trait::async_trait;
    use futures_util::stream::BoxStream;
    use markernav_types::{Timestamp, Transform3D};

    struct ClosedTransport;

    #[async_trait]
    impl Transport for ClosedTransport {
        fn publish_transform(&self, _msg: TransformMessage) -> Result<usize, NavError> {
            Err(NavError::TransportDisconnected("closed".into()))
        }

        async fn subscribe_transforms(
            &self,
        ) -> Result<BoxStream<'static, TransformMessage>, NavError> {
            Err(NavError::TransportDisconnected("closed".into()))
        }
    }

    fn mount() -> StampedTransform {
        StampedTransform::new("base_link", "camera_link", Timestamp::ZERO, Transform3D::identity())
    }

    #[test]
    fn static_transforms_are_latched_on_the_bus() {
        let bus = EventBus::default();
        let broadcaster = TransformBroadcaster::new(Arc::new(bus.clone()));

        broadcaster.send_static_transform(mount()).unwrap();
        broadcaster.send_static_transform(mount()).unwrap();

        assert_eq!(bus.latched_count(Topic::TfStatic), 1);
        assert_eq!(bus.latched_count(Topic::Tf), 0);
        assert_eq!(broadcaster.published(), 2);
    }

    #[test]
    fn dynamic_transforms_reach_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tf);
        let broadcaster = TransformBroadcaster::new(Arc::new(bus.clone()));

        assert_eq!(broadcaster.send_transform(mount()).unwrap(), 1);
        assert!(rx.try_recv().is_some());
        assert_eq!(bus.latched_count(Topic::Tf), 0);
    }

    #[test]
    fn failures_are_counted_and_returned() {
        let broadcaster = TransformBroadcaster::new(Arc::new(ClosedTransport));
        for _ in 0..3 {
            assert!(matches!(
                broadcaster.send_transform(mount()),
                Err(NavError::TransportDisconnected(_))
            ));
        }
        assert_eq!(broadcaster.failed(), 3);
        assert_eq!(broadcaster.published(), 0);
    }
}
