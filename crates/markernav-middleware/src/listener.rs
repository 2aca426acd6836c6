//! Feeds every transform seen on the transport into a [`TransformBuffer`].
//!
//! The listener subscribes once at construction; failure there is returned
//! to the caller and aborts startup.  After that it never gives up: when the
//! stream ends it marks itself disconnected, waits with exponential backoff
//! and subscribes again.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use markernav_middleware::{EventBus, TransformListener};
//! use markernav_perception::TransformBuffer;
//!
//! # async fn run() -> Result<(), markernav_types::NavError> {
//! let bus = EventBus::default();
//! let buffer = TransformBuffer::new(Duration::from_secs(10), Duration::from_millis(250));
//! let listener = TransformListener::new(Arc::new(bus), buffer.clone()).await?;
//! assert!(listener.is_connected());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use markernav_perception::TransformBuffer;
use markernav_types::{NavError, TransformMessage};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::transport::Transport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct ListenerStats {
    received: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
}

/// Background subscription that keeps a [`TransformBuffer`] up to date.
///
/// The task is aborted on [`shutdown`](Self::shutdown) or drop.
pub struct TransformListener {
    stats: Arc<ListenerStats>,
    task: JoinHandle<()>,
}

impl TransformListener {
    /// Subscribe to `transport` and start feeding `buffer`.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Whatever the initial [`Transport::subscribe_transforms`] returns.
    pub async fn new(
        transport: Arc<dyn Transport>,
        buffer: TransformBuffer,
    ) -> Result<Self, NavError> {
        let stream = transport.subscribe_transforms().await?;
        let stats = Arc::new(ListenerStats::default());
        stats.connected.store(true, Ordering::Release);
        info!("transform listener subscribed");

        let task = tokio::spawn(listen(transport, buffer, stream, Arc::clone(&stats)));
        Ok(Self { stats, task })
    }

    /// Transforms inserted into the buffer so far.
    pub fn received(&self) -> u64 {
        self.stats.received.load(Ordering::Relaxed)
    }

    /// Successful resubscriptions after a disconnect.
    pub fn reconnects(&self) -> u64 {
        self.stats.reconnects.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Acquire)
    }

    /// Stop listening.  The buffer keeps whatever it already holds.
    pub fn shutdown(&self) {
        self.task.abort();
        self.stats.connected.store(false, Ordering::Release);
    }
}

impl Drop for TransformListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn listen(
    transport: Arc<dyn Transport>,
    buffer: TransformBuffer,
    mut stream: BoxStream<'static, TransformMessage>,
    stats: Arc<ListenerStats>,
) {
    loop {
        while let Some(TransformMessage { transform, latched }) = stream.next().await {
            if latched {
                buffer.insert_static(transform);
            } else {
                buffer.insert(transform);
            }
            stats.received.fetch_add(1, Ordering::Relaxed);
        }

        stats.connected.store(false, Ordering::Release);
        warn!("transform stream ended, resubscribing");
        stream = resubscribe(transport.as_ref()).await;
        stats.reconnects.fetch_add(1, Ordering::Relaxed);
        stats.connected.store(true, Ordering::Release);
    }
}

async fn resubscribe(transport: &dyn Transport) -> BoxStream<'static, TransformMessage> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        match transport.subscribe_transforms().await {
            Ok(stream) => {
                info!("transform listener resubscribed");
                return stream;
            }
            Err(e) => {
                warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "transform resubscribe failed");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use async_trait::async_trait;
    use futures_util::stream;
    use markernav_types::{StampedTransform, Timestamp, Transform3D, Vec3, Quaternion};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Each subscription pops the next scripted outcome.  `Ok` streams end
    /// after their messages; once the script runs out the subscription stays
    /// open forever.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Vec<TransformMessage>, NavError>>>,
        subscriptions: AtomicU64,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Vec<TransformMessage>, NavError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                subscriptions: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn publish_transform(&self, _msg: TransformMessage) -> Result<usize, NavError> {
            Ok(0)
        }

        async fn subscribe_transforms(
            &self,
        ) -> Result<BoxStream<'static, TransformMessage>, NavError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(messages)) => Ok(stream::iter(messages).boxed()),
                Some(Err(e)) => Err(e),
                None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn edge(parent: &str, child: &str, ms: u64, x: f64, latched: bool) -> TransformMessage {
        TransformMessage {
            transform: StampedTransform::new(
                parent,
                child,
                Timestamp::from_millis(ms),
                Transform3D::new(Vec3::new(x, 0.0, 0.0), Quaternion::identity()),
            ),
            latched,
        }
    }

    fn buffer() -> TransformBuffer {
        TransformBuffer::new(Duration::from_secs(10), Duration::from_millis(100))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn initial_subscribe_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            NavError::TransportDisconnected("refused".into()),
        )]));
        let result = TransformListener::new(transport, buffer()).await;
        assert!(matches!(result, Err(NavError::TransportDisconnected(_))));
    }

    #[tokio::test]
    async fn reconnects_after_stream_ends() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(vec![edge("base_link", "camera_link", 0, 0.1, true)]),
            Err(NavError::TransportDisconnected("still down".into())),
            Ok(vec![edge("camera_link", "aruco_marker_5", 1000, 1.0, false)]),
        ]));
        let buf = buffer();
        let listener = TransformListener::new(transport.clone(), buf.clone())
            .await
            .unwrap();

        assert!(wait_until(|| listener.received() == 2).await);
        let t = buf
            .lookup("base_link", "aruco_marker_5", Timestamp::from_millis(1000))
            .unwrap();
        assert!((t.transform.translation.x - 1.1).abs() < 1e-9);

        // Initial, failed retry, successful retry, final open subscription.
        assert!(wait_until(|| transport.subscriptions.load(Ordering::SeqCst) == 4).await);
        assert!(wait_until(|| listener.is_connected()).await);
        assert_eq!(listener.reconnects(), 2);
    }

    #[tokio::test]
    async fn duplicates_are_inserted_unconditionally() {
        let msg = edge("odom", "base_link", 500, 2.0, false);
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(vec![msg.clone(), msg])]));
        let buf = buffer();
        let listener = TransformListener::new(transport, buf.clone()).await.unwrap();

        assert!(wait_until(|| listener.received() == 2).await);
        assert_eq!(buf.sample_count("odom", "base_link"), 2);
    }

    #[tokio::test]
    async fn picks_up_latched_and_live_bus_traffic() {
        let bus = EventBus::default();
        bus.publish_transform(edge("base_link", "camera_link", 0, 0.2, true))
            .unwrap();

        let buf = buffer();
        let listener = TransformListener::new(Arc::new(bus.clone()), buf.clone())
            .await
            .unwrap();
        bus.publish_transform(edge("camera_link", "aruco_marker_3", 2000, 0.8, false))
            .unwrap();

        assert!(wait_until(|| listener.received() == 2).await);
        let t = buf
            .lookup("base_link", "aruco_marker_3", Timestamp::from_millis(2000))
            .unwrap();
        assert!((t.transform.translation.x - 1.0).abs() < 1e-9);
        assert_eq!(listener.reconnects(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_feeding_the_buffer() {
        let bus = EventBus::default();
        let buf = buffer();
        let listener = TransformListener::new(Arc::new(bus.clone()), buf.clone())
            .await
            .unwrap();
        listener.shutdown();
        assert!(!listener.is_connected());

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish_transform(edge("a", "b", 1, 1.0, false)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!buf.has_frame("a"));
    }
}
