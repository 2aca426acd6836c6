//! Marker detections → camera-to-marker transforms.
//!
//! Each detection in a [`MarkerArray`] becomes a dynamic transform
//! `camera_frame → {prefix}{marker_id}` stamped with the batch timestamp,
//! mapped onto the node clock by a [`StampMapper`].  Detections that cannot
//! describe a rigid pose are counted and dropped; the rest of the batch is
//! still published.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use markernav_hal::StampMapper;
use markernav_middleware::{TopicReceiver, TransformBroadcaster};
use markernav_types::{
    EventPayload, MarkerArray, MarkerDetection, NavError, PoseMsg, StampedTransform, Timestamp,
    Transform3D,
};
use tracing::{debug, info, warn};

/// Turn an optional sensor pose into a rigid transform with a unit rotation.
pub(crate) fn pose_to_transform(pose: Option<&PoseMsg>) -> Result<Transform3D, NavError> {
    let pose = pose.ok_or_else(|| NavError::MalformedObservation("missing pose".into()))?;
    let position = pose
        .position
        .ok_or_else(|| NavError::MalformedObservation("missing position".into()))?;
    let orientation = pose
        .orientation
        .ok_or_else(|| NavError::MalformedObservation("missing orientation".into()))?;
    if !position.is_finite() {
        return Err(NavError::MalformedObservation("non-finite position".into()));
    }
    if !orientation.is_finite() {
        return Err(NavError::MalformedObservation("non-finite orientation".into()));
    }
    let rotation = orientation
        .normalized()
        .ok_or_else(|| NavError::MalformedObservation("zero-norm orientation".into()))?;
    Ok(Transform3D::new(position, rotation))
}

/// Publishes one transform per valid marker detection.
pub struct MarkerIngest {
    broadcaster: Arc<TransformBroadcaster>,
    camera_frame: String,
    frame_prefix: String,
    stamps: StampMapper,
    published: AtomicU64,
    malformed: AtomicU64,
}

impl MarkerIngest {
    pub fn new(
        broadcaster: Arc<TransformBroadcaster>,
        camera_frame: impl Into<String>,
        frame_prefix: impl Into<String>,
        stamps: StampMapper,
    ) -> Self {
        Self {
            broadcaster,
            camera_frame: camera_frame.into(),
            frame_prefix: frame_prefix.into(),
            stamps,
            published: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Frame name assigned to `marker_id`.
    pub fn marker_frame(&self, marker_id: i64) -> String {
        format!("{}{}", self.frame_prefix, marker_id)
    }

    /// Build the transform for one detection.
    pub fn to_transform(
        &self,
        stamp: Timestamp,
        detection: &MarkerDetection,
    ) -> Result<StampedTransform, NavError> {
        if detection.marker_id < 0 {
            return Err(NavError::MalformedObservation(format!(
                "negative marker id {}",
                detection.marker_id
            )));
        }
        let transform = pose_to_transform(detection.pose.as_ref())?;
        Ok(StampedTransform::new(
            self.camera_frame.clone(),
            self.marker_frame(detection.marker_id),
            stamp,
            transform,
        ))
    }

    /// Broadcast every valid detection in `msg`.  Returns how many were
    /// published.
    pub fn handle(&self, msg: &MarkerArray) -> usize {
        let stamp = self.stamps.map(msg.stamp);
        let mut sent = 0;
        for detection in &msg.markers {
            match self.to_transform(stamp, detection) {
                Ok(transform) => {
                    if self.broadcaster.send_transform(transform).is_ok() {
                        self.published.fetch_add(1, Ordering::Relaxed);
                        sent += 1;
                    }
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(marker_id = detection.marker_id, error = %e, "dropping marker detection");
                }
            }
        }
        debug!(sensor_stamp = %msg.stamp, %stamp, detections = msg.markers.len(), sent, "marker batch");
        sent
    }

    /// Consume marker batches until the bus closes.
    pub async fn run(self: Arc<Self>, mut rx: TopicReceiver) {
        info!(camera = %self.camera_frame, "marker ingest started");
        while let Some(event) = rx.next_event().await {
            if let EventPayload::Markers(msg) = event.payload {
                self.handle(&msg);
            }
        }
        info!("marker ingest stopped");
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markernav_hal::{Clock, ManualClock, StampPolicy};
    use markernav_middleware::{EventBus, Topic};
    use markernav_types::{Quaternion, Vec3};

    fn ingest_with(bus: &EventBus, stamps: StampMapper) -> MarkerIngest {
        let broadcaster = Arc::new(TransformBroadcaster::new(Arc::new(bus.clone())));
        MarkerIngest::new(broadcaster, "camera_link", "aruco_marker_", stamps)
    }

    fn ingest(bus: &EventBus) -> MarkerIngest {
        let clock = ManualClock::new(Timestamp::ZERO);
        ingest_with(bus, StampMapper::new(StampPolicy::Header, Arc::new(clock)))
    }

    fn detection(id: i64, pose: Option<PoseMsg>) -> MarkerDetection {
        MarkerDetection { marker_id: id, pose }
    }

    fn good_pose() -> PoseMsg {
        PoseMsg::new(Vec3::new(1.0, 0.2, 0.0), Quaternion::new(2.0, 0.0, 0.0, 0.0))
    }

    #[test]
    fn builds_camera_to_marker_transform() {
        let bus = EventBus::default();
        let ingest = ingest(&bus);
        let t = ingest
            .to_transform(Timestamp::from_millis(100), &detection(5, Some(good_pose())))
            .unwrap();
        assert_eq!(t.parent_frame, "camera_link");
        assert_eq!(t.child_frame, "aruco_marker_5");
        assert_eq!(t.stamp, Timestamp::from_millis(100));
        // Orientation is normalized before publishing.
        assert!((t.transform.rotation.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn malformed_detections_are_counted_not_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tf);
        let ingest = ingest(&bus);

        let msg = MarkerArray {
            stamp: Timestamp::from_millis(10),
            markers: vec![
                detection(1, None),
                detection(2, Some(PoseMsg { position: None, orientation: Some(Quaternion::identity()) })),
                detection(3, Some(PoseMsg { position: Some(Vec3::zero()), orientation: None })),
                detection(4, Some(PoseMsg::new(Vec3::new(f64::NAN, 0.0, 0.0), Quaternion::identity()))),
                detection(5, Some(PoseMsg::new(Vec3::zero(), Quaternion::new(0.0, 0.0, 0.0, 0.0)))),
                detection(-1, Some(good_pose())),
                detection(7, Some(good_pose())),
            ],
        };

        assert_eq!(ingest.handle(&msg), 1);
        assert_eq!(ingest.published(), 1);
        assert_eq!(ingest.malformed(), 6);

        let event = rx.try_recv().unwrap();
        let EventPayload::Transform(t) = event.payload else {
            panic!("expected a transform");
        };
        assert_eq!(t.child_frame, "aruco_marker_7");
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn empty_batch_publishes_nothing() {
        let bus = EventBus::default();
        let ingest = ingest(&bus);
        assert_eq!(ingest.handle(&MarkerArray::default()), 0);
        assert_eq!(ingest.malformed(), 0);
    }

    #[test]
    fn sensor_clock_stamps_are_mapped_to_node_time() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tf);
        let clock = ManualClock::new(Timestamp::from_millis(1_700_000_000_000));
        let ingest = ingest_with(
            &bus,
            StampMapper::new(StampPolicy::Offset, Arc::new(clock.clone())),
        );

        // Sim-time header, far from the node's epoch clock.
        for (sim_ms, node_ms) in [(12_500, 0), (12_600, 100), (12_700, 200)] {
            clock.set(Timestamp::from_millis(1_700_000_000_000 + node_ms));
            let msg = MarkerArray {
                stamp: Timestamp::from_millis(sim_ms),
                markers: vec![detection(5, Some(good_pose()))],
            };
            assert_eq!(ingest.handle(&msg), 1);
            let EventPayload::Transform(t) = rx.try_recv().unwrap().payload else {
                panic!("expected a transform");
            };
            assert_eq!(t.stamp, clock.now());
        }
    }

    #[tokio::test]
    async fn run_consumes_marker_events() {
        use markernav_types::Event;
        use std::time::Duration;

        let bus = EventBus::default();
        let mut tf_rx = bus.subscribe_to(Topic::Tf);
        let ingest = Arc::new(ingest(&bus));
        let task = tokio::spawn(Arc::clone(&ingest).run(bus.subscribe_to(Topic::Markers)));

        let msg = MarkerArray {
            stamp: Timestamp::from_millis(50),
            markers: vec![detection(9, Some(good_pose()))],
        };
        bus.publish_to(Topic::Markers, Event::new("test", EventPayload::Markers(msg)))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), tf_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::Transform(ref t) if t.child_frame == "aruco_marker_9"));
        task.abort();
    }
}
