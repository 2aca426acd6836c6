//! Logical-camera parts → camera-to-part transforms.
//!
//! Parts carry no identifier, only a color and a type code, so frames are
//! named after both: `{prefix}{color}_{type}`, e.g. `part_blue_pump`.  When
//! one image holds several parts of the same kind the later ones get a
//! numeric suffix (`part_blue_pump_1`, `part_blue_pump_2`, ...).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use markernav_middleware::{TopicReceiver, TransformBroadcaster};
use markernav_types::{EventPayload, LogicalCameraImage, StampedTransform};
use tracing::{debug, info, warn};

use crate::marker_ingest::pose_to_transform;

/// Human-readable part color, falling back to the numeric code.
pub fn color_name(code: u8) -> String {
    match code {
        0 => "red".to_string(),
        1 => "green".to_string(),
        2 => "blue".to_string(),
        3 => "orange".to_string(),
        4 => "purple".to_string(),
        other => other.to_string(),
    }
}

/// Human-readable part type, falling back to the numeric code.
pub fn type_name(code: u8) -> String {
    match code {
        10 => "battery".to_string(),
        11 => "pump".to_string(),
        12 => "sensor".to_string(),
        13 => "regulator".to_string(),
        other => other.to_string(),
    }
}

pub struct PartIngest {
    broadcaster: Arc<TransformBroadcaster>,
    camera_frame: String,
    frame_prefix: String,
    published: AtomicU64,
    malformed: AtomicU64,
}

impl PartIngest {
    pub fn new(
        broadcaster: Arc<TransformBroadcaster>,
        camera_frame: impl Into<String>,
        frame_prefix: impl Into<String>,
    ) -> Self {
        Self {
            broadcaster,
            camera_frame: camera_frame.into(),
            frame_prefix: frame_prefix.into(),
            published: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Frame names for every part in `image`, in order.
    pub fn frame_names(&self, image: &LogicalCameraImage) -> Vec<String> {
        let mut seen: HashMap<(u8, u8), usize> = HashMap::new();
        image
            .parts
            .iter()
            .map(|part| {
                let base = format!(
                    "{}{}_{}",
                    self.frame_prefix,
                    color_name(part.color),
                    type_name(part.part_type)
                );
                let n = seen.entry((part.color, part.part_type)).or_insert(0);
                let name = if *n == 0 { base } else { format!("{base}_{n}") };
                *n += 1;
                name
            })
            .collect()
    }

    /// Broadcast every valid part in `image`.  Returns how many were
    /// published.
    pub fn handle(&self, image: &LogicalCameraImage) -> usize {
        let mut sent = 0;
        for (part, frame) in image.parts.iter().zip(self.frame_names(image)) {
            match pose_to_transform(part.pose.as_ref()) {
                Ok(transform) => {
                    let t = StampedTransform::new(self.camera_frame.clone(), frame, image.stamp, transform);
                    if self.broadcaster.send_transform(t).is_ok() {
                        self.published.fetch_add(1, Ordering::Relaxed);
                        sent += 1;
                    }
                }
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(%frame, error = %e, "dropping part detection");
                }
            }
        }
        debug!(stamp = %image.stamp, parts = image.parts.len(), sent, "part image");
        sent
    }

    pub async fn run(self: Arc<Self>, mut rx: TopicReceiver) {
        info!(camera = %self.camera_frame, "part ingest started");
        while let Some(event) = rx.next_event().await {
            if let EventPayload::PartImage(image) = event.payload {
                self.handle(&image);
            }
        }
        info!("part ingest stopped");
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
    use markernav_middleware::{EventBus, Topic};
    use markernav_types::{PartDetection, PoseMsg, Quaternion, Timestamp, Vec3};

    fn part(color: u8, part_type: u8, pose: Option<PoseMsg>) -> PartDetection {
        PartDetection { color, part_type, pose }
    }

    fn pose(x: f64) -> Option<PoseMsg> {
        Some(PoseMsg::new(Vec3::new(x, 0.0, 0.0), Quaternion::identity()))
    }

    fn ingest(bus: &EventBus) -> PartIngest {
        let broadcaster = Arc::new(TransformBroadcaster::new(Arc::new(bus.clone())));
        PartIngest::new(broadcaster, "logical_camera_link", "part_")
    }

    #[test]
    fn names_parts_by_color_and_type() {
        let bus = EventBus::default();
        let ingest = ingest(&bus);
        let image = LogicalCameraImage {
            stamp: Timestamp::ZERO,
            parts: vec![
                part(2, 11, pose(0.1)),
                part(0, 10, pose(0.2)),
                part(2, 11, pose(0.3)),
                part(2, 11, pose(0.4)),
                part(9, 42, pose(0.5)),
            ],
        };
        assert_eq!(
            ingest.frame_names(&image),
            vec![
                "part_blue_pump",
                "part_red_battery",
                "part_blue_pump_1",
                "part_blue_pump_2",
                "part_9_42",
            ]
        );
    }

    #[test]
    fn publishes_valid_parts_and_counts_the_rest() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Tf);
        let ingest = ingest(&bus);
        let image = LogicalCameraImage {
            stamp: Timestamp::from_millis(300),
            parts: vec![part(1, 12, None), part(4, 13, pose(0.7))],
        };

        assert_eq!(ingest.handle(&image), 1);
        assert_eq!(ingest.malformed(), 1);
        assert_eq!(ingest.published(), 1);

        let EventPayload::Transform(t) = rx.try_recv().unwrap().payload else {
            panic!("expected a transform");
        };
        assert_eq!(t.parent_frame, "logical_camera_link");
        assert_eq!(t.child_frame, "part_purple_regulator");
        assert_eq!(t.stamp, Timestamp::from_millis(300));
    }
}
