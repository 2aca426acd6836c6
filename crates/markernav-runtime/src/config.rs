//! Node configuration.
//!
//! [`NodeConfig`] is the `[node]` table of `~/.markernav/config.toml`.  Every
//! field has a default, so an empty table yields a working follower for
//! marker `0` seen by a camera mounted at the robot base.

use std::time::Duration;

use markernav_hal::{PidGains, StampPolicy};
use markernav_types::{NavError, Quaternion, StampedTransform, Timestamp, Transform3D, Vec3};
use serde::{Deserialize, Serialize};

/// A fixed transform broadcast once, latched, at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTransformConfig {
    pub parent_frame: String,
    pub child_frame: String,
    /// `[x, y, z]` in metres.
    #[serde(default)]
    pub translation: [f64; 3],
    /// `[roll, pitch, yaw]` in radians.
    #[serde(default)]
    pub rotation_rpy: [f64; 3],
}

impl StaticTransformConfig {
    pub fn to_transform(&self, stamp: Timestamp) -> StampedTransform {
        let [x, y, z] = self.translation;
        let [roll, pitch, yaw] = self.rotation_rpy;
        StampedTransform::new(
            self.parent_frame.clone(),
            self.child_frame.clone(),
            stamp,
            Transform3D::new(Vec3::new(x, y, z), Quaternion::from_rpy(roll, pitch, yaw)),
        )
    }
}

/// Second camera reporting parts by color and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartCameraConfig {
    #[serde(default = "default_part_camera_frame")]
    pub camera_frame: String,
    #[serde(default = "default_part_frame_prefix")]
    pub frame_prefix: String,
}

impl Default for PartCameraConfig {
    fn default() -> Self {
        Self {
            camera_frame: default_part_camera_frame(),
            frame_prefix: default_part_frame_prefix(),
        }
    }
}

fn default_part_camera_frame() -> String {
    "logical_camera_link".to_string()
}
fn default_part_frame_prefix() -> String {
    "part_".to_string()
}

/// Parameters of the marker-following node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Robot frame the control law works in.
    pub base_frame: String,
    /// Frame marker poses are reported in.
    pub camera_frame: String,
    /// Marker frames are named `{marker_frame_prefix}{id}`.
    pub marker_frame_prefix: String,
    pub target_marker_id: i64,
    pub tick_period_ms: u64,
    /// History kept per transform edge.
    pub buffer_retention_s: f64,
    /// How far a lookup may reach past the newest or oldest sample.
    pub extrapolation_tolerance_ms: u64,
    pub max_linear_speed: f64,
    pub max_angular_speed: f64,
    /// Missed lookups tolerated while tracking before giving up.
    pub debounce_ticks: u32,
    /// Distance to hold in front of the marker (m).
    pub goal_distance: f64,
    /// Yaw rate while searching; `0` stops the robot.
    pub search_angular_speed: f64,
    /// How marker stamps from the sensor clock are mapped onto node time.
    pub stamp_policy: StampPolicy,
    pub linear_gains: PidGains,
    pub angular_gains: PidGains,
    pub static_transforms: Vec<StaticTransformConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_camera: Option<PartCameraConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            base_frame: "base_link".to_string(),
            camera_frame: "camera_link".to_string(),
            marker_frame_prefix: "aruco_marker_".to_string(),
            target_marker_id: 0,
            tick_period_ms: 100,
            buffer_retention_s: 10.0,
            extrapolation_tolerance_ms: 250,
            max_linear_speed: 0.5,
            max_angular_speed: 1.0,
            debounce_ticks: 5,
            goal_distance: 0.0,
            search_angular_speed: 0.0,
            stamp_policy: StampPolicy::Offset,
            linear_gains: PidGains::proportional(0.5),
            angular_gains: PidGains::proportional(1.0),
            static_transforms: vec![StaticTransformConfig {
                parent_frame: "base_link".to_string(),
                child_frame: "camera_link".to_string(),
                translation: [0.0; 3],
                rotation_rpy: [0.0; 3],
            }],
            part_camera: None,
        }
    }
}

impl NodeConfig {
    /// Frame name of the marker the control loop follows.
    pub fn marker_frame(&self) -> String {
        format!("{}{}", self.marker_frame_prefix, self.target_marker_id)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::try_from_secs_f64(self.buffer_retention_s).unwrap_or(Duration::ZERO)
    }

    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.extrapolation_tolerance_ms)
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<(), NavError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(NavError::Config(format!("{name} must be positive, got {v}")))
            }
        };
        let finite = |name: &str, v: f64| {
            if v.is_finite() {
                Ok(())
            } else {
                Err(NavError::Config(format!("{name} must be finite")))
            }
        };

        for (name, frame) in [
            ("base_frame", &self.base_frame),
            ("camera_frame", &self.camera_frame),
            ("marker_frame_prefix", &self.marker_frame_prefix),
        ] {
            if frame.trim().is_empty() {
                return Err(NavError::Config(format!("{name} must not be empty")));
            }
        }
        if self.target_marker_id < 0 {
            return Err(NavError::Config(format!(
                "target_marker_id must be non-negative, got {}",
                self.target_marker_id
            )));
        }
        if self.tick_period_ms == 0 {
            return Err(NavError::Config("tick_period_ms must be positive".into()));
        }
        positive("buffer_retention_s", self.buffer_retention_s)?;
        positive("max_linear_speed", self.max_linear_speed)?;
        positive("max_angular_speed", self.max_angular_speed)?;
        finite("goal_distance", self.goal_distance)?;
        finite("search_angular_speed", self.search_angular_speed)?;
        for (name, gains) in [("linear_gains", self.linear_gains), ("angular_gains", self.angular_gains)] {
            finite(name, gains.kp)?;
            finite(name, gains.ki)?;
            finite(name, gains.kd)?;
        }
        if self.tolerance() > self.retention() {
            return Err(NavError::Config(format!(
                "extrapolation_tolerance_ms ({}) exceeds the retention window ({} s)",
                self.extrapolation_tolerance_ms, self.buffer_retention_s
            )));
        }
        if self.search_angular_speed.abs() > self.max_angular_speed {
            return Err(NavError::Config(
                "search_angular_speed exceeds max_angular_speed".into(),
            ));
        }
        for st in &self.static_transforms {
            if st.parent_frame.is_empty() || st.child_frame.is_empty() || st.parent_frame == st.child_frame {
                return Err(NavError::Config(format!(
                    "invalid static transform '{}' -> '{}'",
                    st.parent_frame, st.child_frame
                )));
            }
            if st.translation.iter().chain(&st.rotation_rpy).any(|v| !v.is_finite()) {
                return Err(NavError::Config(format!(
                    "static transform '{}' -> '{}' has non-finite values",
                    st.parent_frame, st.child_frame
                )));
            }
        }
        if let Some(pc) = &self.part_camera {
            if pc.camera_frame.trim().is_empty() || pc.frame_prefix.trim().is_empty() {
                return Err(NavError::Config("part_camera frames must not be empty".into()));
            }
        }
        Ok(())
    }
}
