//! `markernav-types` – shared messages, geometry, time and errors.
//!
//! # Modules
//!
//! - [`geometry`] – [`Vec3`], [`Quaternion`] and [`Transform3D`].
//! - [`time`] – the nanosecond [`Timestamp`] carried by every transform.

pub mod geometry;
pub mod time;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use geometry::{Quaternion, Transform3D, Vec3};
pub use time::Timestamp;

// ────────────────────────────────────────────────────────────────────────────
// Transforms
// ────────────────────────────────────────────────────────────────────────────

/// A timestamped directed edge `parent_frame → child_frame`.
///
/// `transform` is the pose of `child_frame` expressed in `parent_frame`.
/// Once published a `StampedTransform` is never mutated; newer observations
/// are new entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    pub parent_frame: String,
    pub child_frame: String,
    pub stamp: Timestamp,
    pub transform: Transform3D,
}

impl StampedTransform {
    pub fn new(
        parent_frame: impl Into<String>,
        child_frame: impl Into<String>,
        stamp: Timestamp,
        transform: Transform3D,
    ) -> Self {
        Self {
            parent_frame: parent_frame.into(),
            child_frame: child_frame.into(),
            stamp,
            transform,
        }
    }
}

/// A transform as carried by the transport.  `latched` marks static
/// transforms that stay valid forever and are replayed to late subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformMessage {
    pub transform: StampedTransform,
    pub latched: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor observations
// ────────────────────────────────────────────────────────────────────────────

/// Pose of a detection as reported by a sensor.  Fields are optional because
/// upstream detectors occasionally emit incomplete poses; ingest rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseMsg {
    pub position: Option<Vec3>,
    pub orientation: Option<Quaternion>,
}

impl PoseMsg {
    pub fn new(position: Vec3, orientation: Quaternion) -> Self {
        Self {
            position: Some(position),
            orientation: Some(orientation),
        }
    }
}

/// One fiducial marker seen by the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDetection {
    pub marker_id: i64,
    pub pose: Option<PoseMsg>,
}

/// A batch of marker detections sharing one capture timestamp.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarkerArray {
    pub stamp: Timestamp,
    pub markers: Vec<MarkerDetection>,
}

/// One part reported by the logical camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartDetection {
    pub color: u8,
    pub part_type: u8,
    pub pose: Option<PoseMsg>,
}

/// A logical-camera frame: every part currently in view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LogicalCameraImage {
    pub stamp: Timestamp,
    pub parts: Vec<PartDetection>,
}

// ────────────────────────────────────────────────────────────────────────────
// Motion commands
// ────────────────────────────────────────────────────────────────────────────

/// Planar velocity command for the drive base.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityCommand {
    /// Forward velocity (m/s).
    pub linear: f64,
    /// Counter-clockwise yaw rate (rad/s).
    pub angular: f64,
}

impl VelocityCommand {
    pub fn new(linear: f64, angular: f64) -> Self {
        Self { linear, angular }
    }

    /// All-zero command.
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn is_stop(&self) -> bool {
        self.linear == 0.0 && self.angular == 0.0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "markernav-runtime::control_loop"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    Transform(StampedTransform),
    Markers(MarkerArray),
    PartImage(LogicalCameraImage),
    Velocity(VelocityCommand),
    Fault { component: String, message: String },
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Transform lookup failures.  These are expected at runtime and drive the
/// control loop's Searching state; they are never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TfError {
    #[error("frame '{0}' does not exist in the transform tree")]
    FrameNotFound(String),

    #[error("frames '{from_frame}' and '{to_frame}' are not connected")]
    NoCommonAncestor { from_frame: String, to_frame: String },

    #[error(
        "lookup of '{parent}' -> '{child}' at {requested} needs extrapolation (data covers {oldest}..{newest})"
    )]
    Extrapolation {
        parent: String,
        child: String,
        requested: Timestamp,
        oldest: Timestamp,
        newest: Timestamp,
    },
}

/// Global error type for MarkerNav.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavError {
    #[error("Transform Lookup Error: {0}")]
    Tf(#[from] TfError),

    #[error("Malformed Observation: {0}")]
    MalformedObservation(String),

    #[error("Transport Disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Event Bus Channel Error: {0}")]
    Channel(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}
