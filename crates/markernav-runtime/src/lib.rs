//! `markernav-runtime` – the marker-following controller.
//!
//! # Modules
//!
//! - [`config`] – [`NodeConfig`]: frames, timing, gains and fixtures.
//! - [`marker_ingest`] – turns marker detections into camera→marker
//!   transforms.
//! - [`part_ingest`] – the same for logical-camera parts, named by color and
//!   type.
//! - [`debounce`] – [`MissDebounce`][debounce::MissDebounce]: tolerates brief
//!   detection dropouts while tracking.
//! - [`control_loop`] – [`ControlLoop`]: the per-tick Searching/Tracking
//!   state machine and follow law.
//! - [`node`] – [`FollowerNode`]: wires everything onto the event bus and
//!   runs the control timer.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console logs
//!   plus optional OTLP span export.

pub mod config;
pub mod control_loop;
pub mod debounce;
pub mod marker_ingest;
pub mod node;
pub mod part_ingest;
pub mod telemetry;

pub use config::{NodeConfig, PartCameraConfig, StaticTransformConfig};
pub use control_loop::{ControlLoop, TickOutcome, TrackingState};
pub use marker_ingest::MarkerIngest;
pub use node::FollowerNode;
pub use part_ingest::PartIngest;
pub use telemetry::{TracerProviderGuard, init_tracing};
