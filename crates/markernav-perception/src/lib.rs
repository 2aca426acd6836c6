//! `markernav-perception` – the transform tree.
//!
//! Keeps the recent history of every frame-to-frame transform the robot has
//! observed and answers "where is frame B relative to frame A at time t?".
//!
//! # Modules
//!
//! - [`transform`] – [`TransformBuffer`][transform::TransformBuffer]: shared,
//!   time-indexed frame graph with interpolated multi-hop lookup.
//! - [`time_cache`] – [`TimeCache`][time_cache::TimeCache]: the bounded,
//!   timestamp-ordered sample history of a single edge.

pub mod time_cache;
pub mod transform;

pub use transform::TransformBuffer;
