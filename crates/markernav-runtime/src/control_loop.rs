//! Periodic marker-following control law.
//!
//! Each [`ControlLoop::tick`] looks up the target marker in the robot base
//! frame and turns the result into a [`VelocityCommand`]:
//!
//! ```text
//! e_x  = x - goal_distance          linear  = PID_lin(e_x)  clamped to ±max_linear_speed
//! e_θ  = atan2(y, x)                angular = PID_ang(e_θ)  clamped to ±max_angular_speed
//! ```
//!
//! # States
//!
//! | State | Lookup succeeds | Lookup fails |
//! |---|---|---|
//! | [`TrackingState::Searching`] | compute command, → Tracking | search command |
//! | [`TrackingState::Tracking`] | compute command | repeat last command; after more than `debounce_ticks` misses → Searching + stop |
//!
//! A tick never waits for data and never returns an error: lookup failures
//! are reported in the [`TickOutcome`].

use std::num::NonZeroU32;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use markernav_hal::PidController;
use markernav_perception::TransformBuffer;
use markernav_types::{TfError, Timestamp, VelocityCommand};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::debounce::MissDebounce;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Searching,
    Tracking,
}

/// What one tick decided.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub state: TrackingState,
    pub command: VelocityCommand,
    /// Set when this tick's lookup failed.
    pub lookup_error: Option<TfError>,
}

pub struct ControlLoop {
    buffer: TransformBuffer,
    base_frame: String,
    marker_frame: String,
    goal_distance: f64,
    search_command: VelocityCommand,
    dt: f64,
    linear: PidController,
    angular: PidController,
    debounce: MissDebounce,
    state: TrackingState,
    last_command: VelocityCommand,
    lookup_warnings: DefaultDirectRateLimiter,
}

impl ControlLoop {
    pub fn new(config: &NodeConfig, buffer: TransformBuffer) -> Self {
        Self {
            buffer,
            base_frame: config.base_frame.clone(),
            marker_frame: config.marker_frame(),
            goal_distance: config.goal_distance,
            search_command: VelocityCommand::new(0.0, config.search_angular_speed),
            dt: config.tick_period().as_secs_f64(),
            linear: PidController::with_limit(config.linear_gains, config.max_linear_speed),
            angular: PidController::with_limit(config.angular_gains, config.max_angular_speed),
            debounce: MissDebounce::new(config.debounce_ticks),
            state: TrackingState::Searching,
            last_command: VelocityCommand::stop(),
            lookup_warnings: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn marker_frame(&self) -> &str {
        &self.marker_frame
    }

    /// Run one control step at time `now`.
    pub fn tick(&mut self, now: Timestamp) -> TickOutcome {
        match self.buffer.lookup(&self.base_frame, &self.marker_frame, now) {
            Ok(found) => {
                let p = found.transform.translation;
                let command = VelocityCommand::new(
                    self.linear.update_error(p.x - self.goal_distance, self.dt),
                    self.angular.update_error(p.y.atan2(p.x), self.dt),
                );
                if self.state == TrackingState::Searching {
                    info!(marker = %self.marker_frame, x = p.x, y = p.y, "marker acquired");
                }
                self.state = TrackingState::Tracking;
                self.debounce.reset();
                self.last_command = command;
                TickOutcome {
                    state: self.state,
                    command,
                    lookup_error: None,
                }
            }
            Err(e) => {
                if self.lookup_warnings.check().is_ok() {
                    warn!(marker = %self.marker_frame, error = %e, state = ?self.state, "marker lookup failed");
                }
                let command = match self.state {
                    TrackingState::Searching => self.search_command,
                    TrackingState::Tracking if self.debounce.record_miss() => {
                        info!(
                            marker = %self.marker_frame,
                            misses = self.debounce.misses(),
                            "marker lost, searching"
                        );
                        self.state = TrackingState::Searching;
                        self.linear.reset();
                        self.angular.reset();
                        self.debounce.reset();
                        self.last_command = VelocityCommand::stop();
                        VelocityCommand::stop()
                    }
                    TrackingState::Tracking => self.last_command,
                };
                TickOutcome {
                    state: self.state,
                    command,
                    lookup_error: Some(e),
                }
            }
        }
    }
}
