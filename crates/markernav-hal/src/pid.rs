//! Generic PID (Proportional–Integral–Derivative) controller.
//!
//! The controller computes a corrective output that drives a measured value
//! toward a desired set-point.  It is hardware-agnostic: the caller supplies
//! the measurement (or the error directly) and the elapsed time, and receives
//! the clamped output.  With `ki = kd = 0` it reduces to a clamped
//! proportional law.
//!
//! # Example
//!
//! ```rust
//! use markernav_hal::pid::PidController;
//!
//! let mut pid = PidController::new(0.5, 0.0, 0.0);
//! pid.set_output_limits(-0.3, 0.3);
//!
//! // 1 m of forward error at a 100 ms tick.
//! let output = pid.update_error(1.0, 0.1);
//! assert!((output - 0.3).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};

/// PID gains, as loaded from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
}

impl PidGains {
    /// Proportional-only gains.
    pub fn proportional(kp: f64) -> Self {
        Self { kp, ki: 0.0, kd: 0.0 }
    }
}

/// A tunable PID controller for closed-loop feedback control.
///
/// Gains and output limits are configurable after construction via
/// [`PidController::set_gains`] and [`PidController::set_output_limits`].
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    set_point: f64,
    integral: f64,
    last_error: Option<f64>,
    output_min: f64,
    output_max: f64,
}

impl PidController {
    /// Create a new controller with the given gains.
    ///
    /// Output is unclamped by default (`f64::NEG_INFINITY` to `f64::INFINITY`).
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            set_point: 0.0,
            integral: 0.0,
            last_error: None,
            output_min: f64::NEG_INFINITY,
            output_max: f64::INFINITY,
        }
    }

    /// Build from configured gains with a symmetric output limit.
    pub fn with_limit(gains: PidGains, limit: f64) -> Self {
        let mut pid = Self::new(gains.kp, gains.ki, gains.kd);
        pid.set_output_limits(-limit.abs(), limit.abs());
        pid
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64, kd: f64) {
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn set_set_point(&mut self, set_point: f64) {
        self.set_point = set_point;
    }

    pub fn set_point(&self) -> f64 {
        self.set_point
    }

    /// Clamp the controller output to `[min, max]`.
    ///
    /// Integral wind-up is also clamped to this range.
    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Compute the next output from a measurement of the process variable.
    ///
    /// Returns `0.0` without updating internal state if `dt` is not positive.
    pub fn update(&mut self, measurement: f64, dt: f64) -> f64 {
        self.update_error(self.set_point - measurement, dt)
    }

    /// Compute the next output from an already-computed error signal.
    ///
    /// Returns `0.0` without updating internal state if `dt` is not positive.
    pub fn update_error(&mut self, error: f64, dt: f64) -> f64 {
        if dt <= 0.0 {
            return 0.0;
        }

        let p = self.kp * error;

        // Integral term with anti-windup clamping.
        self.integral += error * dt;
        let i = (self.ki * self.integral).clamp(self.output_min, self.output_max);
        if self.ki.abs() > f64::EPSILON {
            self.integral = i / self.ki;
        }

        // Derivative term (backward difference).
        let d = match self.last_error {
            Some(prev) => self.kd * (error - prev) / dt,
            None => 0.0,
        };
        self.last_error = Some(error);

        (p + i + d).clamp(self.output_min, self.output_max)
    }

    /// Reset internal state (integral accumulator and derivative memory).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_only_drives_toward_set_point() {
        let mut pid = PidController::new(2.0, 0.0, 0.0);
        pid.set_set_point(10.0);
        // error = 10.0 - 0.0 = 10.0 → output = 2.0 * 10.0 = 20.0
        let output = pid.update(0.0, 0.1);
        assert!((output - 20.0).abs() < 1e-9);
    }

    #[test]
    fn update_error_matches_update() {
        let mut a = PidController::new(1.5, 0.2, 0.1);
        let mut b = a.clone();
        a.set_set_point(3.0);
        for measurement in [0.0, 0.5, 1.2, 2.8] {
            let out_a = a.update(measurement, 0.1);
            let out_b = b.update_error(3.0 - measurement, 0.1);
            assert!((out_a - out_b).abs() < 1e-12);
        }
    }

    #[test]
    fn output_clamped_to_limits() {
        let mut pid = PidController::with_limit(PidGains::proportional(100.0), 1.0);
        assert!((pid.update_error(1.0, 0.01) - 1.0).abs() < 1e-12);
        assert!((pid.update_error(-1.0, 0.01) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn integral_accumulates_over_time() {
        let mut pid = PidController::new(0.0, 1.0, 0.0);
        pid.set_set_point(2.0);
        pid.update(1.0, 0.5); // integral += 1.0 * 0.5 = 0.5
        let out = pid.update(1.0, 0.5); // integral → 1.0, output = 1.0
        assert!((out - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = PidController::new(1.0, 1.0, 1.0);
        pid.set_set_point(5.0);
        pid.update(0.0, 0.1);
        pid.reset();

        let out_after_reset = pid.update(0.0, 0.1);
        let mut fresh = PidController::new(1.0, 1.0, 1.0);
        fresh.set_set_point(5.0);
        let out_fresh = fresh.update(0.0, 0.1);
        assert!((out_after_reset - out_fresh).abs() < 1e-12);
    }

    #[test]
    fn set_gains_updates_behavior() {
        let mut pid = PidController::new(1.0, 0.0, 0.0);
        pid.set_set_point(10.0);
        pid.set_gains(3.0, 0.0, 0.0);
        assert!((pid.update(0.0, 0.1) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_dt_returns_zero_without_side_effects() {
        let mut pid = PidController::new(1.0, 1.0, 1.0);
        pid.set_set_point(5.0);
        assert_eq!(pid.update(0.0, 0.0), 0.0);
        assert_eq!(pid.update(0.0, -0.1), 0.0);
        let mut fresh = PidController::new(1.0, 1.0, 1.0);
        fresh.set_set_point(5.0);
        assert!((pid.update(0.0, 0.1) - fresh.update(0.0, 0.1)).abs() < 1e-12);
    }

    #[test]
    fn gains_deserialize_with_defaults() {
        let gains: PidGains = serde_json::from_str(r#"{"kp":0.8}"#).unwrap();
        assert_eq!(gains, PidGains::proportional(0.8));
    }
}
