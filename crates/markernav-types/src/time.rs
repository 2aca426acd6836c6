//! Transform timestamps.
//!
//! Every transform and observation is stamped with a [`Timestamp`]: an
//! unsigned count of nanoseconds since the clock epoch (the UNIX epoch for
//! the system clock, zero for simulated clocks).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Nanoseconds since the clock epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The clock epoch.  Also used as the evaluation time of static-only
    /// transform chains.
    pub const ZERO: Self = Self(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Build from floating-point seconds.  Negative and non-finite values
    /// saturate to [`Timestamp::ZERO`].
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self((secs * 1e9).round() as u64)
    }

    /// Build from the ROS `builtin_interfaces/Time` pair.
    pub fn from_sec_nanosec(sec: i64, nanosec: u32) -> Self {
        if sec < 0 {
            return Self::ZERO;
        }
        Self((sec as u64).saturating_mul(1_000_000_000).saturating_add(nanosec as u64))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Split into whole seconds and the nanosecond remainder.
    pub const fn to_sec_nanosec(self) -> (u64, u32) {
        (self.0 / 1_000_000_000, (self.0 % 1_000_000_000) as u32)
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos().min(u64::MAX as u128) as u64))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_nanos().min(u64::MAX as u128) as u64))
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Self) -> Duration {
        Duration::from_nanos(self.0.abs_diff(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sec, nsec) = self.to_sec_nanosec();
        write!(f, "{sec}.{nsec:09}s")
    }
}
