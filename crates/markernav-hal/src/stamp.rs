//! Mapping sensor timestamps onto the node clock.
//!
//! Detections arrive stamped by whatever clock the sensor graph runs on
//! (often ROS sim time, or a host with its own NTP drift) while the control
//! loop looks transforms up at [`Clock::now`].  A [`StampMapper`] rewrites
//! incoming stamps according to a [`StampPolicy`] so both sides agree.
//!
//! The `offset` policy tracks `receipt - source` per message.  One-way
//! latency is never negative, so the smallest difference seen is the best
//! estimate of the clock offset: lower samples are adopted immediately,
//! higher ones are blended in slowly to follow drift, and a jump of more
//! than [`RESYNC_THRESHOLD`] (a restarted simulation, a stepped clock)
//! re-synchronises outright.  Mapped stamps keep the source's relative
//! spacing and never lie after the receipt time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use markernav_types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// A sample this far above the current offset estimate replaces it.
pub const RESYNC_THRESHOLD: Duration = Duration::from_secs(1);

/// Upward corrections move 1/`DRIFT_GAIN` of the way per sample.
const DRIFT_GAIN: i128 = 16;

/// How detection timestamps are brought onto the node clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StampPolicy {
    /// Keep the sensor stamp.  Only correct when sensor and node share a clock.
    Header,
    /// Replace the stamp with the node's receipt time.
    Receipt,
    /// Shift the stamp by the estimated sensor-to-node clock offset.
    #[default]
    Offset,
}

/// Running estimate of `node_clock - sensor_clock`.
#[derive(Debug, Clone, Default)]
pub struct ClockOffset {
    offset_ns: Option<i128>,
}

impl ClockOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current estimate in nanoseconds, if any sample has been seen.
    pub fn offset_nanos(&self) -> Option<i128> {
        self.offset_ns
    }

    /// Feed one `(source, receipt)` pair and return `source` on the node clock.
    pub fn observe(&mut self, source: Timestamp, receipt: Timestamp) -> Timestamp {
        let sample = i128::from(receipt.as_nanos()) - i128::from(source.as_nanos());
        let resync = RESYNC_THRESHOLD.as_nanos() as i128;
        let offset = match self.offset_ns {
            Some(current) if sample > current + resync => sample,
            Some(current) if sample > current => current + (sample - current) / DRIFT_GAIN,
            _ => sample,
        };
        self.offset_ns = Some(offset);

        let mapped = (i128::from(source.as_nanos()) + offset)
            .clamp(0, i128::from(receipt.as_nanos()));
        Timestamp::from_nanos(mapped as u64)
    }

    pub fn reset(&mut self) {
        self.offset_ns = None;
    }
}

/// Applies a [`StampPolicy`] against a node [`Clock`].
pub struct StampMapper {
    policy: StampPolicy,
    clock: Arc<dyn Clock>,
    offset: Mutex<ClockOffset>,
}

impl StampMapper {
    pub fn new(policy: StampPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            offset: Mutex::new(ClockOffset::new()),
        }
    }

    pub fn policy(&self) -> StampPolicy {
        self.policy
    }

    /// `source` expressed on the node clock, received now.
    pub fn map(&self, source: Timestamp) -> Timestamp {
        match self.policy {
            StampPolicy::Header => source,
            StampPolicy::Receipt => self.clock.now(),
            StampPolicy::Offset => {
                let receipt = self.clock.now();
                self.offset
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .observe(source, receipt)
            }
        }
    }

    /// Estimated `node - sensor` offset, `None` before the first sample or
    /// under other policies.
    pub fn offset_nanos(&self) -> Option<i128> {
        self.offset
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offset_nanos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const EPOCH_MS: u64 = 1_700_000_000_000;

    #[test]
    fn sim_time_stamps_land_on_the_node_clock() {
        let mut offset = ClockOffset::new();
        let mapped = offset.observe(Timestamp::from_millis(12_500), Timestamp::from_millis(EPOCH_MS));
        assert_eq!(mapped, Timestamp::from_millis(EPOCH_MS));

        // 100 ms later on both clocks, 20 ms more latency: spacing comes from
        // the sensor, the offset stays near the low-latency estimate.
        let mapped = offset.observe(
            Timestamp::from_millis(12_600),
            Timestamp::from_millis(EPOCH_MS + 120),
        );
        let expected_ns = (EPOCH_MS + 100) as i128 * 1_000_000 + 20_000_000 / DRIFT_GAIN;
        assert_eq!(i128::from(mapped.as_nanos()), expected_ns);
        assert!(mapped <= Timestamp::from_millis(EPOCH_MS + 120));
    }

    #[test]
    fn lower_latency_sample_is_adopted_immediately() {
        let mut offset = ClockOffset::new();
        offset.observe(Timestamp::from_millis(1_000), Timestamp::from_millis(5_050));
        offset.observe(Timestamp::from_millis(1_100), Timestamp::from_millis(5_110));
        assert_eq!(offset.offset_nanos(), Some(4_010_000_000));
    }

    #[test]
    fn large_jump_resynchronises() {
        let mut offset = ClockOffset::new();
        offset.observe(Timestamp::from_millis(60_000), Timestamp::from_millis(EPOCH_MS));
        // Simulation restarted: sensor time went back to 1 s.
        let mapped = offset.observe(Timestamp::from_millis(1_000), Timestamp::from_millis(EPOCH_MS + 100));
        assert_eq!(mapped, Timestamp::from_millis(EPOCH_MS + 100));

        offset.reset();
        assert!(offset.offset_nanos().is_none());
    }

    #[test]
    fn mapper_policies() {
        let clock = ManualClock::new(Timestamp::from_millis(EPOCH_MS));
        let sensor = Timestamp::from_millis(12_000);

        let header = StampMapper::new(StampPolicy::Header, Arc::new(clock.clone()));
        assert_eq!(header.map(sensor), sensor);
        assert!(header.offset_nanos().is_none());

        let receipt = StampMapper::new(StampPolicy::Receipt, Arc::new(clock.clone()));
        assert_eq!(receipt.map(sensor), Timestamp::from_millis(EPOCH_MS));

        let offset = StampMapper::new(StampPolicy::Offset, Arc::new(clock.clone()));
        assert_eq!(offset.map(sensor), Timestamp::from_millis(EPOCH_MS));
        clock.advance(Duration::from_millis(100));
        assert_eq!(
            offset.map(Timestamp::from_millis(12_100)),
            Timestamp::from_millis(EPOCH_MS + 100)
        );
    }

    #[test]
    fn policy_names_in_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: StampPolicy,
        }
        let w: Wrapper = serde_json::from_str(r#"{"policy":"receipt"}"#).unwrap();
        assert_eq!(w.policy, StampPolicy::Receipt);
        assert_eq!(StampPolicy::default(), StampPolicy::Offset);
    }
}
