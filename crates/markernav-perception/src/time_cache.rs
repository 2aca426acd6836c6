//! Per-edge transform history.
//!
//! A [`TimeCache`] holds the samples of one `parent → child` edge ordered by
//! timestamp and answers "what was this edge at time `t`?" by interpolating
//! between the two bracketing samples.

use std::collections::VecDeque;
use std::time::Duration;

use markernav_types::{Timestamp, Transform3D};

/// One observation of an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub stamp: Timestamp,
    pub transform: Transform3D,
}

/// Why a [`TimeCache`] could not answer a query.  Mapped to
/// [`TfError::Extrapolation`][markernav_types::TfError::Extrapolation] by the
/// buffer, which knows the edge's frame names.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutOfRange {
    pub oldest: Timestamp,
    pub newest: Timestamp,
}

/// Timestamp-ordered samples of a single edge, bounded by a retention window.
#[derive(Debug, Clone)]
pub struct TimeCache {
    samples: VecDeque<Sample>,
    retention: Duration,
}

impl TimeCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    /// Insert a sample at its timestamp position and evict everything older
    /// than `newest - retention`.
    ///
    /// In-order arrival is a `push_back`; late samples are placed with a
    /// binary search.  Equal timestamps are kept, the new sample after the
    /// existing ones.
    pub fn insert(&mut self, sample: Sample) {
        match self.samples.back() {
            Some(last) if sample.stamp < last.stamp => {
                let pos = self.samples.partition_point(|s| s.stamp <= sample.stamp);
                self.samples.insert(pos, sample);
            }
            _ => self.samples.push_back(sample),
        }
        self.evict();
    }

    fn evict(&mut self) {
        let Some(newest) = self.samples.back().map(|s| s.stamp) else {
            return;
        };
        let horizon = newest.saturating_sub(self.retention);
        while self.samples.front().is_some_and(|s| s.stamp < horizon) {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.samples.front().map(|s| s.stamp)
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.samples.back().map(|s| s.stamp)
    }

    /// Evaluate the edge at `time`.
    ///
    /// Inside the sampled range the bracketing samples are interpolated.  A
    /// request up to `tolerance` before the oldest or after the newest sample
    /// is answered with that end sample; anything further out is an error.
    pub fn evaluate(&self, time: Timestamp, tolerance: Duration) -> Result<Transform3D, OutOfRange> {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return Err(OutOfRange {
                oldest: Timestamp::ZERO,
                newest: Timestamp::ZERO,
            });
        };
        let range = OutOfRange {
            oldest: first.stamp,
            newest: last.stamp,
        };

        if time < first.stamp {
            return if first.stamp.abs_diff(time) <= tolerance {
                Ok(first.transform)
            } else {
                Err(range)
            };
        }
        if time > last.stamp {
            return if time.abs_diff(last.stamp) <= tolerance {
                Ok(last.transform)
            } else {
                Err(range)
            };
        }

        // first.stamp <= time <= last.stamp, so pos >= 1.
        let pos = self.samples.partition_point(|s| s.stamp <= time);
        let before = self.samples[pos - 1];
        if before.stamp == time || pos == self.samples.len() {
            return Ok(before.transform);
        }
        let after = self.samples[pos];
        Ok(interpolate(&before, &after, time))
    }
}

/// Interpolate two samples of the same edge at `time`, which must lie in
/// `[before.stamp, after.stamp]`.
pub fn interpolate(before: &Sample, after: &Sample, time: Timestamp) -> Transform3D {
    let span = after.stamp.as_nanos().saturating_sub(before.stamp.as_nanos());
    if span == 0 {
        return after.transform;
    }
    let ratio = time.as_nanos().saturating_sub(before.stamp.as_nanos()) as f64 / span as f64;
    before.transform.interpolate(after.transform, ratio.clamp(0.0, 1.0))
}
