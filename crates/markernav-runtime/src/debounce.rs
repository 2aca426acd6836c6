//! [`MissDebounce`] – consecutive-miss counter for the tracking state.
//!
//! Tracking survives brief detection dropouts: the guard counts consecutive
//! failed lookups and only reports the target as lost once more than
//! `threshold` of them have happened in a row.  Any success resets the count.
//!
//! # Example
//!
//! ```rust
//! use markernav_runtime::debounce::MissDebounce;
//!
//! let mut guard = MissDebounce::new(2);
//!
//! assert!(!guard.record_miss());
//! assert!(!guard.record_miss());
//! assert!(guard.record_miss()); // third miss in a row → lost
//!
//! guard.reset();
//! assert!(!guard.record_miss());
//! ```

#[derive(Debug, Clone)]
pub struct MissDebounce {
    threshold: u32,
    misses: u32,
}

impl MissDebounce {
    /// `threshold` consecutive misses are tolerated; the next one trips.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            misses: 0,
        }
    }

    /// Record a failed lookup.  Returns `true` once the consecutive miss
    /// count exceeds the threshold.
    pub fn record_miss(&mut self) -> bool {
        self.misses = self.misses.saturating_add(1);
        self.misses > self.threshold
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Forget all recorded misses.
    pub fn reset(&mut self) {
        self.misses = 0;
    }
}
