//! Time-indexed Transform Buffer.
//!
//! Maintains the graph of named reference frames and a bounded history of
//! the [`Transform3D`]s that relate them.  Given any two frame names and a
//! time, the buffer finds the chain of edges connecting them via BFS,
//! evaluates each edge at that time (interpolating between samples) and
//! composes the result.
//!
//! The buffer is a cheap `Clone` handle around shared state: the listener
//! inserts while the control loop looks up.  Every lookup composes under a
//! single read guard, so a multi-hop result never mixes edges from before
//! and after a concurrent insert.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use markernav_perception::transform::TransformBuffer;
//! use markernav_types::{Quaternion, StampedTransform, Timestamp, Transform3D, Vec3};
//!
//! let buffer = TransformBuffer::new(Duration::from_secs(10), Duration::from_millis(100));
//!
//! // robot_base is 1 m forward of world origin, same orientation.
//! buffer.insert_static(StampedTransform::new("world", "robot_base", Timestamp::ZERO,
//!     Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::identity())));
//!
//! // camera is 0.5 m forward of robot_base at t = 1 s.
//! buffer.insert(StampedTransform::new("robot_base", "camera", Timestamp::from_millis(1000),
//!     Transform3D::new(Vec3::new(0.5, 0.0, 0.0), Quaternion::identity())));
//!
//! let t = buffer.lookup("world", "camera", Timestamp::from_millis(1000)).unwrap();
//! assert!((t.transform.translation.x - 1.5).abs() < 1e-9);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use markernav_types::{StampedTransform, TfError, Timestamp, Transform3D};
use tracing::trace;

use crate::time_cache::{Sample, TimeCache};

/// `(parent, child)` key of a directed edge.
type EdgeKey = (String, String);

// ────────────────────────────────────────────────────────────────────────────
// Internal state
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BufferState {
    /// Time-ordered samples of every dynamic edge.
    dynamic: HashMap<EdgeKey, TimeCache>,
    /// Latched edges, valid at every time.
    statics: HashMap<EdgeKey, Transform3D>,
    /// Undirected adjacency index: `frame -> neighbours`.  Ordered so that
    /// path selection is deterministic.
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

/// How an edge is traversed on a lookup path.
#[derive(Debug, Clone)]
struct Hop {
    parent: String,
    child: String,
    /// `true` when walking child → parent, i.e. the edge must be inverted.
    inverted: bool,
}

impl BufferState {
    fn link(&mut self, parent: &str, child: &str) {
        self.adjacency
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.adjacency
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    fn insert_dynamic(&mut self, transform: StampedTransform, retention: Duration) {
        self.link(&transform.parent_frame, &transform.child_frame);
        self.dynamic
            .entry((transform.parent_frame, transform.child_frame))
            .or_insert_with(|| TimeCache::new(retention))
            .insert(Sample {
                stamp: transform.stamp,
                transform: transform.transform,
            });
    }

    fn has_edge(&self, parent: &str, child: &str) -> bool {
        let key = (parent.to_string(), child.to_string());
        self.statics.contains_key(&key) || self.dynamic.contains_key(&key)
    }

    /// BFS over the undirected frame graph.  Returns the hops from `from` to
    /// `to`.  Terminates on cyclic input thanks to the visited set.
    fn find_path(&self, from: &str, to: &str) -> Option<Vec<Hop>> {
        let mut previous: HashMap<&str, (&str, Hop)> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        visited.insert(from);
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut hops = Vec::new();
                let mut node = to;
                while let Some((prev, hop)) = previous.get(node) {
                    hops.push(hop.clone());
                    node = *prev;
                }
                hops.reverse();
                return Some(hops);
            }
            let Some(neighbours) = self.adjacency.get(current) else {
                continue;
            };
            for next in neighbours {
                if visited.contains(next.as_str()) {
                    continue;
                }
                // Prefer the forward edge when both directions were published.
                let hop = if self.has_edge(current, next) {
                    Hop {
                        parent: current.to_string(),
                        child: next.clone(),
                        inverted: false,
                    }
                } else {
                    Hop {
                        parent: next.clone(),
                        child: current.to_string(),
                        inverted: true,
                    }
                };
                visited.insert(next.as_str());
                previous.insert(next.as_str(), (current, hop));
                queue.push_back(next.as_str());
            }
        }
        None
    }

    fn evaluate_hop(
        &self,
        hop: &Hop,
        time: Timestamp,
        tolerance: Duration,
    ) -> Result<Transform3D, TfError> {
        let key = (hop.parent.clone(), hop.child.clone());
        let edge = if let Some(fixed) = self.statics.get(&key) {
            *fixed
        } else if let Some(cache) = self.dynamic.get(&key) {
            cache.evaluate(time, tolerance).map_err(|range| TfError::Extrapolation {
                parent: hop.parent.clone(),
                child: hop.child.clone(),
                requested: time,
                oldest: range.oldest,
                newest: range.newest,
            })?
        } else {
            return Err(TfError::NoCommonAncestor {
                from_frame: hop.parent.clone(),
                to_frame: hop.child.clone(),
            });
        };
        Ok(if hop.inverted { edge.inverse() } else { edge })
    }

    fn resolve_path(&self, from_frame: &str, to_frame: &str) -> Result<Vec<Hop>, TfError> {
        for frame in [from_frame, to_frame] {
            if !self.adjacency.contains_key(frame) {
                return Err(TfError::FrameNotFound(frame.to_string()));
            }
        }
        self.find_path(from_frame, to_frame)
            .ok_or_else(|| TfError::NoCommonAncestor {
                from_frame: from_frame.to_string(),
                to_frame: to_frame.to_string(),
            })
    }

    fn compose(
        &self,
        hops: &[Hop],
        time: Timestamp,
        tolerance: Duration,
    ) -> Result<Transform3D, TfError> {
        hops.iter()
            .try_fold(Transform3D::identity(), |acc, hop| -> Result<Transform3D, TfError> {
                Ok(acc.compose(self.evaluate_hop(hop, time, tolerance)?))
            })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TransformBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Shared, time-indexed store of frame-to-frame transforms.
///
/// Frames are identified by arbitrary string names (e.g. `"base_link"`,
/// `"camera_link"`, `"aruco_marker_5"`).  Edges are directional but lookups
/// traverse them both ways, inverting where needed.
#[derive(Debug, Clone)]
pub struct TransformBuffer {
    state: Arc<RwLock<BufferState>>,
    retention: Duration,
    tolerance: Duration,
}

impl TransformBuffer {
    /// Create an empty buffer.
    ///
    /// - `retention` – how much history each edge keeps, measured back from
    ///   its newest sample.
    /// - `tolerance` – how far a lookup may reach past either end of an
    ///   edge's samples before it fails with [`TfError::Extrapolation`].
    pub fn new(retention: Duration, tolerance: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(BufferState::default())),
            retention,
            tolerance,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    fn read(&self) -> RwLockReadGuard<'_, BufferState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BufferState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a timestamped sample of a dynamic edge.
    ///
    /// Samples are ordered by timestamp, not arrival.  Duplicates are kept.
    pub fn insert(&self, transform: StampedTransform) {
        trace!(
            parent = %transform.parent_frame,
            child = %transform.child_frame,
            stamp = %transform.stamp,
            "insert transform"
        );
        self.write().insert_dynamic(transform, self.retention);
    }

    /// Insert several dynamic samples under one write guard, so no lookup
    /// observes only part of the batch.
    pub fn insert_batch(&self, transforms: impl IntoIterator<Item = StampedTransform>) {
        let mut state = self.write();
        for transform in transforms {
            trace!(
                parent = %transform.parent_frame,
                child = %transform.child_frame,
                stamp = %transform.stamp,
                "insert transform"
            );
            state.insert_dynamic(transform, self.retention);
        }
    }

    /// Register a latched edge, valid at every time.  Re-registering the same
    /// edge replaces it.
    pub fn insert_static(&self, transform: StampedTransform) {
        trace!(
            parent = %transform.parent_frame,
            child = %transform.child_frame,
            "insert static transform"
        );
        let mut state = self.write();
        state.link(&transform.parent_frame, &transform.child_frame);
        state.statics.insert(
            (transform.parent_frame, transform.child_frame),
            transform.transform,
        );
    }

    /// Pose of `target_frame` expressed in `source_frame` at `time`.
    ///
    /// # Errors
    ///
    /// - [`TfError::FrameNotFound`] – either frame was never inserted.
    /// - [`TfError::NoCommonAncestor`] – no chain of edges connects them.
    /// - [`TfError::Extrapolation`] – an edge on the chain has no data within
    ///   the tolerance of `time`.
    pub fn lookup(
        &self,
        source_frame: &str,
        target_frame: &str,
        time: Timestamp,
    ) -> Result<StampedTransform, TfError> {
        let state = self.read();
        let hops = state.resolve_path(source_frame, target_frame)?;
        let transform = state.compose(&hops, time, self.tolerance)?;
        Ok(StampedTransform::new(source_frame, target_frame, time, transform))
    }

    /// Like [`lookup`][Self::lookup], evaluated at the most recent time for
    /// which every dynamic edge on the chain has data.  Static-only chains
    /// evaluate at [`Timestamp::ZERO`].
    pub fn lookup_latest(
        &self,
        source_frame: &str,
        target_frame: &str,
    ) -> Result<StampedTransform, TfError> {
        let state = self.read();
        let hops = state.resolve_path(source_frame, target_frame)?;
        let time = hops
            .iter()
            .filter_map(|hop| {
                state
                    .dynamic
                    .get(&(hop.parent.clone(), hop.child.clone()))
                    .and_then(TimeCache::newest)
            })
            .min()
            .unwrap_or(Timestamp::ZERO);
        let transform = state.compose(&hops, time, self.tolerance)?;
        Ok(StampedTransform::new(source_frame, target_frame, time, transform))
    }

    /// `true` when [`lookup`][Self::lookup] would succeed.
    pub fn can_transform(&self, source_frame: &str, target_frame: &str, time: Timestamp) -> bool {
        self.lookup(source_frame, target_frame, time).is_ok()
    }

    /// Every frame name known to the buffer, sorted.
    pub fn frames(&self) -> Vec<String> {
        self.read().adjacency.keys().cloned().collect()
    }

    pub fn has_frame(&self, frame: &str) -> bool {
        self.read().adjacency.contains_key(frame)
    }

    /// Number of retained samples for the dynamic edge `parent → child`.
    pub fn sample_count(&self, parent: &str, child: &str) -> usize {
        self.read()
            .dynamic
            .get(&(parent.to_string(), child.to_string()))
            .map_or(0, TimeCache::len)
    }

    /// Drop every edge and frame.
    pub fn clear(&self) {
        *self.write() = BufferState::default();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
