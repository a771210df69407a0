//! Shared state between the tracking (caller) thread and the mapping worker.
//!
//! The map (points, poses, version) lives behind one reader/writer lock so a
//! commit publishes points, poses and the new version together. Everything else
//! is small and has its own lock or atomic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::map::{MapState, PointId};
use crate::tracking::state::AtomicTrackerState;
use crate::tracking::statistics::{PerformanceStatistics, Timer};
use crate::tracking::TrackerState;

/// Shared state accessible by both threads.
pub struct SharedState {
    /// Map points, camera poses and map version.
    /// Tracking takes short read/write locks, the worker writes only to commit.
    pub map: RwLock<MapState>,

    /// Points rejected as outliers by pose estimation, waiting for precision repair.
    inaccurate_points: Mutex<HashSet<PointId>>,

    tracker_state: AtomicTrackerState,

    /// Set by tracking when the initial map has to be (re)built, cleared by the
    /// worker once bootstrap committed.
    bootstrap_requested: AtomicBool,

    /// Request the worker to finish and exit.
    shutdown_requested: AtomicBool,

    performance: Mutex<PerformanceStatistics>,
}

impl SharedState {
    /// Create the shared state of a fresh tracker; bootstrap is requested from the start.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.tracker_state.load()
    }

    pub fn set_tracker_state(&self, state: TrackerState) {
        self.tracker_state.store(state);
    }

    pub fn is_bootstrap_requested(&self) -> bool {
        self.bootstrap_requested.load(Ordering::SeqCst)
    }

    pub fn request_bootstrap(&self) {
        self.bootstrap_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_bootstrap_request(&self) {
        self.bootstrap_requested.store(false, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Flag points as inaccurate.
    pub fn mark_inaccurate(&self, ids: impl IntoIterator<Item = PointId>) {
        self.inaccurate_points.lock().extend(ids);
    }

    pub fn inaccurate_points(&self) -> HashSet<PointId> {
        self.inaccurate_points.lock().clone()
    }

    pub fn has_inaccurate_points(&self) -> bool {
        !self.inaccurate_points.lock().is_empty()
    }

    /// Drop points from the inaccurate set (repaired or deleted).
    pub fn clear_inaccurate(&self, ids: impl IntoIterator<Item = PointId>) {
        let mut inaccurate = self.inaccurate_points.lock();
        for id in ids {
            inaccurate.remove(&id);
        }
    }

    pub fn clear_all_inaccurate(&self) {
        self.inaccurate_points.lock().clear();
    }

    /// Record the time elapsed since `start` for a timer.
    pub fn record_time(&self, timer: Timer, start: Instant) {
        self.performance.lock().record_since(timer, start);
    }

    pub fn performance_report(&self) -> String {
        self.performance.lock().report()
    }

    pub fn performance(&self) -> PerformanceStatistics {
        self.performance.lock().clone()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            map: RwLock::new(MapState::new()),
            inaccurate_points: Mutex::new(HashSet::new()),
            tracker_state: AtomicTrackerState::new(TrackerState::Unknown),
            bootstrap_requested: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            performance: Mutex::new(PerformanceStatistics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_flags() {
        let shared = SharedState::new();
        assert!(shared.is_bootstrap_requested());
        assert!(!shared.is_shutdown_requested());
        assert_eq!(shared.tracker_state(), TrackerState::Unknown);

        shared.clear_bootstrap_request();
        assert!(!shared.is_bootstrap_requested());
    }

    #[test]
    fn test_inaccurate_set() {
        let shared = SharedState::new();
        shared.mark_inaccurate([PointId(1), PointId(2), PointId(1)]);
        assert_eq!(shared.inaccurate_points().len(), 2);
        shared.clear_inaccurate([PointId(1)]);
        assert_eq!(shared.inaccurate_points(), HashSet::from([PointId(2)]));
    }
}
