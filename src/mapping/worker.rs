//! Mapping worker - the background thread of the tracker.
//!
//! The worker serves the frame jobs submitted by tracking and, whenever a new
//! frame has been processed, runs one maintenance pass over the map. Pending jobs
//! always take precedence: they are served between two maintenance steps, so the
//! tracking thread waits for at most one step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::bundle_adjustment::BundleState;
use crate::map::{FrameIndex, MapState, PointId};
use crate::system::collaborators::Collaborators;
use crate::system::handoff::{JobPoll, JobPort};
use crate::system::shared_state::SharedState;
use crate::tracking::statistics::Timer;
use crate::tracking::{OccupancyGrid, TrackerConfig, TrackerState};
use crate::vision::ImagePyramid;

/// Timeout for receiving jobs. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Maintenance steps after bootstrap, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Repair,
    Relocalization,
    BundleAdjustment,
    Promotion,
    Descriptors,
}

/// State of the mapping worker thread.
pub struct MappingWorker {
    pub(super) config: TrackerConfig,
    pub(super) collaborators: Arc<Collaborators>,
    pub(super) shared: Arc<SharedState>,
    pub(super) rng: StdRng,

    /// Pyramid of the most recent processed frame.
    pub(super) latest: Option<Arc<ImagePyramid>>,
    /// Frame the last maintenance pass ran for.
    maintained_frame: Option<FrameIndex>,

    pub(super) occupancy: Option<OccupancyGrid>,
    pub(super) detection_threshold: u32,

    /// Tracks merged into localized points by relocalization, until tracking
    /// has caught up with the new identifiers.
    pub(super) redirects: HashMap<PointId, PointId>,

    pub(super) bundle: BundleState,
}

impl MappingWorker {
    pub fn new(config: TrackerConfig, collaborators: Arc<Collaborators>, shared: Arc<SharedState>) -> Self {
        // the worker's stream must differ from the tracker's
        let rng = StdRng::seed_from_u64(config.random_seed.wrapping_add(1));
        let detection_threshold = config.detection_threshold_initial;
        Self {
            config,
            collaborators,
            shared,
            rng,
            latest: None,
            maintained_frame: None,
            occupancy: None,
            detection_threshold,
            redirects: HashMap::new(),
            bundle: BundleState::default(),
        }
    }

    /// Main thread loop: serve frame jobs and maintain the map.
    ///
    /// This runs until shutdown is requested or tracking is gone.
    pub fn run(&mut self, port: JobPort) {
        debug!("[Mapping] worker started");
        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match port.poll() {
                JobPoll::Job(job) => {
                    if !self.post_frame(job, &port) {
                        break;
                    }
                    continue;
                }
                JobPoll::Disconnected => break,
                JobPoll::Empty => {}
            }

            let latest_frame = self.latest.as_ref().map(|pyramid| pyramid.frame_index);
            if latest_frame.is_some() && latest_frame != self.maintained_frame {
                self.maintained_frame = latest_frame;
                if !self.maintain(&port) {
                    break;
                }
                continue;
            }

            match port.wait(RECV_TIMEOUT) {
                JobPoll::Job(job) => {
                    if !self.post_frame(job, &port) {
                        break;
                    }
                }
                JobPoll::Empty => continue,
                JobPoll::Disconnected => break,
            }
        }
        debug!("[Mapping] worker stopped");
    }

    /// One maintenance pass for the latest frame.
    ///
    /// Returns false when the worker has to stop.
    fn maintain(&mut self, port: &JobPort) -> bool {
        let Some(pyramid) = self.latest.clone() else {
            return true;
        };
        let frame = pyramid.frame_index;

        if self.shared.is_bootstrap_requested() {
            let start = Instant::now();
            self.bootstrap(frame);
            self.shared.record_time(Timer::Bootstrap, start);
            return true;
        }

        let has_pose = self.shared.map.read().poses.has_pose(frame);

        let mut steps = Vec::with_capacity(5);
        if has_pose {
            if self.shared.has_inaccurate_points() {
                steps.push(Step::Repair);
            }
        } else if self.shared.tracker_state() == TrackerState::Tracking {
            steps.push(Step::Relocalization);
        }
        steps.extend([Step::BundleAdjustment, Step::Promotion, Step::Descriptors]);

        for step in steps {
            if !self.serve_pending(port) {
                return false;
            }
            if self.shared.is_shutdown_requested() {
                return false;
            }

            let start = Instant::now();
            match step {
                Step::Repair => {
                    self.repair(frame);
                    self.shared.record_time(Timer::Repair, start);
                }
                Step::Relocalization => {
                    let relocalized = self.relocalize(frame, &pyramid);
                    self.shared.record_time(Timer::Relocalization, start);
                    if relocalized {
                        // the map changed under the remaining steps, start over with the next frame
                        return true;
                    }
                }
                Step::BundleAdjustment => {
                    self.bundle_adjustment(frame);
                    self.shared.record_time(Timer::BundleAdjustment, start);
                }
                Step::Promotion => {
                    self.promote_tracks(frame);
                    self.shared.record_time(Timer::Promotion, start);
                }
                Step::Descriptors => {
                    self.describe_points(frame, &pyramid);
                    self.shared.record_time(Timer::Describe, start);
                }
            }
        }
        true
    }

    /// Serve a job submitted while maintaining; false if tracking is gone.
    fn serve_pending(&mut self, port: &JobPort) -> bool {
        match port.poll() {
            JobPoll::Job(job) => self.post_frame(job, port),
            JobPoll::Empty => true,
            JobPoll::Disconnected => false,
        }
    }

    /// Drop all 3D information, keeping the tracks alive at `latest_frame`.
    ///
    /// Must be called with the map write lock held (`map` is the locked map).
    pub(super) fn reset_map(&mut self, map: &mut MapState, latest_frame: FrameIndex) {
        map.reset(latest_frame);
        self.bundle.clear();
        self.redirects.clear();
        self.shared.clear_all_inaccurate();
        info!("[Mapping] map reset at frame {}", latest_frame);
    }
}
