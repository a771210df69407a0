//! Main-thread tracker: frame-to-frame tracking and pose estimation.
//!
//! Each call to [`Tracker::handle_frame`]:
//! - waits for the worker to finish the previous frame (the only blocking point)
//! - tracks the points of the previous frame into the current frame
//! - determines the camera pose from the tracked localized points
//! - hands the frame over to the worker and returns the pose
//!
//! The map itself is only locked briefly, to read the previous pose and to store
//! the new one.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use super::config::TrackerConfig;
use super::correspondences::TrackingCorrespondences;
use super::pose_correspondences::PoseCorrespondences;
use super::statistics::{DebugData, FrameStatistics, Timer};
use super::TrackerState;
use crate::geometry::SE3;
use crate::map::{CameraPose, FrameIndex, LocalizationPrecision, PoseQuality};
use crate::optimizer::Estimator;
use crate::system::collaborators::Collaborators;
use crate::system::handoff::{FrameHandoff, FrameJob};
use crate::system::shared_state::SharedState;
use crate::vision::{GrayImage, ImagePyramid};

/// Minimal number of 3D-2D correspondences to attempt pose estimation.
pub const MIN_POSE_CORRESPONDENCES: usize = 20;

/// Correspondences needed (with at least medium pose quality) to start tracking.
pub const MIN_TRACKING_CORRESPONDENCES: usize = 40;

/// Localized points below this precision only feed pose estimation when bundle adjusted.
pub const MINIMAL_FRONT_PRECISION: LocalizationPrecision = LocalizationPrecision::Low;

/// Squared tolerance for the unit length of a gravity vector.
const GRAVITY_UNIT_TOLERANCE: f64 = 1e-3;

/// One camera frame with its optional inertial hints.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub image: GrayImage,
    /// Capture time in seconds.
    pub timestamp: f64,
    /// Unit gravity in the camera frame; `None` or zero if unknown.
    pub camera_gravity: Option<Vector3<f64>>,
    /// Camera orientation in an arbitrary world, e.g. from an IMU.
    pub world_r_camera: Option<UnitQuaternion<f64>>,
}

impl FrameInput {
    pub fn new(image: GrayImage, timestamp: f64) -> Self {
        Self {
            image,
            timestamp,
            camera_gravity: None,
            world_r_camera: None,
        }
    }
}

/// Tracking side of the system, running in the caller's thread.
pub struct Tracker {
    config: TrackerConfig,
    collaborators: Arc<Collaborators>,
    shared: Arc<SharedState>,
    handoff: FrameHandoff,
    rng: StdRng,

    next_frame: FrameIndex,
    previous_pyramid: Option<Arc<ImagePyramid>>,
    previous_timestamp: Option<f64>,
    previous_orientation: Option<UnitQuaternion<f64>>,

    /// Points of the previous frame, refreshed by the worker.
    tracking: TrackingCorrespondences,

    /// Frame of the first failed pose estimation while initializing.
    pose_failed_frame: Option<FrameIndex>,
    /// Correspondences used by the pose of the current frame.
    last_pose_correspondences: usize,

    frame_statistics: Vec<FrameStatistics>,
    debug: DebugData,
}

impl Tracker {
    pub fn new(
        config: TrackerConfig,
        collaborators: Arc<Collaborators>,
        shared: Arc<SharedState>,
        handoff: FrameHandoff,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.random_seed);
        Self {
            config,
            collaborators,
            shared,
            handoff,
            rng,
            next_frame: 0,
            previous_pyramid: None,
            previous_timestamp: None,
            previous_orientation: None,
            tracking: TrackingCorrespondences::default(),
            pose_failed_frame: None,
            last_pose_correspondences: 0,
            frame_statistics: Vec::new(),
            debug: DebugData::default(),
        }
    }

    pub fn state(&self) -> TrackerState {
        self.shared.tracker_state()
    }

    pub fn frame_statistics(&self) -> &[FrameStatistics] {
        &self.frame_statistics
    }

    /// Debug snapshot of the last frame (empty unless enabled in the configuration).
    pub fn debug_data(&self) -> DebugData {
        let mut debug = self.debug.clone();
        if self.config.debug_data {
            debug.update_points(&self.shared.map.read());
            debug.inaccurate_ids = self.shared.inaccurate_points();
        }
        debug
    }

    /// Reject frames the tracker cannot process.
    fn validate(&self, input: &FrameInput) -> Result<Option<Vector3<f64>>> {
        let camera = self.collaborators.camera();
        if !camera.is_valid() {
            bail!("invalid camera model");
        }
        if input.image.width != camera.width() || input.image.height != camera.height() {
            bail!(
                "image size {}x{} does not match camera size {}x{}",
                input.image.width,
                input.image.height,
                camera.width(),
                camera.height()
            );
        }
        if !input.timestamp.is_finite() {
            bail!("invalid timestamp {}", input.timestamp);
        }
        if let Some(previous) = self.previous_timestamp {
            if input.timestamp <= previous {
                bail!("timestamp {} is not after previous timestamp {}", input.timestamp, previous);
            }
        }

        match input.camera_gravity {
            None => Ok(None),
            Some(gravity) if gravity == Vector3::zeros() => Ok(None),
            Some(gravity) => {
                if (gravity.norm_squared() - 1.0).abs() > GRAVITY_UNIT_TOLERANCE || !gravity.iter().all(|v| v.is_finite())
                {
                    bail!("gravity must be a unit vector, got {:?}", gravity);
                }
                Ok(Some(gravity))
            }
        }
    }

    /// Process one frame and return its pose, if one could be determined.
    pub fn handle_frame(&mut self, input: FrameInput) -> Result<Option<CameraPose>> {
        let start = Instant::now();
        let camera_gravity = self.validate(&input)?;

        let frame = self.next_frame;
        let pyramid = Arc::new(ImagePyramid::new(
            frame,
            input.timestamp,
            input.image,
            self.config.pyramid_layers,
        ));

        if let Some(result) = self.handoff.wait()? {
            debug_assert_eq!(result.frame_index + 1, frame);
            self.tracking = result.tracking;
        }

        if self.shared.tracker_state() == TrackerState::Unknown {
            self.shared.set_tracker_state(TrackerState::Initializing);
        }
        debug!("[Tracker] frame {}, {}", frame, self.shared.tracker_state());

        if let Some(gravity) = camera_gravity {
            self.shared.map.write().gravities.insert(frame, gravity);
        }
        if self.config.frame_statistics {
            self.frame_statistics.push(FrameStatistics::new(frame));
        }

        let previous_r_current = match (self.previous_orientation, input.world_r_camera) {
            (Some(previous), Some(current)) => Some(previous.inverse() * current),
            _ => None,
        };

        let pose = self.track_and_determine_pose(frame, &pyramid, previous_r_current, camera_gravity);

        if let Some(pose) = &pose {
            let previous_state = self.shared.tracker_state();
            if previous_state == TrackerState::Initializing
                && pose.quality >= PoseQuality::Medium
                && self.last_pose_correspondences >= MIN_TRACKING_CORRESPONDENCES
            {
                self.shared.set_tracker_state(TrackerState::Tracking);
                info!("[Tracker] changed state from {} to {}", previous_state, TrackerState::Tracking);
            }
            self.shared.map.write().poses.set(frame, pose.clone());
        }

        let tracking = std::mem::take(&mut self.tracking);
        if self.config.debug_data {
            self.debug.update_tracks(frame, &tracking);
        } else {
            self.debug.clear();
        }

        self.handoff.submit(FrameJob {
            frame_index: frame,
            pyramid: pyramid.clone(),
            tracking,
        })?;

        self.previous_pyramid = Some(pyramid);
        self.previous_timestamp = Some(input.timestamp);
        self.previous_orientation = input.world_r_camera;
        self.next_frame += 1;

        self.shared.record_time(Timer::HandleFrame, start);
        Ok(pose)
    }

    fn track_and_determine_pose(
        &mut self,
        frame: FrameIndex,
        pyramid: &Arc<ImagePyramid>,
        previous_r_current: Option<UnitQuaternion<f64>>,
        camera_gravity: Option<Vector3<f64>>,
    ) -> Option<CameraPose> {
        self.last_pose_correspondences = 0;

        let Some(previous_pyramid) = self.previous_pyramid.clone() else {
            return None;
        };
        let previous_frame = frame.checked_sub(1)?;
        if self.tracking.previous_frame() != Some(previous_frame) {
            self.tracking.invalidate();
            return None;
        }

        let camera = self.collaborators.camera.clone();

        let world_t_previous = if self.shared.tracker_state() == TrackerState::Tracking {
            let map = self.shared.map.read();
            map.poses
                .get(previous_frame)
                .filter(|pose| pose.map_version == self.tracking.map_version())
                .map(|pose| pose.world_t_camera)
        } else {
            None
        };

        let interval = pyramid.timestamp - previous_pyramid.timestamp;
        let previous_r_current = if (self.config.min_frame_interval..=self.config.max_frame_interval).contains(&interval) {
            previous_r_current
        } else {
            tracing::warn!(
                "[Tracker] frame interval {:.1}ms outside of expected frame interval",
                interval * 1000.0
            );
            None
        };

        let track_start = Instant::now();
        let predicted = world_t_previous.map(|previous| match &previous_r_current {
            Some(rotation) => previous * SE3::new(*rotation, Vector3::zeros()),
            None => previous,
        });
        let predictions = self
            .tracking
            .predictions(camera.as_ref(), predicted.as_ref(), previous_r_current.as_ref());
        let valid = self.tracking.track(
            self.collaborators.flow.as_ref(),
            &previous_pyramid,
            pyramid,
            &predictions,
            self.config.flow_tolerance * self.config.flow_tolerance,
        );
        self.shared.record_time(Timer::TrackImagePoints, track_start);

        debug!(
            "[Tracker] frame-to-frame tracking: {} / {} valid correspondences",
            valid,
            self.tracking.len()
        );

        if let Some(statistics) = self.frame_statistics.last_mut().filter(|s| s.frame_index == frame) {
            statistics.tracking_possible = self.tracking.len();
            statistics.tracking_actual = valid;
            statistics.set_map_version(self.tracking.map_version());
        }

        if self.shared.is_bootstrap_requested() {
            debug!("[Tracker] pose estimation skipped, bootstrap pending");
            return None;
        }

        let gravity = camera_gravity.map(|gravity| self.config.gravity_constraint(gravity));

        let pose_start = Instant::now();
        let mut correspondences = PoseCorrespondences::from_tracking(&self.tracking);
        let determined = if correspondences.len() >= MIN_POSE_CORRESPONDENCES {
            correspondences.determine_pose(
                camera.as_ref(),
                self.collaborators.pose_solver.as_ref(),
                &mut self.rng,
                world_t_previous.as_ref(),
                MIN_POSE_CORRESPONDENCES,
                self.config.max_projection_error,
                Estimator::Huber,
                gravity,
            )
        } else {
            debug!(
                "[Tracker] skipping pose estimation, {} localized correspondences",
                correspondences.len()
            );
            None
        };
        self.shared.record_time(Timer::DeterminePose, pose_start);

        if self.config.debug_data {
            self.debug.pose_precise_ids = correspondences.precise_ids.clone();
            self.debug.pose_imprecise_ids = correspondences.imprecise_ids.clone();
        }

        if let Some(determined) = determined {
            info!(
                "[Tracker] pose for frame {}: {} correspondences, map version {}, error {:.2}px, {:?}",
                frame,
                correspondences.len(),
                correspondences.map_version,
                determined.sqr_error.sqrt(),
                determined.pose.quality
            );

            if let Some(statistics) = self.frame_statistics.last_mut().filter(|s| s.frame_index == frame) {
                statistics.pose_correspondences = correspondences.len();
                statistics.projection_error = Some(determined.sqr_error.sqrt());
                statistics.set_pose(&determined.pose.world_t_camera);
            }

            self.shared.mark_inaccurate(correspondences.outlier_ids.iter().copied());
            self.last_pose_correspondences = correspondences.len();
            self.pose_failed_frame = None;
            return Some(determined.pose);
        }

        if self.shared.tracker_state() == TrackerState::Initializing {
            // without any localized point the worker may just not have delivered them yet
            if correspondences.is_empty() && self.pose_failed_frame.is_none() {
                self.pose_failed_frame = Some(frame);
            } else {
                if !correspondences.is_empty() {
                    tracing::warn!("[Tracker] pose estimation failed while initializing, resetting at frame {}", frame);
                }
                self.shared.request_bootstrap();
                self.pose_failed_frame = None;
            }
        } else {
            debug!("[Tracker] pose estimation failed for frame {}", frame);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{SceneConfig, SyntheticScene};
    use crate::map::PointTrack;
    use crate::system::handoff::{handoff, FrameResult, JobPoll, JobPort};
    use approx::assert_relative_eq;
    use std::collections::HashMap;

    /// A tracker whose worker side is played by the test: every job is answered
    /// with a snapshot of the map as the test left it.
    struct TrackerHarness {
        scene: Arc<SyntheticScene>,
        shared: Arc<SharedState>,
        tracker: Tracker,
        port: JobPort,
    }

    impl TrackerHarness {
        fn new() -> Self {
            let scene = SyntheticScene::new(SceneConfig::default());
            let shared = SharedState::new();
            let (handoff, port) = handoff();
            let tracker = Tracker::new(
                TrackerConfig::default(),
                Arc::new(scene.collaborators()),
                shared.clone(),
                handoff,
            );
            Self {
                scene,
                shared,
                tracker,
                port,
            }
        }

        /// Localize `count` landmarks visible in all frames up to `last_frame`.
        fn localize(&self, count: usize, precision: LocalizationPrecision, last_frame: FrameIndex) {
            let visible: Vec<HashMap<usize, _>> = (0..=last_frame)
                .map(|frame| self.scene.visible(frame).into_iter().collect())
                .collect();
            let mut map = self.shared.map.write();
            let mut added = 0;
            for (index, _) in self.scene.visible(0) {
                if added == count {
                    break;
                }
                let Some(image_points) = visible.iter().map(|v| v.get(&index).copied()).collect::<Option<Vec<_>>>()
                else {
                    continue;
                };
                let Some(track) = PointTrack::from_observations(0, image_points) else {
                    continue;
                };
                let id = map.points.add_track(track);
                map.points
                    .promote(id, self.scene.landmark_position(index), precision, false);
                added += 1;
            }
            assert_eq!(added, count);
        }

        fn step(&mut self, frame: FrameIndex) -> Option<CameraPose> {
            let pose = self.tracker.handle_frame(self.scene.frame_input(frame)).unwrap();
            let JobPoll::Job(job) = self.port.poll() else {
                panic!("frame {} was not handed over", frame);
            };
            let tracking =
                TrackingCorrespondences::from_map(&self.shared.map.read(), job.frame_index, MINIMAL_FRONT_PRECISION);
            assert!(self.port.complete(FrameResult {
                frame_index: job.frame_index,
                tracking,
            }));
            pose
        }
    }

    #[test]
    fn test_first_failure_without_points_is_tolerated_once() {
        let mut harness = TrackerHarness::new();
        assert!(harness.step(0).is_none());
        assert_eq!(harness.tracker.state(), TrackerState::Initializing);

        assert!(harness.step(1).is_none());
        assert!(!harness.shared.is_bootstrap_requested());

        assert!(harness.step(2).is_none());
        assert!(harness.shared.is_bootstrap_requested());
        assert_eq!(harness.tracker.state(), TrackerState::Initializing);
    }

    #[test]
    fn test_tracking_starts_with_enough_correspondences() {
        let mut harness = TrackerHarness::new();
        harness.localize(60, LocalizationPrecision::Medium, 2);

        assert!(harness.step(0).is_none());
        let pose = harness.step(1).unwrap();
        assert_eq!(pose.quality, PoseQuality::Medium);
        assert_eq!(harness.tracker.state(), TrackerState::Tracking);
        assert_relative_eq!(
            pose.world_t_camera.translation,
            harness.scene.pose(1).translation,
            epsilon = 1e-4
        );
        assert!(harness.shared.map.read().poses.has_pose(1));

        // tracking refines from the previous pose
        let pose = harness.step(2).unwrap();
        assert_relative_eq!(
            pose.world_t_camera.translation,
            harness.scene.pose(2).translation,
            epsilon = 1e-4
        );
        assert_eq!(harness.tracker.state(), TrackerState::Tracking);
    }

    #[test]
    fn test_medium_pose_with_few_correspondences_keeps_initializing() {
        let mut harness = TrackerHarness::new();
        // 30 high-precision points: a medium pose, but fewer than 40 correspondences
        harness.localize(30, LocalizationPrecision::High, 1);

        harness.step(0);
        let pose = harness.step(1).unwrap();
        assert_eq!(pose.quality, PoseQuality::Medium);
        assert_eq!(harness.tracker.state(), TrackerState::Initializing);
        assert!(!harness.shared.is_bootstrap_requested());
    }

    #[test]
    fn test_low_quality_pose_keeps_initializing() {
        let mut harness = TrackerHarness::new();
        harness.localize(60, LocalizationPrecision::Low, 1);

        harness.step(0);
        let pose = harness.step(1).unwrap();
        assert_eq!(pose.quality, PoseQuality::Low);
        assert_eq!(harness.tracker.state(), TrackerState::Initializing);
    }

    #[test]
    fn test_too_few_correspondences_request_bootstrap() {
        let mut harness = TrackerHarness::new();
        harness.localize(MIN_POSE_CORRESPONDENCES - 5, LocalizationPrecision::High, 1);

        harness.step(0);
        assert!(harness.step(1).is_none());
        // some points were tracked, so there is no grace frame
        assert!(harness.shared.is_bootstrap_requested());
        assert!(!harness.shared.map.read().poses.has_pose(1));
    }

    #[test]
    fn test_pose_skipped_while_bootstrap_pending() {
        let mut harness = TrackerHarness::new();
        harness.localize(60, LocalizationPrecision::Medium, 1);

        harness.step(0);
        harness.shared.request_bootstrap();
        assert!(harness.step(1).is_none());
        assert_eq!(harness.tracker.state(), TrackerState::Initializing);
        assert!(!harness.shared.map.read().poses.has_pose(1));
    }
}
