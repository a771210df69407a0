//! Bundle Adjustment of key frames, run by the mapping worker.
//!
//! 1. Decide whether an adjustment is needed (projection error, ratio of adjusted
//!    points, baseline growth)
//! 2. Select the key frames ([`Topology`])
//! 3. Optimize key-frame poses and the points consistent with them
//! 4. Re-optimize the points left out on the adjusted poses, invalidate the ones
//!    that still do not fit
//! 5. Commit as a new map version

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use tracing::{debug, info};

use super::topology::Topology;
use super::worker::MappingWorker;
use crate::geometry::camera::{is_in_front, sqr_projection_error};
use crate::geometry::{Camera, PointTriangulator, SE3};
use crate::map::{FrameIndex, LocalizationPrecision, MapState, MotionType, PointId, PoseQuality};
use crate::optimizer::{
    BundleAdjuster, BundleGravity, BundleObservation, BundleParams, BundleProblem, BundleReport, Estimator,
};

/// Growth of the smallest baseline to the key frames that triggers an adjustment.
pub const BASELINE_FACTOR: f64 = 1.225;

/// Below this ratio of adjusted points in the current frame an adjustment is needed.
pub const MIN_BUNDLE_ADJUSTED_RATIO: f64 = 0.5;

/// Points needed for an adjustment.
pub const MIN_BA_POINTS: usize = 10;

/// Points are kept within this distance of the key frames.
pub const MAX_POINT_DISTANCE: f64 = 10_000.0;

pub const BA_ITERATIONS: usize = 20;

/// Bundle Adjustment bookkeeping kept by the worker between runs.
#[derive(Debug, Clone, Default)]
pub struct BundleState {
    pub key_frames: Vec<FrameIndex>,
    /// Points consistent with the key frames after the last adjustment.
    pub points: HashSet<PointId>,
    /// Largest squared distance between two key frames after the last adjustment.
    pub sqr_baseline: f64,
}

impl BundleState {
    pub fn clear(&mut self) {
        self.key_frames.clear();
        self.points.clear();
        self.sqr_baseline = 0.0;
    }
}

/// Whether the map around `frame` needs an adjustment.
pub fn is_needed(
    camera: &dyn Camera,
    map: &MapState,
    state: &BundleState,
    frame: FrameIndex,
    max_projection_error: f64,
) -> bool {
    let Some(pose) = map.poses.get(frame) else {
        return false;
    };
    let camera_t_world = pose.camera_t_world();

    let mut error_sum = 0.0;
    let mut observed = 0usize;
    let mut adjusted = 0usize;
    for (_, point) in map.points.localized_points() {
        if let Some(image_point) = point.observation(frame) {
            error_sum += sqr_projection_error(camera, &camera_t_world, &point.position, &image_point).sqrt();
            observed += 1;
            if point.bundle_adjusted {
                adjusted += 1;
            }
        }
    }

    let average_error = if observed == 0 {
        f64::INFINITY
    } else {
        error_sum / observed as f64
    };
    if average_error >= max_projection_error {
        debug!("[BA] needed for frame {}: projection error {:.2}px", frame, average_error);
        return true;
    }

    let ratio = if observed == 0 {
        0.0
    } else {
        adjusted as f64 / observed as f64
    };
    if ratio < MIN_BUNDLE_ADJUSTED_RATIO {
        debug!("[BA] needed for frame {}: adjusted ratio {:.2}", frame, ratio);
        return true;
    }

    let center = pose.center();
    let sqr_baseline = state
        .key_frames
        .iter()
        .filter_map(|key_frame| map.poses.get(*key_frame))
        .map(|key_pose| (key_pose.center() - center).norm_squared())
        .fold(f64::INFINITY, f64::min);
    if sqr_baseline >= state.sqr_baseline * BASELINE_FACTOR * BASELINE_FACTOR {
        debug!("[BA] needed for frame {}: baseline {:.3}", frame, sqr_baseline.sqrt());
        return true;
    }
    false
}

/// A point left out of the adjustment, re-optimized on the adjusted poses afterwards.
#[derive(Debug, Clone)]
pub struct ExcludedPoint {
    pub id: PointId,
    pub position: Vector3<f64>,
    /// (key-frame index, image point)
    pub observations: Vec<(usize, Vector2<f64>)>,
}

/// Everything an adjustment needs, gathered under the read lock.
#[derive(Debug, Clone)]
pub struct BundleInput {
    pub key_frames: Vec<FrameIndex>,
    pub problem: BundleProblem,
    /// Identifiers of `problem.points`.
    pub point_ids: Vec<PointId>,
    pub point_observations: Vec<Vec<(usize, Vector2<f64>)>>,
    pub excluded: Vec<ExcludedPoint>,
}

/// Whether `position` is in front of and projects close to all its observations.
fn is_consistent(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    position: &Vector3<f64>,
    observations: &[(usize, Vector2<f64>)],
    max_sqr_error: f64,
) -> bool {
    observations.iter().all(|(pose_index, image_point)| {
        let camera_t_world = &camera_t_worlds[*pose_index];
        is_in_front(camera_t_world, position)
            && sqr_projection_error(camera, camera_t_world, position, image_point) <= max_sqr_error
    })
}

impl BundleInput {
    /// Build the problem: points adjusted before always take part, other points
    /// only when they are consistent with all key frames.
    pub fn gather(
        camera: &dyn Camera,
        map: &MapState,
        topology: Topology,
        adjusted: &HashSet<PointId>,
        max_sqr_error: f64,
        gravity: Option<BundleGravity>,
    ) -> Self {
        let camera_t_worlds: Vec<SE3> = topology.world_t_cameras.iter().map(SE3::inverse).collect();
        let mut input = Self {
            key_frames: topology.key_frames,
            problem: BundleProblem {
                world_t_cameras: topology.world_t_cameras,
                gravity,
                ..Default::default()
            },
            point_ids: Vec::new(),
            point_observations: Vec::new(),
            excluded: Vec::new(),
        };

        for (id, observations) in topology.point_ids.into_iter().zip(topology.observations) {
            let Some(point) = map.points.localized(id) else {
                continue;
            };
            let position = point.position;
            if adjusted.contains(&id) || is_consistent(camera, &camera_t_worlds, &position, &observations, max_sqr_error) {
                let point_index = input.problem.points.len();
                input.problem.points.push(position);
                input
                    .problem
                    .observations
                    .extend(observations.iter().map(|(pose_index, image_point)| BundleObservation {
                        pose_index: *pose_index,
                        point_index,
                        image_point: *image_point,
                    }));
                input.point_ids.push(id);
                input.point_observations.push(observations);
            } else {
                input.excluded.push(ExcludedPoint {
                    id,
                    position,
                    observations,
                });
            }
        }
        input
    }
}

/// Result of an adjustment, ready to be committed.
#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub key_frames: Vec<FrameIndex>,
    pub world_t_cameras: Vec<SE3>,
    /// Optimized points and whether they are consistent with the key frames.
    pub points: Vec<(PointId, Vector3<f64>, bool)>,
    /// Left-out points that fit the adjusted poses after re-optimization.
    pub rescued: Vec<(PointId, Vector3<f64>)>,
    /// Left-out points that still do not fit.
    pub failed: Vec<PointId>,
    pub sqr_baseline: f64,
    pub report: BundleReport,
}

/// Pull `position` back to within [`MAX_POINT_DISTANCE`] of `center`.
fn clamp_distance(position: Vector3<f64>, center: &Vector3<f64>) -> Vector3<f64> {
    let offset = position - center;
    let distance = offset.norm();
    if distance > MAX_POINT_DISTANCE {
        center + offset * (MAX_POINT_DISTANCE / distance)
    } else {
        position
    }
}

/// Optimize the gathered problem and sort the points by how well they fit.
pub fn run_adjustment(
    camera: &dyn Camera,
    adjuster: &dyn BundleAdjuster,
    triangulator: &dyn PointTriangulator,
    mut input: BundleInput,
    max_sqr_error: f64,
) -> Option<BundleOutcome> {
    if input.problem.points.len() < MIN_BA_POINTS {
        debug!("[BA] only {} points, skipping", input.problem.points.len());
        return None;
    }

    let params = BundleParams {
        iterations: BA_ITERATIONS,
        estimator: Estimator::Square,
        fixed_poses: 1,
    };
    let report = adjuster.optimize(camera, &mut input.problem, &params)?;

    let world_t_cameras = input.problem.world_t_cameras;
    let camera_t_worlds: Vec<SE3> = world_t_cameras.iter().map(SE3::inverse).collect();
    let mean_center =
        world_t_cameras.iter().map(|pose| pose.translation).sum::<Vector3<f64>>() / world_t_cameras.len() as f64;

    let points = input
        .point_ids
        .iter()
        .zip(&input.problem.points)
        .zip(&input.point_observations)
        .map(|((id, position), observations)| {
            let position = clamp_distance(*position, &mean_center);
            let consistent = is_consistent(camera, &camera_t_worlds, &position, observations, max_sqr_error);
            (*id, position, consistent)
        })
        .collect();

    let mut rescued = Vec::new();
    let mut failed = Vec::new();
    for excluded in input.excluded {
        let poses: Vec<SE3> = excluded
            .observations
            .iter()
            .map(|(pose_index, _)| world_t_cameras[*pose_index])
            .collect();
        let image_points: Vec<Vector2<f64>> = excluded.observations.iter().map(|(_, p)| *p).collect();
        let refined = triangulator.optimize_point(
            camera,
            &poses,
            &image_points,
            &excluded.position,
            BA_ITERATIONS,
            Estimator::Huber,
        );
        match refined {
            Some(refinement) if refinement.final_sqr_error < max_sqr_error => {
                rescued.push((excluded.id, clamp_distance(refinement.position, &mean_center)));
            }
            _ => failed.push(excluded.id),
        }
    }

    let mut sqr_baseline: f64 = 0.0;
    for (i, a) in world_t_cameras.iter().enumerate() {
        for b in &world_t_cameras[i + 1..] {
            sqr_baseline = sqr_baseline.max((a.translation - b.translation).norm_squared());
        }
    }

    Some(BundleOutcome {
        key_frames: input.key_frames,
        world_t_cameras,
        points,
        rescued,
        failed,
        sqr_baseline,
        report,
    })
}

impl MappingWorker {
    /// Adjust the key frames if the map around `frame` needs it.
    pub(super) fn bundle_adjustment(&mut self, frame: FrameIndex) {
        let camera = self.collaborators.camera.clone();
        let shared = self.shared.clone();
        let max_sqr_error = self.config.max_sqr_projection_error();

        let (version, input) = {
            let map = shared.map.read();
            if map.points.num_localized() == 0 {
                return;
            }
            let version = map.version();
            let Some(pose) = map.poses.current(frame, version) else {
                return;
            };
            if pose.motion != MotionType::Translational {
                return;
            }
            if !is_needed(camera.as_ref(), &map, &self.bundle, frame, self.config.max_projection_error) {
                return;
            }

            let mut key_frames = self.bundle.key_frames.clone();
            let Some(topology) = Topology::determine(&map, &mut key_frames) else {
                self.bundle.key_frames.clear();
                return;
            };

            let camera_gravities: Vec<Vector3<f64>> = topology
                .key_frames
                .iter()
                .filter_map(|key_frame| map.gravities.get(key_frame).copied())
                .collect();
            let gravity = (camera_gravities.len() == topology.key_frames.len()).then(|| BundleGravity {
                camera_gravities,
                world_gravity: self.config.world_gravity(),
                weight: self.config.gravity_weight,
            });

            let input = BundleInput::gather(camera.as_ref(), &map, topology, &self.bundle.points, max_sqr_error, gravity);
            (version, input)
        };

        let Some(outcome) = run_adjustment(
            camera.as_ref(),
            self.collaborators.bundle_adjuster.as_ref(),
            self.collaborators.triangulator.as_ref(),
            input,
            max_sqr_error,
        ) else {
            return;
        };

        let mut map = shared.map.write();
        if map.version() != version {
            debug!("[BA] map changed during the adjustment, discarding");
            return;
        }
        if shared.is_bootstrap_requested() {
            debug!("[BA] bootstrap pending, discarding");
            return;
        }

        let new_version = map.commit();
        let map = &mut *map;
        for (key_frame, world_t_camera) in outcome.key_frames.iter().zip(&outcome.world_t_cameras) {
            if let Some(mut pose) = map.poses.get(*key_frame).copied() {
                pose.world_t_camera = *world_t_camera;
                pose.quality = PoseQuality::High;
                pose.map_version = new_version;
                map.poses.set(*key_frame, pose);
            }
        }

        let mut adjusted = HashSet::new();
        for (id, position, consistent) in &outcome.points {
            if let Some(point) = map.points.localized_mut(*id) {
                point.position = *position;
                point.bundle_adjusted = *consistent;
                point.update_uncertainty(camera.as_ref(), &map.poses);
                if *consistent {
                    adjusted.insert(*id);
                }
            }
        }
        for (id, position) in &outcome.rescued {
            if let Some(point) = map.points.localized_mut(*id) {
                point.position = *position;
                point.bundle_adjusted = true;
                point.update_uncertainty(camera.as_ref(), &map.poses);
                adjusted.insert(*id);
            }
        }

        let mut removed = Vec::new();
        for id in &outcome.failed {
            let observed_now = match map.points.localized_mut(*id) {
                Some(point) => {
                    point.precision = LocalizationPrecision::Invalid;
                    point.bundle_adjusted = false;
                    point.is_observed_at(frame)
                }
                None => continue,
            };
            if !observed_now {
                map.points.remove(*id);
                removed.push(*id);
            }
        }
        shared.clear_inaccurate(removed.iter().copied());

        info!(
            "[BA] {} key frames, {} points ({} rescued, {} invalid), error {:.2}px -> {:.2}px, map version {}",
            outcome.key_frames.len(),
            adjusted.len(),
            outcome.rescued.len(),
            outcome.failed.len(),
            outcome.report.initial_sqr_error.sqrt(),
            outcome.report.final_sqr_error.sqrt(),
            new_version.0
        );

        self.bundle.points = adjusted;
        self.bundle.key_frames = outcome.key_frames;
        self.bundle.sqr_baseline = outcome.sqr_baseline;
    }
}
