//! Relocalization after tracking lost the camera pose.
//!
//! 1. Describe the tracks alive in the latest frame
//! 2. Match them by descriptor against the localized points not seen in that frame
//! 3. Estimate the pose of the latest frame with RANSAC
//! 4. Merge each matched track into its localized point
//! 5. Back-fill the poses of the neighboring frames from the merged observations

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};
use rand::RngCore;
use tracing::{debug, info};

use super::worker::MappingWorker;
use crate::geometry::ransac::{adaptive_iterations, RANSAC_PROBABILITY};
use crate::geometry::{Camera, PoseParams, PoseSolver, SE3};
use crate::map::descriptor::{best_distance, DESCRIPTOR_MATCH_THRESHOLD};
use crate::map::{CameraPose, Descriptor, FrameIndex, MapState, MotionType, PointId, PoseQuality};
use crate::optimizer::Estimator;
use crate::tracking::tracker::MINIMAL_FRONT_PRECISION;
use crate::tracking::{PoseQualityCalculator, TrackerConfig};
use crate::vision::ImagePyramid;

/// Tracks needed alive in the latest frame.
pub const MIN_RELOCALIZATION_TRACKS: usize = 10;

/// Described localized points needed as match candidates.
pub const MIN_RELOCALIZATION_CANDIDATES: usize = 40;

/// Described tracks, matches and pose inliers needed.
pub const MIN_RELOCALIZATION_CORRESPONDENCES: usize = 20;

/// Expected inlier ratio of descriptor matches.
const EXPECTED_INLIER_RATIO: f64 = 0.15;

/// Upper bound of the RANSAC iterations.
pub const RELOCALIZATION_MAX_ITERATIONS: usize = 1000;

/// Correspondences needed to back-fill the pose of a neighboring frame.
pub const MIN_BACKFILL_CORRESPONDENCES: usize = 20;

/// A localized point that may be matched by a track.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub id: PointId,
    pub position: Vector3<f64>,
    pub descriptors: Vec<Descriptor>,
}

/// Best candidate per described track, below the match threshold.
///
/// A candidate matched by several tracks keeps the closest one.
/// Returns `(track index, candidate index)` pairs.
pub fn match_descriptors(track_descriptors: &[Option<Descriptor>], candidates: &[MatchCandidate]) -> Vec<(usize, usize)> {
    let mut best_per_candidate: HashMap<usize, (u32, usize)> = HashMap::new();
    for (track_index, descriptor) in track_descriptors.iter().enumerate() {
        let Some(descriptor) = descriptor else {
            continue;
        };
        let best = candidates
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| best_distance(descriptor, &candidate.descriptors).map(|d| (d, index)))
            .min_by_key(|(distance, _)| *distance);
        let Some((distance, candidate_index)) = best else {
            continue;
        };
        if distance >= DESCRIPTOR_MATCH_THRESHOLD {
            continue;
        }
        let entry = best_per_candidate.entry(candidate_index).or_insert((distance, track_index));
        if distance < entry.0 {
            *entry = (distance, track_index);
        }
    }
    let mut matches: Vec<(usize, usize)> = best_per_candidate
        .into_iter()
        .map(|(candidate_index, (_, track_index))| (track_index, candidate_index))
        .collect();
    matches.sort_unstable();
    matches
}

/// Drop matches whose localized point was observed at or after the start of the track.
///
/// Such a merge would give the point two observations in one frame.
pub fn reject_overlapping(map: &MapState, matches: Vec<(PointId, PointId)>) -> Vec<(PointId, PointId)> {
    matches
        .into_iter()
        .filter(|(track_id, point_id)| {
            let (Some(track), Some(point)) = (map.points.track(*track_id), map.points.localized(*point_id)) else {
                return false;
            };
            point
                .last_observation_frame()
                .map_or(true, |last| last < track.first_frame())
        })
        .collect()
}

/// Pose of `frame` from the localized points observed there.
///
/// With a `prior` (the pose of an adjacent frame) the pose is refined, otherwise
/// estimated from scratch. A gravity recorded for `frame` constrains the pose.
pub fn backfill_pose(
    camera: &dyn Camera,
    solver: &dyn PoseSolver,
    map: &MapState,
    frame: FrameIndex,
    prior: Option<&SE3>,
    rng: &mut dyn RngCore,
    config: &TrackerConfig,
) -> Option<CameraPose> {
    let mut object_points = Vec::new();
    let mut image_points = Vec::new();
    let mut precisions = Vec::new();
    for (_, point) in map.points.localized_points() {
        if point.precision < MINIMAL_FRONT_PRECISION && !point.bundle_adjusted {
            continue;
        }
        if let Some(image_point) = point.observation(frame) {
            object_points.push(point.position);
            image_points.push(image_point);
            precisions.push(point.precision);
        }
    }
    if object_points.len() < MIN_BACKFILL_CORRESPONDENCES {
        return None;
    }

    let mut params = PoseParams {
        minimal_valid: 5,
        max_sqr_error: config.max_sqr_projection_error(),
        iterations: 20,
        estimator: Estimator::Huber,
        gravity: map.gravities.get(&frame).map(|gravity| config.gravity_constraint(*gravity)),
    };
    let estimate = match prior {
        Some(prior) => solver.refine_pose(camera, prior, &object_points, &image_points, &params)?,
        None => {
            params.iterations = 50;
            solver.ransac_pose(camera, &object_points, &image_points, rng, &params)?
        }
    };

    let quality: PoseQualityCalculator = estimate.inliers.iter().map(|&index| precisions[index]).collect();
    let quality = quality.quality();
    if quality == PoseQuality::Invalid {
        return None;
    }
    Some(CameraPose::new(estimate.world_t_camera, quality, MotionType::Unknown, map.version()))
}

/// Back-fill poses from `start` towards `end` (either direction), stopping at
/// the first frame that already has a pose.
///
/// A frame that cannot be posed is skipped; the next one is then estimated
/// without a prior. Returns the number of new poses.
pub fn backfill_range(
    camera: &dyn Camera,
    solver: &dyn PoseSolver,
    map: &mut MapState,
    start: FrameIndex,
    end: FrameIndex,
    rng: &mut dyn RngCore,
    config: &TrackerConfig,
) -> usize {
    let forward = end >= start;
    let mut added = 0;
    let mut frame = start;
    loop {
        if map.poses.has_pose(frame) {
            break;
        }
        let neighbor = if forward { frame.checked_sub(1) } else { frame.checked_add(1) };
        let prior = neighbor.and_then(|n| map.poses.get(n)).map(|pose| pose.world_t_camera);
        match backfill_pose(camera, solver, map, frame, prior.as_ref(), rng, config) {
            Some(pose) => {
                map.poses.set(frame, pose);
                added += 1;
            }
            None => debug!("[Reloc] no back-filled pose for frame {}", frame),
        }

        if frame == end {
            break;
        }
        frame = if forward { frame + 1 } else { frame - 1 };
    }
    added
}

impl MappingWorker {
    /// Try to relocalize the latest frame; true if a pose was found and committed.
    pub(super) fn relocalize(&mut self, latest: FrameIndex, pyramid: &ImagePyramid) -> bool {
        let camera = self.collaborators.camera.clone();
        let shared = self.shared.clone();
        let max_sqr_error = self.config.max_sqr_projection_error();

        let (version, track_ids, track_points, candidates, gravity) = {
            let map = shared.map.read();
            let mut track_ids = Vec::new();
            let mut track_points = Vec::new();
            for (id, track) in map.points.tracks() {
                if let Some(image_point) = track.observation(latest) {
                    track_ids.push(id);
                    track_points.push(image_point);
                }
            }
            if track_ids.len() < MIN_RELOCALIZATION_TRACKS {
                return false;
            }

            let candidates: Vec<MatchCandidate> = map
                .points
                .localized_points()
                .filter(|(_, point)| point.has_descriptors() && !point.is_observed_at(latest))
                .map(|(id, point)| MatchCandidate {
                    id,
                    position: point.position,
                    descriptors: point.descriptors().to_vec(),
                })
                .collect();
            if candidates.len() < MIN_RELOCALIZATION_CANDIDATES {
                return false;
            }

            let gravity = map
                .gravities
                .get(&latest)
                .map(|camera_gravity| self.config.gravity_constraint(*camera_gravity));
            (map.version(), track_ids, track_points, candidates, gravity)
        };

        let descriptors = self.collaborators.descriptors.describe(pyramid, &track_points);
        let described = descriptors.iter().filter(|d| d.is_some()).count();
        if described < MIN_RELOCALIZATION_CORRESPONDENCES {
            return false;
        }

        let matches = match_descriptors(&descriptors, &candidates);
        if matches.len() < MIN_RELOCALIZATION_CORRESPONDENCES {
            debug!("[Reloc] {} descriptor matches at frame {}", matches.len(), latest);
            return false;
        }

        let object_points: Vec<Vector3<f64>> = matches.iter().map(|(_, c)| candidates[*c].position).collect();
        let image_points: Vec<Vector2<f64>> = matches.iter().map(|(t, _)| track_points[*t]).collect();
        let iterations =
            adaptive_iterations(EXPECTED_INLIER_RATIO, RANSAC_PROBABILITY, 3).min(RELOCALIZATION_MAX_ITERATIONS);
        let params = PoseParams {
            minimal_valid: MIN_RELOCALIZATION_CORRESPONDENCES,
            max_sqr_error,
            iterations,
            estimator: Estimator::Huber,
            gravity,
        };
        let Some(estimate) = self.collaborators.pose_solver.ransac_pose(
            camera.as_ref(),
            &object_points,
            &image_points,
            &mut self.rng,
            &params,
        ) else {
            debug!("[Reloc] no pose for frame {}", latest);
            return false;
        };

        let inlier_matches: Vec<(PointId, PointId)> = estimate
            .inliers
            .iter()
            .map(|&index| {
                let (track_index, candidate_index) = matches[index];
                (track_ids[track_index], candidates[candidate_index].id)
            })
            .collect();

        let mut map = shared.map.write();
        if map.version() != version || shared.is_bootstrap_requested() {
            return false;
        }
        let inlier_matches = reject_overlapping(&map, inlier_matches);
        if inlier_matches.len() < MIN_RELOCALIZATION_CORRESPONDENCES {
            debug!("[Reloc] {} non-overlapping matches", inlier_matches.len());
            return false;
        }

        let quality: PoseQualityCalculator = inlier_matches
            .iter()
            .filter_map(|(_, point_id)| map.points.localized(*point_id).map(|point| point.precision))
            .collect();
        let quality = quality.quality();
        if quality == PoseQuality::Invalid {
            return false;
        }

        let mut newest_observation = latest;
        let mut merged = 0;
        for (track_id, point_id) in &inlier_matches {
            let Some(track) = map.points.track(*track_id).cloned() else {
                continue;
            };
            let Some(point) = map.points.localized_mut(*point_id) else {
                continue;
            };
            if point.merge_track(&track) {
                newest_observation = newest_observation.max(track.last_frame());
                map.points.remove(*track_id);
                self.redirects.insert(*track_id, *point_id);
                merged += 1;
            }
        }

        map.poses.set(
            latest,
            CameraPose::new(estimate.world_t_camera, quality, MotionType::Unknown, version),
        );

        let solver = self.collaborators.pose_solver.clone();
        let mut backfilled = 0;
        if let Some(previous) = latest.checked_sub(1) {
            backfilled += backfill_range(
                camera.as_ref(),
                solver.as_ref(),
                &mut map,
                previous,
                0,
                &mut self.rng,
                &self.config,
            );
        }
        if newest_observation > latest {
            backfilled += backfill_range(
                camera.as_ref(),
                solver.as_ref(),
                &mut map,
                latest + 1,
                newest_observation,
                &mut self.rng,
                &self.config,
            );
        }
        if let Some(last_posed) = map.poses.last_frame() {
            if last_posed < newest_observation {
                backfilled += backfill_range(
                    camera.as_ref(),
                    solver.as_ref(),
                    &mut map,
                    last_posed + 1,
                    newest_observation,
                    &mut self.rng,
                    &self.config,
                );
            }
        }

        info!(
            "[Reloc] frame {} relocalized with {} merged points, {:?} pose, {} poses back-filled",
            latest, merged, quality, backfilled
        );
        true
    }
}
