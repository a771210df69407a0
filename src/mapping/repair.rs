//! Precision repair of localized points rejected by pose estimation.
//!
//! Tracking marks the localized points it found to be outliers as inaccurate.
//! The worker re-optimizes each of them from all of its observations with a
//! current pose, and only accepts the new position when every observation then
//! agrees with it.

use std::collections::HashSet;

use nalgebra::{Vector2, Vector3};
use tracing::debug;

use super::worker::MappingWorker;
use crate::geometry::camera::{is_in_front, sqr_projection_error};
use crate::geometry::{Camera, PointTriangulator, SE3};
use crate::map::{FrameIndex, MapState, PointId};
use crate::optimizer::Estimator;

/// Observations with a current pose needed to repair a point.
pub const MIN_REPAIR_OBSERVATIONS: usize = 10;

/// Optimization iterations of a repair.
pub const REPAIR_ITERATIONS: usize = 10;

/// An inaccurate point with the observations used for its repair.
#[derive(Debug, Clone)]
pub struct RepairCandidate {
    pub id: PointId,
    pub position: Vector3<f64>,
    pub world_t_cameras: Vec<SE3>,
    pub image_points: Vec<Vector2<f64>>,
}

/// Inaccurate points observed at `frame`, with their observations posed at the current map version.
pub fn repair_candidates(map: &MapState, frame: FrameIndex, inaccurate: &HashSet<PointId>) -> Vec<RepairCandidate> {
    let version = map.version();
    inaccurate
        .iter()
        .filter_map(|&id| {
            let point = map.points.localized(id)?;
            if !point.is_observed_at(frame) {
                return None;
            }
            let mut world_t_cameras = Vec::new();
            let mut image_points = Vec::new();
            for (observed_frame, image_point) in point.observations() {
                if let Some(pose) = map.poses.current(observed_frame, version) {
                    world_t_cameras.push(pose.world_t_camera);
                    image_points.push(image_point);
                }
            }
            (world_t_cameras.len() >= MIN_REPAIR_OBSERVATIONS).then_some(RepairCandidate {
                id,
                position: point.position,
                world_t_cameras,
                image_points,
            })
        })
        .collect()
}

/// New position of a candidate, if all its observations agree with it afterwards.
pub fn repair_point(
    camera: &dyn Camera,
    triangulator: &dyn PointTriangulator,
    candidate: &RepairCandidate,
    max_sqr_projection_error: f64,
) -> Option<Vector3<f64>> {
    let refinement = triangulator.optimize_point(
        camera,
        &candidate.world_t_cameras,
        &candidate.image_points,
        &candidate.position,
        REPAIR_ITERATIONS,
        Estimator::Huber,
    )?;

    let position = refinement.position;
    let consistent = candidate
        .world_t_cameras
        .iter()
        .zip(&candidate.image_points)
        .all(|(world_t_camera, image_point)| {
            let camera_t_world = world_t_camera.inverse();
            is_in_front(&camera_t_world, &position)
                && sqr_projection_error(camera, &camera_t_world, &position, image_point) <= max_sqr_projection_error
        });
    consistent.then_some(position)
}

impl MappingWorker {
    /// Repair the inaccurate points observed in the latest frame.
    pub(super) fn repair(&mut self, frame: FrameIndex) {
        let camera = self.collaborators.camera.clone();
        let inaccurate = self.shared.inaccurate_points();
        if inaccurate.is_empty() {
            return;
        }

        let (version, candidates, vanished) = {
            let map = self.shared.map.read();
            let vanished: Vec<PointId> = inaccurate
                .iter()
                .copied()
                .filter(|id| !map.points.is_localized(*id))
                .collect();
            (map.version(), repair_candidates(&map, frame, &inaccurate), vanished)
        };
        self.shared.clear_inaccurate(vanished);

        let max_sqr_error = self.config.max_sqr_projection_error();
        let repaired: Vec<(PointId, Vector3<f64>)> = candidates
            .iter()
            .filter_map(|candidate| {
                repair_point(camera.as_ref(), self.collaborators.triangulator.as_ref(), candidate, max_sqr_error)
                    .map(|position| (candidate.id, position))
            })
            .collect();
        if repaired.is_empty() {
            return;
        }

        let mut map = self.shared.map.write();
        if map.version() != version {
            debug!("[Repair] map changed while repairing, discarding");
            return;
        }
        let map = &mut *map;
        let mut ids = Vec::with_capacity(repaired.len());
        for (id, position) in repaired {
            if let Some(point) = map.points.localized_mut(id) {
                point.position = position;
                point.bundle_adjusted = false;
                point.update_uncertainty(camera.as_ref(), &map.poses);
                ids.push(id);
            }
        }
        debug!("[Repair] repaired {} of {} inaccurate points", ids.len(), candidates.len());
        self.shared.clear_inaccurate(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PinholeCamera, RansacPointTriangulator};
    use crate::map::{CameraPose, LocalizationPrecision, MotionType, PointTrack, PoseQuality};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0)
    }

    /// A point at `truth` observed in frames 0..frames, stored at `stored`.
    fn scene(truth: Vector3<f64>, stored: Vector3<f64>, frames: FrameIndex) -> (MapState, PointId) {
        let camera = camera();
        let mut map = MapState::new();
        let version = map.commit();
        let project = |frame: FrameIndex| {
            let center = Vector3::new(0.05 * frame as f64, 0.0, 0.0);
            camera.project(&(truth - center))
        };
        let mut track = PointTrack::new(0, project(0));
        for frame in 0..frames {
            if frame > 0 {
                track.add_observation(frame, project(frame));
            }
            let world_t_camera = SE3::new(UnitQuaternion::identity(), Vector3::new(0.05 * frame as f64, 0.0, 0.0));
            map.poses.set(
                frame,
                CameraPose::new(world_t_camera, PoseQuality::High, MotionType::Translational, version),
            );
        }
        let id = map.points.add_track(track);
        map.points.promote(id, stored, LocalizationPrecision::Low, true);
        (map, id)
    }

    #[test]
    fn test_candidates_need_current_poses() {
        let truth = Vector3::new(0.3, -0.2, 5.0);
        let (mut map, id) = scene(truth, truth, 12);
        let inaccurate = HashSet::from([id]);

        assert_eq!(repair_candidates(&map, 11, &inaccurate).len(), 1);
        assert!(repair_candidates(&map, 12, &inaccurate).is_empty());

        // after a new map version the old poses no longer count
        map.commit();
        assert!(repair_candidates(&map, 11, &inaccurate).is_empty());
    }

    #[test]
    fn test_repair_moves_point_back() {
        let truth = Vector3::new(0.3, -0.2, 5.0);
        let (map, id) = scene(truth, truth + Vector3::new(0.05, 0.05, 0.3), 12);
        let candidates = repair_candidates(&map, 11, &HashSet::from([id]));
        assert_eq!(candidates[0].world_t_cameras.len(), 12);

        let position = repair_point(&camera(), &RansacPointTriangulator, &candidates[0], 3.5 * 3.5).unwrap();
        assert_relative_eq!(position, truth, epsilon = 1e-3);
    }
}
