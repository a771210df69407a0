//! Promotion of mature point tracks to localized points.

use nalgebra::{Vector2, Vector3};
use rand::RngCore;
use tracing::debug;

use super::worker::MappingWorker;
use crate::geometry::{Camera, PointRansacParams, PointTriangulator, SE3};
use crate::map::localized_point::determine_uncertainty;
use crate::map::{FrameIndex, LocalizationPrecision, MapState, MotionType, PointId};

/// Observations (up to the current frame) a track needs before promotion.
pub const MIN_PROMOTION_OBSERVATIONS: usize = 10;

/// Most recent observations used for triangulation.
pub const MAX_PROMOTION_OBSERVATIONS: usize = 100;

/// Camera centers spanning less than this are treated as a rotation.
pub const MIN_CENTER_SPREAD: f64 = 0.001;

/// Minimal angle between the first and last viewing ray when the camera only rotated, in degrees.
pub const MIN_ROTATIONAL_ANGLE_DEG: f64 = 1.5;

/// A track ready for triangulation, with its posed observations.
#[derive(Debug, Clone)]
pub struct PromotionCandidate {
    pub id: PointId,
    pub world_t_cameras: Vec<SE3>,
    pub image_points: Vec<Vector2<f64>>,
}

/// Tracks alive at `frame` with enough posed observations.
pub fn promotion_candidates(map: &MapState, frame: FrameIndex) -> Vec<PromotionCandidate> {
    map.points
        .tracks()
        .filter(|(_, track)| track.first_frame() <= frame && track.last_frame() >= frame)
        .filter(|(_, track)| (frame - track.first_frame()) as usize + 1 >= MIN_PROMOTION_OBSERVATIONS)
        .filter_map(|(id, track)| {
            let mut world_t_cameras = Vec::new();
            let mut image_points = Vec::new();
            for (observed_frame, image_point) in track.iter().rev().filter(|(f, _)| *f <= frame) {
                if let Some(pose) = map.poses.get(observed_frame) {
                    world_t_cameras.push(pose.world_t_camera);
                    image_points.push(image_point);
                    if world_t_cameras.len() == MAX_PROMOTION_OBSERVATIONS {
                        break;
                    }
                }
            }
            (world_t_cameras.len() >= MIN_PROMOTION_OBSERVATIONS).then_some(PromotionCandidate {
                id,
                world_t_cameras,
                image_points,
            })
        })
        .collect()
}

/// Whether the camera centers span a bounding box of diagonal at least `min_spread`.
fn centers_spread(world_t_cameras: &[SE3], min_spread: f64) -> bool {
    let mut lower = Vector3::repeat(f64::INFINITY);
    let mut upper = Vector3::repeat(f64::NEG_INFINITY);
    for pose in world_t_cameras {
        lower = lower.inf(&pose.translation);
        upper = upper.sup(&pose.translation);
    }
    world_t_cameras.len() >= 2 && (upper - lower).norm() >= min_spread
}

/// Position and precision of a candidate, if it can be triangulated reliably.
pub fn triangulate_candidate(
    camera: &dyn Camera,
    triangulator: &dyn PointTriangulator,
    candidate: &PromotionCandidate,
    rng: &mut dyn RngCore,
) -> Option<(Vector3<f64>, LocalizationPrecision)> {
    let (first, last) = (candidate.world_t_cameras.first()?, candidate.world_t_cameras.last()?);
    if !centers_spread(&candidate.world_t_cameras, MIN_CENTER_SPREAD) {
        let ray_first = first.rotation * camera.unproject(candidate.image_points.first()?);
        let ray_last = last.rotation * camera.unproject(candidate.image_points.last()?);
        if ray_first.angle(&ray_last) < MIN_ROTATIONAL_ANGLE_DEG.to_radians() {
            return None;
        }
    }

    let estimate = triangulator.ransac_point(
        camera,
        &candidate.world_t_cameras,
        &candidate.image_points,
        rng,
        &PointRansacParams::default(),
    )?;
    if estimate.inliers.len() + 2 < candidate.image_points.len() {
        return None;
    }

    let camera_t_worlds: Vec<SE3> = candidate.world_t_cameras.iter().map(SE3::inverse).collect();
    let precision = determine_uncertainty(camera, &camera_t_worlds, &estimate.position);
    (precision != LocalizationPrecision::Invalid).then_some((estimate.position, precision))
}

impl MappingWorker {
    /// Triangulate mature tracks while the camera translates.
    pub(super) fn promote_tracks(&mut self, frame: FrameIndex) {
        let camera = self.collaborators.camera.clone();
        let shared = self.shared.clone();

        let (version, candidates) = {
            let map = shared.map.read();
            let translating = map
                .poses
                .get(frame)
                .is_some_and(|pose| pose.motion == MotionType::Translational);
            if !translating {
                return;
            }
            (map.version(), promotion_candidates(&map, frame))
        };
        if candidates.is_empty() {
            return;
        }

        let triangulator = self.collaborators.triangulator.clone();
        let promoted: Vec<(PointId, Vector3<f64>, LocalizationPrecision)> = candidates
            .iter()
            .filter_map(|candidate| {
                triangulate_candidate(camera.as_ref(), triangulator.as_ref(), candidate, &mut self.rng)
                    .map(|(position, precision)| (candidate.id, position, precision))
            })
            .collect();
        if promoted.is_empty() {
            return;
        }

        let mut map = shared.map.write();
        if map.version() != version || shared.is_bootstrap_requested() {
            debug!("[Promotion] map changed while triangulating, discarding");
            return;
        }
        let count = promoted
            .into_iter()
            .filter(|(id, position, precision)| map.points.promote(*id, *position, *precision, false))
            .count();
        debug!("[Promotion] {} of {} tracks promoted at frame {}", count, candidates.len(), frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PinholeCamera, RansacPointTriangulator};
    use crate::map::{CameraPose, PointTrack, PoseQuality};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0)
    }

    /// Poses for frames 0..frames along x, and one track of `point` observed in `observed` frames ending at `last`.
    fn scene(frames: FrameIndex, observed: FrameIndex, step: f64, point: Vector3<f64>) -> (MapState, PointId) {
        let camera = camera();
        let mut map = MapState::new();
        let version = map.commit();
        let center = |frame: FrameIndex| Vector3::new(step * frame as f64, 0.0, 0.0);
        for frame in 0..frames {
            map.poses.set(
                frame,
                CameraPose::new(
                    SE3::new(UnitQuaternion::identity(), center(frame)),
                    PoseQuality::High,
                    MotionType::Translational,
                    version,
                ),
            );
        }
        let first = frames - observed;
        let mut track = PointTrack::new(first, camera.project(&(point - center(first))));
        for frame in first + 1..frames {
            track.add_observation(frame, camera.project(&(point - center(frame))));
        }
        let id = map.points.add_track(track);
        (map, id)
    }

    #[test]
    fn test_nine_observations_are_not_enough() {
        let point = Vector3::new(0.2, 0.1, 5.0);
        let (map, _) = scene(20, 9, 0.05, point);
        assert!(promotion_candidates(&map, 19).is_empty());

        let (map, id) = scene(20, 10, 0.05, point);
        let candidates = promotion_candidates(&map, 19);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, id);
        assert_eq!(candidates[0].image_points.len(), 10);
    }

    #[test]
    fn test_triangulated_track_is_promoted() {
        let point = Vector3::new(0.2, 0.1, 5.0);
        let (map, _) = scene(40, 30, 0.05, point);
        let candidates = promotion_candidates(&map, 39);
        let mut rng = StdRng::seed_from_u64(4);

        let (position, precision) =
            triangulate_candidate(&camera(), &RansacPointTriangulator, &candidates[0], &mut rng).unwrap();
        assert_relative_eq!(position, point, epsilon = 1e-4);
        assert!(precision >= LocalizationPrecision::Low);
    }

    #[test]
    fn test_pure_rotation_needs_parallax() {
        let point = Vector3::new(0.2, 0.1, 5.0);
        let (map, _) = scene(20, 15, 0.0, point);
        let candidates = promotion_candidates(&map, 19);
        let mut rng = StdRng::seed_from_u64(4);
        assert!(triangulate_candidate(&camera(), &RansacPointTriangulator, &candidates[0], &mut rng).is_none());
    }
}
