//! 3D-2D correspondences of the current frame and the pose determined from them.

use nalgebra::{Vector2, Vector3};
use rand::RngCore;

use super::correspondences::TrackingCorrespondences;
use super::pose_quality::PoseQualityCalculator;
use crate::geometry::ransac::median;
use crate::geometry::{Camera, GravityConstraint, PoseEstimate, PoseParams, PoseSolver, SE3};
use crate::map::{CameraPose, LocalizationPrecision, MapVersion, MotionType, PointId};
use crate::optimizer::Estimator;

/// Median rotation-compensated parallax (pixels) at which motion counts as translational.
pub const TRANSLATIONAL_PARALLAX_PX: f64 = 0.3;

/// RANSAC iterations when no prior pose is available.
pub const POSE_RANSAC_ITERATIONS: usize = 50;

/// Iterations when refining from the previous pose.
pub const POSE_REFINE_ITERATIONS: usize = 20;

/// Pose estimation result with the error it was determined with.
#[derive(Debug, Clone)]
pub struct DeterminedPose {
    pub pose: CameraPose,
    /// Average squared projection error over the used correspondences.
    pub sqr_error: f64,
}

/// Correspondences between localized points and their tracked image points.
#[derive(Debug, Clone, Default)]
pub struct PoseCorrespondences {
    pub map_version: MapVersion,
    point_ids: Vec<PointId>,
    object_points: Vec<Vector3<f64>>,
    image_points: Vec<Vector2<f64>>,
    previous_image_points: Vec<Vector2<f64>>,
    precisions: Vec<LocalizationPrecision>,
    /// Points rejected by the last pose estimation.
    pub outlier_ids: Vec<PointId>,
    /// Used points with at least `Low` precision.
    pub precise_ids: Vec<PointId>,
    /// Used points below `Low` precision (bundle adjusted but not yet classified).
    pub imprecise_ids: Vec<PointId>,
}

impl PoseCorrespondences {
    /// Collect all valid tracking correspondences that carry a 3D position.
    pub fn from_tracking(tracking: &TrackingCorrespondences) -> Self {
        let mut correspondences = Self {
            map_version: tracking.map_version(),
            ..Default::default()
        };
        for index in tracking.valid_indices() {
            if let Some(object_point) = tracking.object_point(index) {
                correspondences.point_ids.push(tracking.point_ids()[index]);
                correspondences.object_points.push(object_point);
                correspondences.image_points.push(tracking.current_points()[index]);
                correspondences.previous_image_points.push(tracking.previous_points()[index]);
                correspondences.precisions.push(tracking.precision(index));
            }
        }
        correspondences
    }

    pub fn len(&self) -> usize {
        self.point_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty()
    }

    pub fn point_ids(&self) -> &[PointId] {
        &self.point_ids
    }

    /// Determine the camera pose of the current frame.
    ///
    /// With a previous pose the pose is refined from it, otherwise it is determined
    /// with RANSAC. On success the correspondences are reduced to the inliers and
    /// the removed identifiers are stored in `outlier_ids`.
    ///
    /// # Arguments
    /// * `world_t_previous` - Pose of the previous frame, if usable as prior
    /// * `minimal_correspondences` - Minimal number of inliers
    /// * `max_projection_error` - Maximal projection error of an inlier, in pixels
    #[allow(clippy::too_many_arguments)]
    pub fn determine_pose(
        &mut self,
        camera: &dyn Camera,
        solver: &dyn PoseSolver,
        rng: &mut dyn RngCore,
        world_t_previous: Option<&SE3>,
        minimal_correspondences: usize,
        max_projection_error: f64,
        estimator: Estimator,
        gravity: Option<GravityConstraint>,
    ) -> Option<DeterminedPose> {
        self.outlier_ids.clear();
        self.precise_ids.clear();
        self.imprecise_ids.clear();

        if self.len() < minimal_correspondences {
            return None;
        }

        let mut params = PoseParams {
            minimal_valid: minimal_correspondences,
            max_sqr_error: max_projection_error * max_projection_error,
            iterations: POSE_RANSAC_ITERATIONS,
            estimator,
            gravity,
        };

        let estimate = match world_t_previous {
            Some(prior) => {
                params.iterations = POSE_REFINE_ITERATIONS;
                solver.refine_pose(camera, prior, &self.object_points, &self.image_points, &params)
            }
            None => solver.ransac_pose(camera, &self.object_points, &self.image_points, rng, &params),
        }?;

        if estimate.inliers.len() < minimal_correspondences {
            return None;
        }

        self.keep_inliers(&estimate);

        let quality: PoseQualityCalculator = self.precisions.iter().copied().collect();
        let motion = match world_t_previous {
            Some(previous) => self.motion_type(camera, previous, &estimate.world_t_camera),
            None => MotionType::Unknown,
        };

        Some(DeterminedPose {
            pose: CameraPose::new(estimate.world_t_camera, quality.quality(), motion, self.map_version),
            sqr_error: estimate.sqr_error,
        })
    }

    fn keep_inliers(&mut self, estimate: &PoseEstimate) {
        let mut kept = vec![false; self.len()];
        for &index in &estimate.inliers {
            if let Some(flag) = kept.get_mut(index) {
                *flag = true;
            }
        }

        self.outlier_ids = self
            .point_ids
            .iter()
            .zip(&kept)
            .filter_map(|(id, k)| (!k).then_some(*id))
            .collect();

        retain_by(&mut self.point_ids, &kept);
        retain_by(&mut self.object_points, &kept);
        retain_by(&mut self.image_points, &kept);
        retain_by(&mut self.previous_image_points, &kept);
        retain_by(&mut self.precisions, &kept);

        for (id, precision) in self.point_ids.iter().zip(&self.precisions) {
            if *precision >= LocalizationPrecision::Low {
                self.precise_ids.push(*id);
            } else {
                self.imprecise_ids.push(*id);
            }
        }
    }

    /// Translational when the median parallax left after compensating the rotation
    /// between both frames reaches [`TRANSLATIONAL_PARALLAX_PX`].
    fn motion_type(&self, camera: &dyn Camera, world_t_previous: &SE3, world_t_current: &SE3) -> MotionType {
        let current_r_previous = world_t_current.rotation.inverse() * world_t_previous.rotation;

        let parallaxes: Vec<f64> = self
            .previous_image_points
            .iter()
            .zip(&self.image_points)
            .filter_map(|(previous, current)| {
                let ray = current_r_previous * camera.unproject(previous);
                (ray.z > f64::EPSILON).then(|| (camera.project(&ray) - current).norm())
            })
            .collect();

        match median(&parallaxes) {
            Some(parallax) if parallax >= TRANSLATIONAL_PARALLAX_PX => MotionType::Translational,
            Some(_) => MotionType::Rotational,
            None => MotionType::Unknown,
        }
    }
}

fn retain_by<T>(values: &mut Vec<T>, keep: &[bool]) {
    let mut flags = keep.iter();
    values.retain(|_| flags.next().copied().unwrap_or(false));
}
