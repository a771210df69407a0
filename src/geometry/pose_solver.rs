//! Camera pose from 3D-2D correspondences.
//!
//! The reference [`DltPoseSolver`] draws minimal samples of six correspondences,
//! solves the linear projection matrix on normalized rays and orthonormalizes its
//! rotation, then refines the best hypothesis with [`refine_pose`] on its inliers.
//! Six points must not be coplanar; planar scenes should use a different solver.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector2, Vector3};
use rand::RngCore;

use super::camera::{sqr_projection_error, Camera};
use super::gravity::GravityConstraint;
use super::ransac::sample_unique_indices;
use super::SE3;
use crate::optimizer::{refine_pose, Estimator};

/// Minimal number of correspondences of the linear solver.
pub const DLT_SAMPLE_SIZE: usize = 6;

/// Parameters of pose estimation.
#[derive(Debug, Clone, Copy)]
pub struct PoseParams {
    /// Minimal number of inlier correspondences for a valid pose.
    pub minimal_valid: usize,
    /// Maximal squared pixel error of an inlier.
    pub max_sqr_error: f64,
    /// RANSAC iterations, or LM iterations when refining from a prior pose.
    pub iterations: usize,
    pub estimator: Estimator,
    pub gravity: Option<GravityConstraint>,
}

impl Default for PoseParams {
    fn default() -> Self {
        Self {
            minimal_valid: 20,
            max_sqr_error: 3.5 * 3.5,
            iterations: 50,
            estimator: Estimator::Huber,
            gravity: None,
        }
    }
}

/// A camera pose together with the correspondences supporting it.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub world_t_camera: SE3,
    /// Indices of the inlier correspondences.
    pub inliers: Vec<usize>,
    /// Average squared pixel error over the inliers.
    pub sqr_error: f64,
}

/// Perspective pose solver.
pub trait PoseSolver: Send + Sync {
    /// Pose from scratch with RANSAC.
    fn ransac_pose(
        &self,
        camera: &dyn Camera,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        rng: &mut dyn RngCore,
        params: &PoseParams,
    ) -> Option<PoseEstimate>;

    /// Pose starting from a prior `world_t_camera`; outliers are removed after a first pass.
    fn refine_pose(
        &self,
        camera: &dyn Camera,
        world_t_camera: &SE3,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        params: &PoseParams,
    ) -> Option<PoseEstimate>;
}

/// Linear pose (T_cw) from at least six correspondences.
pub fn pose_dlt(camera: &dyn Camera, object_points: &[Vector3<f64>], image_points: &[Vector2<f64>]) -> Option<SE3> {
    let n = object_points.len();
    if n < DLT_SAMPLE_SIZE || n != image_points.len() {
        return None;
    }

    let mut a = DMatrix::<f64>::zeros(n * 2, 12);
    for (i, (x, image_point)) in object_points.iter().zip(image_points).enumerate() {
        let ray = camera.unproject(image_point);
        let xh = [x.x, x.y, x.z, 1.0];
        for j in 0..4 {
            a[(i * 2, j)] = xh[j];
            a[(i * 2, 8 + j)] = -ray.x * xh[j];
            a[(i * 2 + 1, 4 + j)] = xh[j];
            a[(i * 2 + 1, 8 + j)] = -ray.y * xh[j];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let p = v_t.row(smallest);
    let mut projection = Matrix3x4::from_fn(|r, c| p[r * 4 + c]);

    // the solution is defined up to sign: points must end up in front of the camera
    let in_front = object_points
        .iter()
        .filter(|x| (projection * x.push(1.0)).z > 0.0)
        .count();
    if in_front * 2 < n {
        projection = -projection;
    }

    let m: Matrix3<f64> = projection.fixed_view::<3, 3>(0, 0).into_owned();
    let m_svd = m.svd(true, true);
    let (u, v_t) = (m_svd.u?, m_svd.v_t?);
    let rotation = u * v_t;
    if rotation.determinant() <= 0.0 {
        return None;
    }
    let scale = m_svd.singular_values.sum() / 3.0;
    if scale < 1e-12 {
        return None;
    }
    let translation: Vector3<f64> = projection.column(3) / scale;

    Some(SE3::from_rt(rotation, translation))
}

/// Indices and average squared error of all correspondences within `max_sqr_error`.
pub fn pose_inliers(
    camera: &dyn Camera,
    camera_t_world: &SE3,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    max_sqr_error: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut sum = 0.0;
    for (i, (object_point, image_point)) in object_points.iter().zip(image_points).enumerate() {
        let sqr = sqr_projection_error(camera, camera_t_world, object_point, image_point);
        if sqr <= max_sqr_error {
            inliers.push(i);
            sum += sqr;
        }
    }
    let average = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum / inliers.len() as f64
    };
    (inliers, average)
}

/// RANSAC over [`pose_dlt`] with non-linear refinement.
#[derive(Debug, Clone, Copy, Default)]
pub struct DltPoseSolver;

impl DltPoseSolver {
    /// Refine on the given subset and re-evaluate inliers on all correspondences.
    fn refine_on(
        camera: &dyn Camera,
        world_t_camera: &SE3,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        subset: &[usize],
        iterations: usize,
        params: &PoseParams,
    ) -> Option<PoseEstimate> {
        let subset_objects: Vec<Vector3<f64>> = subset.iter().map(|&i| object_points[i]).collect();
        let subset_images: Vec<Vector2<f64>> = subset.iter().map(|&i| image_points[i]).collect();
        let refined = refine_pose(
            camera,
            world_t_camera,
            &subset_objects,
            &subset_images,
            iterations,
            params.estimator,
            params.gravity.as_ref(),
        )?;

        let camera_t_world = refined.world_t_camera.inverse();
        if let Some(gravity) = &params.gravity {
            if !gravity.is_satisfied(&camera_t_world) {
                return None;
            }
        }
        let (inliers, sqr_error) = pose_inliers(camera, &camera_t_world, object_points, image_points, params.max_sqr_error);
        Some(PoseEstimate {
            world_t_camera: refined.world_t_camera,
            inliers,
            sqr_error,
        })
    }
}

impl PoseSolver for DltPoseSolver {
    fn ransac_pose(
        &self,
        camera: &dyn Camera,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        rng: &mut dyn RngCore,
        params: &PoseParams,
    ) -> Option<PoseEstimate> {
        let n = object_points.len();
        if n < DLT_SAMPLE_SIZE || n != image_points.len() || n < params.minimal_valid {
            return None;
        }

        let mut best: Option<(SE3, Vec<usize>, f64)> = None;
        for _ in 0..params.iterations.max(1) {
            let sample = sample_unique_indices(rng, n, DLT_SAMPLE_SIZE);
            let sample_objects: Vec<Vector3<f64>> = sample.iter().map(|&i| object_points[i]).collect();
            let sample_images: Vec<Vector2<f64>> = sample.iter().map(|&i| image_points[i]).collect();

            let Some(camera_t_world) = pose_dlt(camera, &sample_objects, &sample_images) else {
                continue;
            };
            if let Some(gravity) = &params.gravity {
                // linear hypotheses are coarse, allow twice the final tolerance
                if gravity.alignment_angle(&camera_t_world) > gravity.max_angle * 2.0 {
                    continue;
                }
            }

            let (inliers, sqr_error) =
                pose_inliers(camera, &camera_t_world, object_points, image_points, params.max_sqr_error);
            let better = match &best {
                None => true,
                Some((_, b, e)) => inliers.len() > b.len() || (inliers.len() == b.len() && sqr_error < *e),
            };
            if better {
                best = Some((camera_t_world, inliers, sqr_error));
            }
        }

        let (camera_t_world, inliers, _) = best?;
        if inliers.len() < DLT_SAMPLE_SIZE.max(params.minimal_valid / 2) {
            return None;
        }

        let first = Self::refine_on(camera, &camera_t_world.inverse(), object_points, image_points, &inliers, 20, params)?;
        let second = Self::refine_on(camera, &first.world_t_camera, object_points, image_points, &first.inliers, 20, params)?;

        (second.inliers.len() >= params.minimal_valid).then_some(second)
    }

    fn refine_pose(
        &self,
        camera: &dyn Camera,
        world_t_camera: &SE3,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        params: &PoseParams,
    ) -> Option<PoseEstimate> {
        let n = object_points.len();
        if n < params.minimal_valid.max(3) || n != image_points.len() {
            return None;
        }
        let all: Vec<usize> = (0..n).collect();
        let first = Self::refine_on(camera, world_t_camera, object_points, image_points, &all, params.iterations, params)?;
        if first.inliers.len() < params.minimal_valid {
            return None;
        }
        if first.inliers.len() == n {
            return Some(first);
        }
        let second = Self::refine_on(
            camera,
            &first.world_t_camera,
            object_points,
            image_points,
            &first.inliers,
            params.iterations,
            params,
        )?;
        (second.inliers.len() >= params.minimal_valid).then_some(second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scene(num: usize, outliers: usize) -> (PinholeCamera, SE3, Vec<Vector3<f64>>, Vec<Vector2<f64>>) {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let world_t_camera = SE3::from_scaled_axis(Vector3::new(0.05, -0.2, 0.03), Vector3::new(0.4, 0.1, -0.3));
        let camera_t_world = world_t_camera.inverse();
        let mut rng = StdRng::seed_from_u64(11);

        let mut object_points = Vec::new();
        let mut image_points = Vec::new();
        for i in 0..num {
            let p_cam = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(3.0..8.0));
            let object_point = world_t_camera.transform_point(&p_cam);
            let mut image_point = camera.project(&camera_t_world.transform_point(&object_point));
            if i < outliers {
                image_point += Vector2::new(rng.gen_range(20.0..60.0), rng.gen_range(-60.0..-20.0));
            }
            object_points.push(object_point);
            image_points.push(image_point);
        }
        (camera, world_t_camera, object_points, image_points)
    }

    #[test]
    fn test_pose_dlt_exact() {
        let (camera, truth, object_points, image_points) = scene(10, 0);
        let camera_t_world = pose_dlt(&camera, &object_points, &image_points).unwrap();
        assert_relative_eq!(camera_t_world.inverse().translation, truth.translation, epsilon = 1e-6);
        assert!(camera_t_world.inverse().rotation.angle_to(&truth.rotation) < 1e-6);
    }

    #[test]
    fn test_ransac_pose_with_outliers() {
        let (camera, truth, object_points, image_points) = scene(60, 12);
        let mut rng = StdRng::seed_from_u64(5);
        let params = PoseParams {
            iterations: 200,
            ..Default::default()
        };

        let estimate = DltPoseSolver
            .ransac_pose(&camera, &object_points, &image_points, &mut rng, &params)
            .unwrap();

        assert_eq!(estimate.inliers.len(), 48);
        assert!(estimate.inliers.iter().all(|&i| i >= 12));
        assert_relative_eq!(estimate.world_t_camera.translation, truth.translation, epsilon = 1e-5);
    }

    #[test]
    fn test_refine_pose_from_prior() {
        let (camera, truth, object_points, image_points) = scene(30, 3);
        let prior = SE3::from_scaled_axis(
            truth.rotation.scaled_axis() + Vector3::new(0.01, 0.0, -0.01),
            truth.translation + Vector3::new(0.02, -0.02, 0.01),
        );
        let params = PoseParams {
            iterations: 20,
            ..Default::default()
        };

        let estimate = DltPoseSolver
            .refine_pose(&camera, &prior, &object_points, &image_points, &params)
            .unwrap();

        assert_eq!(estimate.inliers.len(), 27);
        assert!(estimate.sqr_error < 1e-6);
    }

    #[test]
    fn test_too_few_correspondences() {
        let (camera, _, object_points, image_points) = scene(10, 0);
        let mut rng = StdRng::seed_from_u64(5);
        assert!(DltPoseSolver
            .ransac_pose(&camera, &object_points, &image_points, &mut rng, &PoseParams::default())
            .is_none());
    }
}
