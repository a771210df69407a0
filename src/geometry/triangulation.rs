//! Multi-view triangulation of single 3D points.
//!
//! [`triangulate_dlt`] solves the linear system of all views at once; the
//! [`RansacPointTriangulator`] wraps it in a two-view minimal-sample RANSAC and
//! refines the winning hypothesis on its inliers.

use nalgebra::{DMatrix, Vector2, Vector3};
use rand::RngCore;

use super::camera::{is_in_front, sqr_projection_error, Camera};
use super::ransac::sample_unique_indices;
use super::SE3;
use crate::optimizer::{refine_point, Estimator, PointRefinement};

/// Parameters of a RANSAC point triangulation.
#[derive(Debug, Clone, Copy)]
pub struct PointRansacParams {
    pub iterations: usize,
    /// Maximal squared pixel error for an observation to count as inlier.
    pub max_sqr_error: f64,
    /// Minimal number of inlier observations.
    pub minimal_valid: usize,
    pub estimator: Estimator,
}

impl Default for PointRansacParams {
    fn default() -> Self {
        Self {
            iterations: 20,
            max_sqr_error: 9.0,
            minimal_valid: 2,
            estimator: Estimator::Huber,
        }
    }
}

/// A triangulated point together with the observations supporting it.
#[derive(Debug, Clone)]
pub struct PointEstimate {
    pub position: Vector3<f64>,
    /// Indices of the inlier observations.
    pub inliers: Vec<usize>,
    /// Average squared pixel error over the inliers.
    pub sqr_error: f64,
}

/// Triangulation of a single point from several posed observations.
pub trait PointTriangulator: Send + Sync {
    /// Robustly triangulate a point.
    ///
    /// # Arguments
    /// * `world_t_cameras` - Camera poses (T_wc), one per observation
    /// * `image_points` - Observations of the point
    fn ransac_point(
        &self,
        camera: &dyn Camera,
        world_t_cameras: &[SE3],
        image_points: &[Vector2<f64>],
        rng: &mut dyn RngCore,
        params: &PointRansacParams,
    ) -> Option<PointEstimate>;

    /// Optimize a point position with all camera poses held fixed.
    fn optimize_point(
        &self,
        camera: &dyn Camera,
        world_t_cameras: &[SE3],
        image_points: &[Vector2<f64>],
        initial: &Vector3<f64>,
        iterations: usize,
        estimator: Estimator,
    ) -> Option<PointRefinement>;
}

/// Linear triangulation over all views (normalized image coordinates).
///
/// # Arguments
/// * `camera_t_worlds` - Camera poses as T_cw
pub fn triangulate_dlt(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    image_points: &[Vector2<f64>],
) -> Option<Vector3<f64>> {
    let n = camera_t_worlds.len();
    if n < 2 || n != image_points.len() {
        return None;
    }

    // each view gives 2 equations: x * P[2] - P[0] and y * P[2] - P[1]
    let mut a = DMatrix::<f64>::zeros(n * 2, 4);
    for (i, (pose, image_point)) in camera_t_worlds.iter().zip(image_points).enumerate() {
        let ray = camera.unproject(image_point);
        let r = pose.rotation_matrix();
        let t = pose.translation;
        for j in 0..4 {
            let (p0, p1, p2) = if j < 3 {
                (r[(0, j)], r[(1, j)], r[(2, j)])
            } else {
                (t.x, t.y, t.z)
            };
            a[(i * 2, j)] = ray.x * p2 - p0;
            a[(i * 2 + 1, j)] = ray.y * p2 - p1;
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(smallest);

    if x[3].abs() < 1e-12 {
        return None;
    }
    let point = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    point.iter().all(|v| v.is_finite()).then_some(point)
}

/// Two-view RANSAC on top of [`triangulate_dlt`], followed by inlier refinement.
#[derive(Debug, Clone, Copy, Default)]
pub struct RansacPointTriangulator;

impl RansacPointTriangulator {
    fn inliers(
        camera: &dyn Camera,
        camera_t_worlds: &[SE3],
        image_points: &[Vector2<f64>],
        point: &Vector3<f64>,
        max_sqr_error: f64,
    ) -> (Vec<usize>, f64) {
        let mut inliers = Vec::new();
        let mut sum = 0.0;
        for (i, (pose, image_point)) in camera_t_worlds.iter().zip(image_points).enumerate() {
            let sqr = sqr_projection_error(camera, pose, point, image_point);
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
}

impl PointTriangulator for RansacPointTriangulator {
    fn ransac_point(
        &self,
        camera: &dyn Camera,
        world_t_cameras: &[SE3],
        image_points: &[Vector2<f64>],
        rng: &mut dyn RngCore,
        params: &PointRansacParams,
    ) -> Option<PointEstimate> {
        let n = world_t_cameras.len();
        if n < 2 || n != image_points.len() || params.minimal_valid > n {
            return None;
        }
        let camera_t_worlds: Vec<SE3> = world_t_cameras.iter().map(|p| p.inverse()).collect();

        let mut best: Option<PointEstimate> = None;
        for _ in 0..params.iterations.max(1) {
            let sample = sample_unique_indices(rng, n, 2);
            let poses = [camera_t_worlds[sample[0]], camera_t_worlds[sample[1]]];
            let observations = [image_points[sample[0]], image_points[sample[1]]];

            let Some(point) = triangulate_dlt(camera, &poses, &observations) else {
                continue;
            };
            if !poses.iter().all(|pose| is_in_front(pose, &point)) {
                continue;
            }

            let (inliers, sqr_error) = Self::inliers(camera, &camera_t_worlds, image_points, &point, params.max_sqr_error);
            let better = match &best {
                None => true,
                Some(b) => {
                    inliers.len() > b.inliers.len() || (inliers.len() == b.inliers.len() && sqr_error < b.sqr_error)
                }
            };
            if better {
                best = Some(PointEstimate {
                    position: point,
                    inliers,
                    sqr_error,
                });
            }
        }

        let mut best = best.filter(|b| b.inliers.len() >= params.minimal_valid.max(2))?;

        let inlier_poses: Vec<SE3> = best.inliers.iter().map(|&i| camera_t_worlds[i]).collect();
        let inlier_points: Vec<Vector2<f64>> = best.inliers.iter().map(|&i| image_points[i]).collect();
        if let Some(refined) = refine_point(camera, &inlier_poses, &inlier_points, &best.position, 10, params.estimator) {
            let (inliers, sqr_error) =
                Self::inliers(camera, &camera_t_worlds, image_points, &refined.position, params.max_sqr_error);
            if inliers.len() >= best.inliers.len() {
                best = PointEstimate {
                    position: refined.position,
                    inliers,
                    sqr_error,
                };
            }
        }

        Some(best)
    }

    fn optimize_point(
        &self,
        camera: &dyn Camera,
        world_t_cameras: &[SE3],
        image_points: &[Vector2<f64>],
        initial: &Vector3<f64>,
        iterations: usize,
        estimator: Estimator,
    ) -> Option<PointRefinement> {
        let camera_t_worlds: Vec<SE3> = world_t_cameras.iter().map(|p| p.inverse()).collect();
        refine_point(camera, &camera_t_worlds, image_points, initial, iterations, estimator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn views() -> (PinholeCamera, Vec<SE3>, Vector3<f64>, Vec<Vector2<f64>>) {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let world_t_cameras: Vec<SE3> = (0..6)
            .map(|i| SE3::from_scaled_axis(Vector3::new(0.0, 0.01 * i as f64, 0.0), Vector3::new(0.1 * i as f64, 0.0, 0.0)))
            .collect();
        let point = Vector3::new(0.3, -0.2, 5.0);
        let image_points = world_t_cameras
            .iter()
            .map(|p| camera.project(&p.inverse().transform_point(&point)))
            .collect();
        (camera, world_t_cameras, point, image_points)
    }

    #[test]
    fn test_triangulate_dlt_two_views() {
        let (camera, poses, point, image_points) = views();
        let camera_t_worlds: Vec<SE3> = poses.iter().map(|p| p.inverse()).collect();
        let result = triangulate_dlt(&camera, &camera_t_worlds[..2], &image_points[..2]).unwrap();
        assert_relative_eq!(result, point, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_point_rejects_outlier() {
        let (camera, poses, point, mut image_points) = views();
        image_points[3] += Vector2::new(25.0, -10.0);

        let mut rng = StdRng::seed_from_u64(3);
        let estimate = RansacPointTriangulator
            .ransac_point(&camera, &poses, &image_points, &mut rng, &PointRansacParams::default())
            .unwrap();

        assert_eq!(estimate.inliers, vec![0, 1, 2, 4, 5]);
        assert_relative_eq!(estimate.position, point, epsilon = 1e-4);
        assert!(estimate.sqr_error < 1e-6);
    }

    #[test]
    fn test_ransac_point_requires_minimal_valid() {
        let (camera, poses, _, image_points) = views();
        let mut rng = StdRng::seed_from_u64(3);
        let params = PointRansacParams {
            minimal_valid: 7,
            ..Default::default()
        };
        assert!(RansacPointTriangulator
            .ransac_point(&camera, &poses, &image_points, &mut rng, &params)
            .is_none());
    }
}
