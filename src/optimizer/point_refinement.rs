//! Refinement of a single 3D point observed by cameras with fixed poses.
//!
//! Uses the `levenberg-marquardt` crate; robust weighting is applied by scaling
//! each residual with `sqrt(weight)` evaluated at the current estimate.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DVector, Dyn, OMatrix, Owned, Vector2, Vector3, U3};

use super::{point_jacobian, Estimator, ROBUST_THRESHOLD_PX};
use crate::geometry::camera::{Camera, MIN_DEPTH};
use crate::geometry::SE3;

/// Result of a point refinement.
#[derive(Debug, Clone, Copy)]
pub struct PointRefinement {
    pub position: Vector3<f64>,
    /// Average squared pixel error before optimization.
    pub initial_sqr_error: f64,
    /// Average squared pixel error after optimization.
    pub final_sqr_error: f64,
}

struct PointProblem<'a> {
    camera: &'a dyn Camera,
    camera_t_worlds: &'a [SE3],
    image_points: &'a [Vector2<f64>],
    estimator: Estimator,
    point: Vector3<f64>,
}

impl PointProblem<'_> {
    fn weights(&self) -> Option<Vec<f64>> {
        self.camera_t_worlds
            .iter()
            .zip(self.image_points)
            .map(|(pose, observed)| {
                let p_cam = pose.transform_point(&self.point);
                if p_cam.z <= MIN_DEPTH {
                    return None;
                }
                let error = (observed - self.camera.project(&p_cam)).norm();
                Some(self.estimator.weight(error, ROBUST_THRESHOLD_PX).sqrt())
            })
            .collect()
    }
}

impl LeastSquaresProblem<f64, Dyn, U3> for PointProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, params: &Vector3<f64>) {
        self.point = *params;
    }

    fn params(&self) -> Vector3<f64> {
        self.point
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let weights = self.weights()?;
        let mut residuals = DVector::zeros(self.image_points.len() * 2);
        for (i, (pose, observed)) in self.camera_t_worlds.iter().zip(self.image_points).enumerate() {
            let projected = self.camera.project(&pose.transform_point(&self.point));
            let e = (observed - projected) * weights[i];
            residuals[i * 2] = e.x;
            residuals[i * 2 + 1] = e.y;
        }
        Some(residuals)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U3>> {
        let weights = self.weights()?;
        let mut jacobian = OMatrix::<f64, Dyn, U3>::zeros(self.image_points.len() * 2);
        for (i, pose) in self.camera_t_worlds.iter().enumerate() {
            let p_cam = pose.transform_point(&self.point);
            let j = point_jacobian(self.camera, pose, &p_cam) * weights[i];
            jacobian.fixed_view_mut::<2, 3>(i * 2, 0).copy_from(&j);
        }
        Some(jacobian)
    }
}

/// Average squared reprojection error of a point, infinite if behind any camera.
pub fn average_sqr_error(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    image_points: &[Vector2<f64>],
    point: &Vector3<f64>,
) -> f64 {
    if image_points.is_empty() {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for (pose, observed) in camera_t_worlds.iter().zip(image_points) {
        let p_cam = pose.transform_point(point);
        if p_cam.z <= MIN_DEPTH {
            return f64::INFINITY;
        }
        sum += (observed - camera.project(&p_cam)).norm_squared();
    }
    sum / image_points.len() as f64
}

/// Refine a 3D point observed by cameras with fixed poses.
///
/// # Arguments
/// * `camera_t_worlds` - Fixed camera poses as T_cw
/// * `image_points` - Observation of the point in each camera
/// * `initial` - Starting position, must be in front of all cameras
/// * `iterations` - Maximal number of LM iterations
pub fn refine_point(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    image_points: &[Vector2<f64>],
    initial: &Vector3<f64>,
    iterations: usize,
    estimator: Estimator,
) -> Option<PointRefinement> {
    debug_assert_eq!(camera_t_worlds.len(), image_points.len());
    if camera_t_worlds.len() < 2 || camera_t_worlds.len() != image_points.len() {
        return None;
    }

    let initial_sqr_error = average_sqr_error(camera, camera_t_worlds, image_points, initial);
    if !initial_sqr_error.is_finite() {
        return None;
    }

    let problem = PointProblem {
        camera,
        camera_t_worlds,
        image_points,
        estimator,
        point: *initial,
    };

    let (problem, report) = LevenbergMarquardt::new()
        .with_patience(iterations.max(1))
        .minimize(problem);

    // running out of patience still leaves a usable, improved estimate
    let position = if report.termination.was_successful()
        || matches!(report.termination, TerminationReason::LostPatience)
    {
        problem.point
    } else {
        *initial
    };

    let final_sqr_error = average_sqr_error(camera, camera_t_worlds, image_points, &position);
    if !final_sqr_error.is_finite() {
        return None;
    }

    Some(PointRefinement {
        position,
        initial_sqr_error,
        final_sqr_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use approx::assert_relative_eq;

    fn setup() -> (PinholeCamera, Vec<SE3>, Vector3<f64>) {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let world_t_cameras = [
            SE3::identity(),
            SE3::from_scaled_axis(Vector3::new(0.0, 0.05, 0.0), Vector3::new(0.3, 0.0, 0.0)),
            SE3::from_scaled_axis(Vector3::new(0.0, -0.05, 0.0), Vector3::new(-0.3, 0.1, 0.0)),
        ];
        let camera_t_worlds = world_t_cameras.iter().map(|p| p.inverse()).collect();
        (camera, camera_t_worlds, Vector3::new(0.2, -0.1, 4.0))
    }

    #[test]
    fn test_refine_point_converges() {
        let (camera, poses, truth) = setup();
        let image_points: Vec<_> = poses
            .iter()
            .map(|p| camera.project(&p.transform_point(&truth)))
            .collect();

        let initial = truth + Vector3::new(0.1, -0.05, 0.3);
        let result = refine_point(&camera, &poses, &image_points, &initial, 20, Estimator::Square).unwrap();

        assert!(result.final_sqr_error < result.initial_sqr_error);
        assert!(result.final_sqr_error < 1e-6);
        assert_relative_eq!(result.position, truth, epsilon = 1e-3);
    }

    #[test]
    fn test_refine_point_rejects_point_behind_camera() {
        let (camera, poses, truth) = setup();
        let image_points: Vec<_> = poses
            .iter()
            .map(|p| camera.project(&p.transform_point(&truth)))
            .collect();

        let behind = Vector3::new(0.0, 0.0, -2.0);
        assert!(refine_point(&camera, &poses, &image_points, &behind, 10, Estimator::Huber).is_none());
    }

    #[test]
    fn test_single_observation_is_rejected() {
        let (camera, poses, truth) = setup();
        let image_points = vec![camera.project(&poses[0].transform_point(&truth))];
        assert!(refine_point(&camera, &poses[..1], &image_points, &truth, 10, Estimator::Square).is_none());
    }
}
