//! Non-linear least-squares optimization.
//!
//! - Pose refinement with fixed 3D points (tracking, back-filling poses)
//! - Point refinement with fixed poses (promotion, precision repair)
//! - Bundle Adjustment of key-frame poses and points (Schur complement LM)
//!
//! All residuals follow the g2o convention `e = observed - projected`, and pose
//! updates are left perturbations `exp(delta) * T_cw` with the rotation block first.

pub mod bundle_adjustment;
pub mod point_refinement;
pub mod pose_refinement;

pub use bundle_adjustment::{
    BundleAdjuster, BundleGravity, BundleObservation, BundleParams, BundleProblem, BundleReport,
    SchurBundleAdjuster,
};
pub use point_refinement::{refine_point, PointRefinement};
pub use pose_refinement::{refine_pose, PoseRefinement};

use nalgebra::{Matrix2x3, Matrix2x6, Vector3};

use crate::geometry::camera::Camera;
use crate::geometry::se3::skew;
use crate::geometry::SE3;

/// Robust error estimator applied to pixel residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimator {
    /// Plain least squares.
    Square,
    /// Quadratic below the threshold, linear above.
    Huber,
    /// Logarithmic growth above the threshold.
    Cauchy,
}

/// Default threshold (pixels) of the robust kernels, ~95% chi2 with 2 DOF.
pub const ROBUST_THRESHOLD_PX: f64 = 2.447_651_936_039_926;

impl Estimator {
    /// IRLS weight for a residual with the given norm.
    #[inline]
    pub fn weight(&self, error_norm: f64, threshold: f64) -> f64 {
        match self {
            Self::Square => 1.0,
            Self::Huber => {
                if error_norm <= threshold {
                    1.0
                } else {
                    threshold / error_norm
                }
            }
            Self::Cauchy => 1.0 / (1.0 + (error_norm / threshold).powi(2)),
        }
    }

    /// Robust cost of a squared residual.
    #[inline]
    pub fn cost(&self, sqr_error: f64, threshold: f64) -> f64 {
        match self {
            Self::Square => sqr_error,
            Self::Huber => {
                let e = sqr_error.sqrt();
                if e <= threshold {
                    sqr_error
                } else {
                    2.0 * threshold * e - threshold * threshold
                }
            }
            Self::Cauchy => {
                let k2 = threshold * threshold;
                k2 * (1.0 + sqr_error / k2).ln()
            }
        }
    }
}

/// Jacobian of `observed - project(T_cw * X)` w.r.t. a left perturbation of T_cw.
///
/// `camera_point` is `T_cw * X`.
#[inline]
pub(crate) fn pose_jacobian(camera: &dyn Camera, camera_point: &Vector3<f64>) -> Matrix2x6<f64> {
    let j_proj = camera.projection_jacobian(camera_point);
    let j_rot = j_proj * skew(camera_point);
    let mut jac = Matrix2x6::zeros();
    jac.fixed_view_mut::<2, 3>(0, 0).copy_from(&j_rot);
    jac.fixed_view_mut::<2, 3>(0, 3).copy_from(&(-j_proj));
    jac
}

/// Jacobian of `observed - project(T_cw * X)` w.r.t. the world point X.
#[inline]
pub(crate) fn point_jacobian(
    camera: &dyn Camera,
    camera_t_world: &SE3,
    camera_point: &Vector3<f64>,
) -> Matrix2x3<f64> {
    -(camera.projection_jacobian(camera_point) * camera_t_world.rotation_matrix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use nalgebra::{Vector2, Vector6};

    fn residual(camera: &PinholeCamera, pose: &SE3, point: &Vector3<f64>, observed: &Vector2<f64>) -> Vector2<f64> {
        observed - camera.project(&pose.transform_point(point))
    }

    #[test]
    fn test_estimator_weights() {
        assert_eq!(Estimator::Square.weight(100.0, 1.0), 1.0);
        assert_eq!(Estimator::Huber.weight(0.5, 1.0), 1.0);
        assert_relative_eq!(Estimator::Huber.weight(4.0, 1.0), 0.25);
        assert_relative_eq!(Estimator::Cauchy.weight(1.0, 1.0), 0.5);
        assert!(Estimator::Huber.cost(100.0, 1.0) < Estimator::Square.cost(100.0, 1.0));
    }

    #[test]
    fn test_pose_jacobian_numeric() {
        let camera = PinholeCamera::new(640, 480, 500.0, 520.0, 320.0, 240.0);
        let pose = SE3::from_scaled_axis(Vector3::new(0.05, -0.1, 0.02), Vector3::new(0.1, 0.0, 0.3));
        let point = Vector3::new(0.4, -0.3, 3.0);
        let observed = Vector2::new(300.0, 200.0);

        let analytic = pose_jacobian(&camera, &pose.transform_point(&point));
        let base = residual(&camera, &pose, &point, &observed);
        let eps = 1e-7;
        for c in 0..6 {
            let mut delta = Vector6::zeros();
            delta[c] = eps;
            let perturbed = residual(&camera, &pose.left_perturbed(&delta), &point, &observed);
            let numeric = (perturbed - base) / eps;
            assert_relative_eq!(analytic[(0, c)], numeric.x, epsilon = 1e-2);
            assert_relative_eq!(analytic[(1, c)], numeric.y, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_point_jacobian_numeric() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let pose = SE3::from_scaled_axis(Vector3::new(0.2, 0.1, -0.1), Vector3::new(-0.2, 0.1, 0.5));
        let point = Vector3::new(0.1, 0.2, 2.5);
        let observed = Vector2::new(320.0, 240.0);

        let analytic = point_jacobian(&camera, &pose, &pose.transform_point(&point));
        let base = residual(&camera, &pose, &point, &observed);
        let eps = 1e-7;
        for c in 0..3 {
            let mut p = point;
            p[c] += eps;
            let numeric = (residual(&camera, &pose, &p, &observed) - base) / eps;
            assert_relative_eq!(analytic[(0, c)], numeric.x, epsilon = 1e-2);
            assert_relative_eq!(analytic[(1, c)], numeric.y, epsilon = 1e-2);
        }
    }
}
