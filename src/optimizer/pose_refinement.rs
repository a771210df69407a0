//! Pose-only optimization with fixed 3D points.
//!
//! Levenberg-Marquardt over a 6-DoF left perturbation of T_cw, with an optional
//! gravity alignment residual.

use nalgebra::{Matrix6, Vector2, Vector3, Vector6};

use super::{pose_jacobian, Estimator, ROBUST_THRESHOLD_PX};
use crate::geometry::camera::{Camera, MIN_DEPTH};
use crate::geometry::gravity::GravityConstraint;
use crate::geometry::se3::skew;
use crate::geometry::SE3;

/// Result of a pose refinement.
#[derive(Debug, Clone, Copy)]
pub struct PoseRefinement {
    /// Optimized pose as T_wc.
    pub world_t_camera: SE3,
    /// Average squared pixel error before optimization.
    pub initial_sqr_error: f64,
    /// Average squared pixel error after optimization.
    pub final_sqr_error: f64,
    pub iterations: usize,
}

struct PoseProblem<'a> {
    camera: &'a dyn Camera,
    object_points: &'a [Vector3<f64>],
    image_points: &'a [Vector2<f64>],
    estimator: Estimator,
    gravity: Option<&'a GravityConstraint>,
}

impl PoseProblem<'_> {
    /// Robust cost; `None` if any point is behind the camera.
    fn cost(&self, camera_t_world: &SE3) -> Option<f64> {
        let mut cost = 0.0;
        for (object_point, observed) in self.object_points.iter().zip(self.image_points) {
            let p_cam = camera_t_world.transform_point(object_point);
            if p_cam.z <= MIN_DEPTH {
                return None;
            }
            let sqr = (observed - self.camera.project(&p_cam)).norm_squared();
            cost += self.estimator.cost(sqr, ROBUST_THRESHOLD_PX);
        }
        if let Some(gravity) = self.gravity {
            cost += gravity.residual(camera_t_world).norm_squared();
        }
        Some(cost)
    }

    /// Normal equations `(H, b)` with `H delta = b`.
    fn normal_equations(&self, camera_t_world: &SE3) -> (Matrix6<f64>, Vector6<f64>) {
        let mut h = Matrix6::zeros();
        let mut b = Vector6::zeros();
        for (object_point, observed) in self.object_points.iter().zip(self.image_points) {
            let p_cam = camera_t_world.transform_point(object_point);
            if p_cam.z <= MIN_DEPTH {
                continue;
            }
            let e = observed - self.camera.project(&p_cam);
            let w = self.estimator.weight(e.norm(), ROBUST_THRESHOLD_PX);
            let j = pose_jacobian(self.camera, &p_cam);
            h += j.transpose() * j * w;
            b -= j.transpose() * e * w;
        }
        if let Some(gravity) = self.gravity {
            let e = gravity.residual(camera_t_world);
            let mut j = nalgebra::Matrix3x6::zeros();
            let predicted = gravity.predicted(camera_t_world);
            j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(skew(&predicted) * gravity.weight));
            h += j.transpose() * j;
            b -= j.transpose() * e;
        }
        (h, b)
    }
}

/// Average squared pixel error of a pose, infinite if any point is behind the camera.
pub fn pose_sqr_error(
    camera: &dyn Camera,
    camera_t_world: &SE3,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
) -> f64 {
    if object_points.is_empty() {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for (object_point, observed) in object_points.iter().zip(image_points) {
        let p_cam = camera_t_world.transform_point(object_point);
        if p_cam.z <= MIN_DEPTH {
            return f64::INFINITY;
        }
        sum += (observed - camera.project(&p_cam)).norm_squared();
    }
    sum / object_points.len() as f64
}

/// Refine a camera pose against fixed 3D points.
///
/// # Arguments
/// * `world_t_camera` - Initial pose (T_wc)
/// * `object_points` / `image_points` - 3D-2D correspondences
/// * `iterations` - Maximal number of LM iterations
/// * `gravity` - Optional gravity soft constraint
pub fn refine_pose(
    camera: &dyn Camera,
    world_t_camera: &SE3,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    iterations: usize,
    estimator: Estimator,
    gravity: Option<&GravityConstraint>,
) -> Option<PoseRefinement> {
    debug_assert_eq!(object_points.len(), image_points.len());
    if object_points.len() < 3 || object_points.len() != image_points.len() {
        return None;
    }

    let problem = PoseProblem {
        camera,
        object_points,
        image_points,
        estimator,
        gravity,
    };

    let mut camera_t_world = world_t_camera.inverse();
    let initial_sqr_error = pose_sqr_error(camera, &camera_t_world, object_points, image_points);
    let mut current_cost = problem.cost(&camera_t_world)?;

    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let mut performed = 0;

    for iter in 0..iterations {
        performed = iter + 1;

        let (h, b) = problem.normal_equations(&camera_t_world);
        if b.norm() < 1e-10 {
            break;
        }

        let mut damped = h;
        for i in 0..6 {
            damped[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }

        let delta = match damped.cholesky() {
            Some(chol) => chol.solve(&b),
            None => match damped.lu().solve(&b) {
                Some(d) => d,
                None => break,
            },
        };

        let trial = camera_t_world.left_perturbed(&delta);
        match problem.cost(&trial) {
            Some(trial_cost) if trial_cost < current_cost => {
                let improvement = current_cost - trial_cost;
                camera_t_world = trial;
                current_cost = trial_cost;
                lambda = (lambda * lambda_down).max(1e-10);
                if improvement < 1e-12 * (1.0 + current_cost) || delta.norm() < 1e-12 {
                    break;
                }
            }
            _ => {
                lambda = (lambda * lambda_up).min(1e10);
            }
        }
    }

    let final_sqr_error = pose_sqr_error(camera, &camera_t_world, object_points, image_points);
    if !final_sqr_error.is_finite() {
        return None;
    }

    Some(PoseRefinement {
        world_t_camera: camera_t_world.inverse(),
        initial_sqr_error,
        final_sqr_error,
        iterations: performed,
    })
}
