//! Bundle Adjustment of key-frame poses and 3D points.
//!
//! Bundle Adjustment minimizes the reprojection error:
//!
//! ```text
//! E = Σ_i,j ρ(||u_ij - π(T_i, p_j)||²) + Σ_i ||w (g_i - R_i g_world)||²
//! ```
//!
//! where:
//! - `u_ij` is the observation of point `j` in key frame `i`
//! - `π(T, p)` projects 3D point `p` using camera pose `T` (T_cw)
//! - `ρ` is the robust kernel of the selected [`Estimator`]
//! - the optional second term aligns each camera with the measured gravity
//!
//! Each LM step solves the damped normal equations with the Schur complement:
//! point blocks are 3x3 and eliminated first, the reduced camera system is dense.
//! The first `fixed_poses` poses are held constant to fix the gauge.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x6, Matrix6, Matrix6x3, Vector2, Vector3, Vector6};

use super::{point_jacobian, pose_jacobian, Estimator, ROBUST_THRESHOLD_PX};
use crate::geometry::camera::{Camera, MIN_DEPTH};
use crate::geometry::se3::skew;
use crate::geometry::SE3;

/// A single observation in a bundle problem.
#[derive(Debug, Clone, Copy)]
pub struct BundleObservation {
    pub pose_index: usize,
    pub point_index: usize,
    pub image_point: Vector2<f64>,
}

/// Gravity measurements for every pose of a bundle problem.
#[derive(Debug, Clone)]
pub struct BundleGravity {
    /// Unit gravity in each camera frame, one per pose.
    pub camera_gravities: Vec<Vector3<f64>>,
    pub world_gravity: Vector3<f64>,
    pub weight: f64,
}

/// Poses, points, and the observation graph linking them.
///
/// Poses are stored as T_wc and are updated in place by the optimizer.
#[derive(Debug, Clone, Default)]
pub struct BundleProblem {
    pub world_t_cameras: Vec<SE3>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BundleObservation>,
    pub gravity: Option<BundleGravity>,
}

impl BundleProblem {
    /// Average squared pixel error over all observations.
    pub fn average_sqr_error(&self, camera: &dyn Camera) -> f64 {
        let camera_t_worlds: Vec<SE3> = self.world_t_cameras.iter().map(|p| p.inverse()).collect();
        average_sqr_error(camera, &camera_t_worlds, &self.points, &self.observations)
    }
}

/// Configuration for Bundle Adjustment.
#[derive(Debug, Clone, Copy)]
pub struct BundleParams {
    /// Maximum number of LM iterations.
    pub iterations: usize,
    pub estimator: Estimator,
    /// Number of leading poses kept constant.
    pub fixed_poses: usize,
}

impl Default for BundleParams {
    fn default() -> Self {
        Self {
            iterations: 20,
            estimator: Estimator::Square,
            fixed_poses: 1,
        }
    }
}

/// Outcome of a Bundle Adjustment run.
#[derive(Debug, Clone, Copy)]
pub struct BundleReport {
    pub iterations: usize,
    /// Average squared pixel error before optimization.
    pub initial_sqr_error: f64,
    /// Average squared pixel error after optimization.
    pub final_sqr_error: f64,
}

/// Joint optimizer of camera poses and 3D points.
pub trait BundleAdjuster: Send + Sync {
    /// Optimize `problem` in place; `None` if the problem is degenerate.
    fn optimize(&self, camera: &dyn Camera, problem: &mut BundleProblem, params: &BundleParams) -> Option<BundleReport>;
}

/// Levenberg-Marquardt Bundle Adjustment with Schur complement on the points.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchurBundleAdjuster;

impl BundleAdjuster for SchurBundleAdjuster {
    fn optimize(&self, camera: &dyn Camera, problem: &mut BundleProblem, params: &BundleParams) -> Option<BundleReport> {
        solve_bundle(camera, problem, params)
    }
}

fn average_sqr_error(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    points: &[Vector3<f64>],
    observations: &[BundleObservation],
) -> f64 {
    if observations.is_empty() {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for obs in observations {
        let p_cam = camera_t_worlds[obs.pose_index].transform_point(&points[obs.point_index]);
        if p_cam.z <= MIN_DEPTH {
            return f64::INFINITY;
        }
        sum += (obs.image_point - camera.project(&p_cam)).norm_squared();
    }
    sum / observations.len() as f64
}

fn total_cost(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    points: &[Vector3<f64>],
    observations: &[BundleObservation],
    gravity: Option<&BundleGravity>,
    estimator: Estimator,
) -> Option<f64> {
    let mut cost = 0.0;
    for obs in observations {
        let p_cam = camera_t_worlds[obs.pose_index].transform_point(&points[obs.point_index]);
        if p_cam.z <= MIN_DEPTH {
            return None;
        }
        let sqr = (obs.image_point - camera.project(&p_cam)).norm_squared();
        cost += estimator.cost(sqr, ROBUST_THRESHOLD_PX);
    }
    if let Some(gravity) = gravity {
        for (pose, camera_gravity) in camera_t_worlds.iter().zip(&gravity.camera_gravities) {
            let predicted = pose.rotation * gravity.world_gravity;
            cost += ((camera_gravity - predicted) * gravity.weight).norm_squared();
        }
    }
    Some(cost)
}

fn solve_bundle(camera: &dyn Camera, problem: &mut BundleProblem, params: &BundleParams) -> Option<BundleReport> {
    let num_poses = problem.world_t_cameras.len();
    let num_points = problem.points.len();
    if num_poses < 2 || num_points == 0 || problem.observations.is_empty() {
        return None;
    }
    if let Some(gravity) = &problem.gravity {
        if gravity.camera_gravities.len() != num_poses {
            return None;
        }
    }
    let fixed = params.fixed_poses.min(num_poses);
    let num_free = num_poses - fixed;

    // observation indices grouped per point
    let mut point_observations: Vec<Vec<usize>> = vec![Vec::new(); num_points];
    for (i, obs) in problem.observations.iter().enumerate() {
        if obs.pose_index >= num_poses || obs.point_index >= num_points {
            return None;
        }
        point_observations[obs.point_index].push(i);
    }

    let mut camera_t_worlds: Vec<SE3> = problem.world_t_cameras.iter().map(|p| p.inverse()).collect();
    let mut points = problem.points.clone();
    let gravity = problem.gravity.as_ref();

    let initial_sqr_error = average_sqr_error(camera, &camera_t_worlds, &points, &problem.observations);
    let mut current_cost = total_cost(camera, &camera_t_worlds, &points, &problem.observations, gravity, params.estimator)?;

    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let mut iterations = 0;

    for iter in 0..params.iterations {
        iterations = iter + 1;

        // Step 1: per-observation Jacobians and residuals
        let mut h_cc = vec![Matrix6::<f64>::zeros(); num_free];
        let mut b_c = vec![Vector6::<f64>::zeros(); num_free];
        let mut h_pp = vec![Matrix3::<f64>::zeros(); num_points];
        let mut b_p = vec![Vector3::<f64>::zeros(); num_points];
        let mut h_cp: Vec<Option<Matrix6x3<f64>>> = vec![None; problem.observations.len()];

        for (i, obs) in problem.observations.iter().enumerate() {
            let pose = &camera_t_worlds[obs.pose_index];
            let p_cam = pose.transform_point(&points[obs.point_index]);
            if p_cam.z <= MIN_DEPTH {
                continue;
            }
            let e = obs.image_point - camera.project(&p_cam);
            let w = params.estimator.weight(e.norm(), ROBUST_THRESHOLD_PX);
            let j_p = point_jacobian(camera, pose, &p_cam);

            h_pp[obs.point_index] += j_p.transpose() * j_p * w;
            b_p[obs.point_index] -= j_p.transpose() * e * w;

            if obs.pose_index >= fixed {
                let c = obs.pose_index - fixed;
                let j_c = pose_jacobian(camera, &p_cam);
                h_cc[c] += j_c.transpose() * j_c * w;
                b_c[c] -= j_c.transpose() * e * w;
                h_cp[i] = Some(j_c.transpose() * j_p * w);
            }
        }

        if let Some(gravity) = gravity {
            for c in 0..num_free {
                let pose = &camera_t_worlds[c + fixed];
                let predicted = pose.rotation * gravity.world_gravity;
                let e = (gravity.camera_gravities[c + fixed] - predicted) * gravity.weight;
                let mut j = Matrix3x6::zeros();
                j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(skew(&predicted) * gravity.weight));
                h_cc[c] += j.transpose() * j;
                b_c[c] -= j.transpose() * e;
            }
        }

        // Step 2: damping
        for h in h_cc.iter_mut() {
            for k in 0..6 {
                h[(k, k)] += lambda * h[(k, k)].max(1e-6);
            }
        }
        let mut h_pp_inv = Vec::with_capacity(num_points);
        for h in h_pp.iter() {
            let mut damped = *h;
            for k in 0..3 {
                damped[(k, k)] += lambda * h[(k, k)].max(1e-6);
            }
            h_pp_inv.push(damped.try_inverse().unwrap_or_else(Matrix3::zeros));
        }

        // Step 3: reduced camera system S dc = r
        let mut delta_c = DVector::<f64>::zeros(num_free * 6);
        if num_free > 0 {
            let mut s = DMatrix::<f64>::zeros(num_free * 6, num_free * 6);
            let mut r = DVector::<f64>::zeros(num_free * 6);
            for c in 0..num_free {
                s.fixed_view_mut::<6, 6>(c * 6, c * 6).copy_from(&h_cc[c]);
                r.fixed_rows_mut::<6>(c * 6).copy_from(&b_c[c]);
            }
            for (p, obs_indices) in point_observations.iter().enumerate() {
                let v_inv = &h_pp_inv[p];
                for &i1 in obs_indices {
                    let Some(w1) = h_cp[i1] else { continue };
                    let c1 = problem.observations[i1].pose_index - fixed;
                    let w1_v_inv = w1 * v_inv;
                    let mut r_block = r.fixed_rows_mut::<6>(c1 * 6);
                    r_block -= w1_v_inv * b_p[p];
                    for &i2 in obs_indices {
                        let Some(w2) = h_cp[i2] else { continue };
                        let c2 = problem.observations[i2].pose_index - fixed;
                        let mut block = s.fixed_view_mut::<6, 6>(c1 * 6, c2 * 6);
                        block -= w1_v_inv * w2.transpose();
                    }
                }
            }
            delta_c = match s.clone().cholesky() {
                Some(chol) => chol.solve(&r),
                None => match s.lu().solve(&r) {
                    Some(d) => d,
                    None => break,
                },
            };
        }

        // Step 4: back-substitute the point updates
        let mut trial_points = points.clone();
        for (p, obs_indices) in point_observations.iter().enumerate() {
            let mut rhs = b_p[p];
            for &i in obs_indices {
                if let Some(w) = h_cp[i] {
                    let c = problem.observations[i].pose_index - fixed;
                    rhs -= w.transpose() * delta_c.fixed_rows::<6>(c * 6);
                }
            }
            trial_points[p] += h_pp_inv[p] * rhs;
        }
        let mut trial_poses = camera_t_worlds.clone();
        for c in 0..num_free {
            let delta: Vector6<f64> = delta_c.fixed_rows::<6>(c * 6).into_owned();
            trial_poses[c + fixed] = camera_t_worlds[c + fixed].left_perturbed(&delta);
        }

        // Step 5: accept or reject
        match total_cost(camera, &trial_poses, &trial_points, &problem.observations, gravity, params.estimator) {
            Some(trial_cost) if trial_cost < current_cost => {
                let improvement = current_cost - trial_cost;
                camera_t_worlds = trial_poses;
                points = trial_points;
                current_cost = trial_cost;
                lambda = (lambda * lambda_down).max(1e-10);
                if improvement < 1e-12 * (1.0 + current_cost) {
                    break;
                }
            }
            _ => {
                lambda = (lambda * lambda_up).min(1e10);
            }
        }
    }

    let final_sqr_error = average_sqr_error(camera, &camera_t_worlds, &points, &problem.observations);

    problem.world_t_cameras = camera_t_worlds.iter().map(|p| p.inverse()).collect();
    problem.points = points;

    Some(BundleReport {
        iterations,
        initial_sqr_error,
        final_sqr_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn synthetic_problem(noise: f64) -> (PinholeCamera, BundleProblem, Vec<SE3>, Vec<Vector3<f64>>) {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(7);

        let truth_poses: Vec<SE3> = (0..4)
            .map(|i| {
                SE3::from_scaled_axis(
                    Vector3::new(0.0, 0.03 * i as f64, 0.0),
                    Vector3::new(0.25 * i as f64, 0.02 * i as f64, 0.0),
                )
            })
            .collect();
        let truth_points: Vec<Vector3<f64>> = (0..40)
            .map(|_| Vector3::new(rng.gen_range(-1.5..1.5), rng.gen_range(-1.0..1.0), rng.gen_range(3.0..6.0)))
            .collect();

        let mut observations = Vec::new();
        for (pose_index, pose) in truth_poses.iter().enumerate() {
            let camera_t_world = pose.inverse();
            for (point_index, point) in truth_points.iter().enumerate() {
                let image_point = camera.project(&camera_t_world.transform_point(point));
                observations.push(BundleObservation {
                    pose_index,
                    point_index,
                    image_point,
                });
            }
        }

        let mut world_t_cameras = truth_poses.clone();
        for pose in world_t_cameras.iter_mut().skip(1) {
            pose.translation += Vector3::new(noise, -noise, noise * 0.5);
        }
        let points = truth_points
            .iter()
            .map(|p| {
                if noise > 0.0 {
                    p + Vector3::new(rng.gen_range(-noise..noise), rng.gen_range(-noise..noise), rng.gen_range(-noise..noise))
                } else {
                    *p
                }
            })
            .collect();

        let problem = BundleProblem {
            world_t_cameras,
            points,
            observations,
            gravity: None,
        };
        (camera, problem, truth_poses, truth_points)
    }

    #[test]
    fn test_bundle_adjustment_reduces_error() {
        let (camera, mut problem, _, _) = synthetic_problem(0.02);
        let report = SchurBundleAdjuster
            .optimize(&camera, &mut problem, &BundleParams::default())
            .unwrap();

        assert!(report.initial_sqr_error > 1.0);
        assert!(report.final_sqr_error < report.initial_sqr_error * 0.01);
        assert!(report.final_sqr_error < 0.1);
    }

    #[test]
    fn test_fixed_pose_is_unchanged() {
        let (camera, mut problem, truth_poses, _) = synthetic_problem(0.02);
        SchurBundleAdjuster
            .optimize(&camera, &mut problem, &BundleParams::default())
            .unwrap();
        approx::assert_relative_eq!(problem.world_t_cameras[0].to_matrix(), truth_poses[0].to_matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_gravity_count_mismatch_is_rejected() {
        let (camera, mut problem, _, _) = synthetic_problem(0.0);
        problem.gravity = Some(BundleGravity {
            camera_gravities: vec![Vector3::new(0.0, -1.0, 0.0)],
            world_gravity: Vector3::new(0.0, -1.0, 0.0),
            weight: 10.0,
        });
        assert!(SchurBundleAdjuster
            .optimize(&camera, &mut problem, &BundleParams::default())
            .is_none());
    }

    #[test]
    fn test_degenerate_problem() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut problem = BundleProblem::default();
        assert!(SchurBundleAdjuster
            .optimize(&camera, &mut problem, &BundleParams::default())
            .is_none());
    }
}
