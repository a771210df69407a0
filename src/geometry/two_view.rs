//! Relative pose and initial 3D points from two views.
//!
//! The solver first tests whether the motion between the views is explained by a
//! pure rotation. Only if it is not does it estimate an essential matrix and
//! triangulate the correspondences. A rotational result has a null translation and
//! no object points, which callers treat as "cannot initialize yet".

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector2, Vector3};
use rand::RngCore;

use super::camera::{sqr_projection_error, Camera};
use super::gravity::GravityConstraint;
use super::ransac::sample_unique_indices;
use super::triangulation::triangulate_dlt;
use super::SE3;

/// Parameters of the two-view initialization.
#[derive(Debug, Clone, Copy)]
pub struct TwoViewParams {
    /// Maximal squared pixel error for the rotational model.
    pub max_rotational_sqr_error: f64,
    /// Maximal squared pixel error for the general model.
    pub max_arbitrary_sqr_error: f64,
    pub iterations: usize,
    /// Ratio of correspondences the rotational model must explain to be chosen.
    pub rotational_valid_ratio: f64,
    /// Distance between the two camera centers of the result.
    pub baseline: f64,
}

impl Default for TwoViewParams {
    fn default() -> Self {
        Self {
            max_rotational_sqr_error: 1.5 * 1.5,
            max_arbitrary_sqr_error: 3.5 * 3.5,
            iterations: 100,
            rotational_valid_ratio: 0.9,
            baseline: 0.01,
        }
    }
}

/// Gravity measured in both views.
#[derive(Debug, Clone, Copy)]
pub struct TwoViewGravity {
    pub camera_gravity0: Vector3<f64>,
    pub camera_gravity1: Vector3<f64>,
    pub world_gravity: Vector3<f64>,
}

/// Result of the two-view initialization.
#[derive(Debug, Clone)]
pub struct TwoViewResult {
    pub world_t_camera0: SE3,
    pub world_t_camera1: SE3,
    /// Triangulated points, one per entry in `valid_indices`.
    pub object_points: Vec<Vector3<f64>>,
    /// Indices of the correspondences with a valid object point.
    pub valid_indices: Vec<usize>,
}

impl TwoViewResult {
    /// Whether the views are related by a pure rotation.
    pub fn is_rotational(&self) -> bool {
        (self.world_t_camera1.translation - self.world_t_camera0.translation).norm() < 1e-12
    }
}

/// Two-view pose and structure solver.
pub trait TwoViewSolver: Send + Sync {
    fn solve(
        &self,
        camera: &dyn Camera,
        image_points0: &[Vector2<f64>],
        image_points1: &[Vector2<f64>],
        gravity: Option<&TwoViewGravity>,
        rng: &mut dyn RngCore,
        params: &TwoViewParams,
    ) -> Option<TwoViewResult>;
}

/// Rotation RANSAC followed by an 8-point essential matrix RANSAC.
#[derive(Debug, Clone, Copy, Default)]
pub struct EssentialTwoViewSolver;

const ESSENTIAL_SAMPLE_SIZE: usize = 8;

/// Rotation `b_R_a` best aligning unit vectors `a` onto `b` (Kabsch).
fn kabsch(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> Option<Matrix3<f64>> {
    let mut h = Matrix3::zeros();
    for (a, b) in a.iter().zip(b) {
        h += a * b.transpose();
    }
    let svd = h.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let v = v_t.transpose();
    let d = (v * u.transpose()).determinant().signum();
    let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
    Some(v * correction * u.transpose())
}

/// Essential matrix `E` with `x1^T E x0 = 0` from normalized rays.
fn essential_8pt(rays0: &[Vector3<f64>], rays1: &[Vector3<f64>]) -> Option<Matrix3<f64>> {
    let n = rays0.len();
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (i, (x0, x1)) in rays0.iter().zip(rays1).enumerate() {
        for r in 0..3 {
            for c in 0..3 {
                a[(i, r * 3 + c)] = x1[r] * x0[c];
            }
        }
    }
    let ata = a.transpose() * &a;
    let eigen = SymmetricEigen::new(ata);
    let (smallest, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let e = eigen.eigenvectors.column(smallest);
    let essential = Matrix3::from_fn(|r, c| e[r * 3 + c]);

    let svd = essential.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    Some(u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0)) * v_t)
}

/// Sampson distance of a correspondence in normalized coordinates.
fn sampson_sqr_error(essential: &Matrix3<f64>, x0: &Vector3<f64>, x1: &Vector3<f64>) -> f64 {
    let ex0 = essential * x0;
    let etx1 = essential.transpose() * x1;
    let numerator = x1.dot(&ex0);
    let denominator = ex0.x * ex0.x + ex0.y * ex0.y + etx1.x * etx1.x + etx1.y * etx1.y;
    if denominator < 1e-18 {
        return f64::INFINITY;
    }
    numerator * numerator / denominator
}

/// The four `camera1_t_camera0` candidates of an essential matrix (unit translation).
fn decompose_essential(essential: &Matrix3<f64>) -> Option<[SE3; 4]> {
    let svd = essential.svd(true, true);
    let (mut u, mut v_t) = (svd.u?, svd.v_t?);
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t: Vector3<f64> = u.column(2).into_owned();
    Some([
        SE3::from_rt(r1, t),
        SE3::from_rt(r1, -t),
        SE3::from_rt(r2, t),
        SE3::from_rt(r2, -t),
    ])
}

impl EssentialTwoViewSolver {
    fn rotational_inliers(
        camera: &dyn Camera,
        camera1_r_camera0: &Matrix3<f64>,
        rays0: &[Vector3<f64>],
        image_points1: &[Vector2<f64>],
        max_sqr_error: f64,
    ) -> usize {
        rays0
            .iter()
            .zip(image_points1)
            .filter(|(ray, image_point)| {
                let rotated = camera1_r_camera0 * *ray;
                rotated.z > 0.0 && (camera.project(&rotated) - *image_point).norm_squared() <= max_sqr_error
            })
            .count()
    }

    /// Triangulate all correspondences for one motion candidate; returns indices and points.
    fn triangulate_candidate(
        camera: &dyn Camera,
        camera1_t_camera0: &SE3,
        image_points0: &[Vector2<f64>],
        image_points1: &[Vector2<f64>],
        max_sqr_error: f64,
    ) -> (Vec<usize>, Vec<Vector3<f64>>) {
        let poses = [SE3::identity(), *camera1_t_camera0];
        let mut indices = Vec::new();
        let mut points = Vec::new();
        for (i, (p0, p1)) in image_points0.iter().zip(image_points1).enumerate() {
            let Some(point) = triangulate_dlt(camera, &poses, &[*p0, *p1]) else {
                continue;
            };
            let e0 = sqr_projection_error(camera, &poses[0], &point, p0);
            let e1 = sqr_projection_error(camera, &poses[1], &point, p1);
            if e0 <= max_sqr_error && e1 <= max_sqr_error {
                indices.push(i);
                points.push(point);
            }
        }
        (indices, points)
    }
}

impl TwoViewSolver for EssentialTwoViewSolver {
    fn solve(
        &self,
        camera: &dyn Camera,
        image_points0: &[Vector2<f64>],
        image_points1: &[Vector2<f64>],
        gravity: Option<&TwoViewGravity>,
        rng: &mut dyn RngCore,
        params: &TwoViewParams,
    ) -> Option<TwoViewResult> {
        let n = image_points0.len();
        if n < ESSENTIAL_SAMPLE_SIZE || n != image_points1.len() {
            return None;
        }

        let rays0: Vec<Vector3<f64>> = image_points0.iter().map(|p| camera.unproject(p)).collect();
        let rays1: Vec<Vector3<f64>> = image_points1.iter().map(|p| camera.unproject(p)).collect();

        let world_t_camera0 = match gravity {
            Some(g) => {
                let constraint = GravityConstraint::new(g.camera_gravity0, g.world_gravity, 1.0, std::f64::consts::PI);
                SE3::new(constraint.world_r_camera(), Vector3::zeros())
            }
            None => SE3::identity(),
        };

        // Step 1: pure rotation
        let unit0: Vec<Vector3<f64>> = rays0.iter().map(|r| r.normalize()).collect();
        let unit1: Vec<Vector3<f64>> = rays1.iter().map(|r| r.normalize()).collect();
        let mut best_rotation = None;
        let mut best_rotational_inliers = 0;
        for _ in 0..params.iterations.max(1) {
            let sample = sample_unique_indices(rng, n, 2);
            let a = [unit0[sample[0]], unit0[sample[1]]];
            let b = [unit1[sample[0]], unit1[sample[1]]];
            let Some(rotation) = kabsch(&a, &b) else { continue };
            let inliers =
                Self::rotational_inliers(camera, &rotation, &rays0, image_points1, params.max_rotational_sqr_error);
            if inliers > best_rotational_inliers {
                best_rotational_inliers = inliers;
                best_rotation = Some(rotation);
            }
        }

        if let Some(rotation) = best_rotation {
            if best_rotational_inliers as f64 >= n as f64 * params.rotational_valid_ratio {
                let camera1_t_camera0 = SE3::from_rt(rotation, Vector3::zeros());
                return Some(TwoViewResult {
                    world_t_camera0,
                    world_t_camera1: world_t_camera0 * camera1_t_camera0.inverse(),
                    object_points: Vec::new(),
                    valid_indices: Vec::new(),
                });
            }
        }

        // Step 2: general motion
        let focal = camera.projection_jacobian(&Vector3::z())[(0, 0)];
        let max_normalized_sqr = params.max_arbitrary_sqr_error / (focal * focal);

        let mut best_essential = None;
        let mut best_inliers: Vec<usize> = Vec::new();
        for _ in 0..params.iterations.max(1) {
            let sample = sample_unique_indices(rng, n, ESSENTIAL_SAMPLE_SIZE);
            let s0: Vec<Vector3<f64>> = sample.iter().map(|&i| rays0[i]).collect();
            let s1: Vec<Vector3<f64>> = sample.iter().map(|&i| rays1[i]).collect();
            let Some(essential) = essential_8pt(&s0, &s1) else { continue };

            let inliers: Vec<usize> = (0..n)
                .filter(|&i| sampson_sqr_error(&essential, &rays0[i], &rays1[i]) <= max_normalized_sqr)
                .collect();
            if inliers.len() > best_inliers.len() {
                best_inliers = inliers;
                best_essential = Some(essential);
            }
        }
        let mut essential = best_essential?;
        if best_inliers.len() >= ESSENTIAL_SAMPLE_SIZE {
            let s0: Vec<Vector3<f64>> = best_inliers.iter().map(|&i| rays0[i]).collect();
            let s1: Vec<Vector3<f64>> = best_inliers.iter().map(|&i| rays1[i]).collect();
            if let Some(refit) = essential_8pt(&s0, &s1) {
                essential = refit;
            }
        }

        // Step 3: cheirality decides among the four decompositions
        let mut best: Option<(SE3, Vec<usize>, Vec<Vector3<f64>>)> = None;
        for candidate in decompose_essential(&essential)? {
            let (indices, points) = Self::triangulate_candidate(
                camera,
                &candidate,
                image_points0,
                image_points1,
                params.max_arbitrary_sqr_error,
            );
            if best.as_ref().map_or(true, |(_, b, _)| indices.len() > b.len()) {
                best = Some((candidate, indices, points));
            }
        }
        let (camera1_t_camera0, valid_indices, points) = best?;
        if valid_indices.len() < ESSENTIAL_SAMPLE_SIZE {
            return None;
        }

        // Step 4: scale to the requested baseline and move into the world frame
        let scaled = SE3::new(camera1_t_camera0.rotation, camera1_t_camera0.translation * params.baseline);
        let world_t_camera1 = world_t_camera0 * scaled.inverse();
        let object_points = points
            .iter()
            .map(|p| world_t_camera0.transform_point(&(p * params.baseline)))
            .collect();

        Some(TwoViewResult {
            world_t_camera0,
            world_t_camera1,
            object_points,
            valid_indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn correspondences(world_t_camera1: &SE3) -> (PinholeCamera, Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut rng = StdRng::seed_from_u64(21);
        let camera1_t_world = world_t_camera1.inverse();
        let mut p0 = Vec::new();
        let mut p1 = Vec::new();
        for _ in 0..80 {
            let x = Vector3::new(rng.gen_range(-2.0..2.0), rng.gen_range(-1.5..1.5), rng.gen_range(4.0..8.0));
            p0.push(camera.project(&x));
            p1.push(camera.project(&camera1_t_world.transform_point(&x)));
        }
        (camera, p0, p1)
    }

    #[test]
    fn test_rotational_motion() {
        let world_t_camera1 = SE3::from_scaled_axis(Vector3::new(0.0, 0.05, 0.01), Vector3::zeros());
        let (camera, p0, p1) = correspondences(&world_t_camera1);
        let mut rng = StdRng::seed_from_u64(1);

        let result = EssentialTwoViewSolver
            .solve(&camera, &p0, &p1, None, &mut rng, &TwoViewParams::default())
            .unwrap();

        assert!(result.is_rotational());
        assert!(result.object_points.is_empty());
        assert!(result.world_t_camera1.rotation.angle_to(&world_t_camera1.rotation) < 1e-3);
    }

    #[test]
    fn test_translational_motion() {
        let world_t_camera1 = SE3::from_scaled_axis(Vector3::new(0.0, -0.02, 0.0), Vector3::new(0.5, 0.05, 0.0));
        let (camera, p0, p1) = correspondences(&world_t_camera1);
        let mut rng = StdRng::seed_from_u64(1);
        let params = TwoViewParams::default();

        let result = EssentialTwoViewSolver
            .solve(&camera, &p0, &p1, None, &mut rng, &params)
            .unwrap();

        assert!(!result.is_rotational());
        assert_eq!(result.valid_indices.len(), 80);
        assert_relative_eq!(result.world_t_camera1.translation.norm(), params.baseline, epsilon = 1e-9);
        let direction = result.world_t_camera1.translation.normalize();
        assert_relative_eq!(direction, world_t_camera1.translation.normalize(), epsilon = 1e-4);

        // every triangulated point reprojects into both views
        let camera1_t_world = result.world_t_camera1.inverse();
        for (point, &index) in result.object_points.iter().zip(&result.valid_indices) {
            assert!((camera.project(point) - p0[index]).norm() < 1e-3);
            assert!((camera.project(&camera1_t_world.transform_point(point)) - p1[index]).norm() < 1e-3);
        }
    }

    #[test]
    fn test_gravity_aligned_first_camera() {
        let world_t_camera1 = SE3::from_scaled_axis(Vector3::zeros(), Vector3::new(0.4, 0.0, 0.0));
        let (camera, p0, p1) = correspondences(&world_t_camera1);
        let gravity = TwoViewGravity {
            camera_gravity0: Vector3::new(0.1, 0.99, 0.0).normalize(),
            camera_gravity1: Vector3::new(0.1, 0.99, 0.0).normalize(),
            world_gravity: Vector3::new(0.0, -1.0, 0.0),
        };
        let mut rng = StdRng::seed_from_u64(2);

        let result = EssentialTwoViewSolver
            .solve(&camera, &p0, &p1, Some(&gravity), &mut rng, &TwoViewParams::default())
            .unwrap();

        let predicted = result.world_t_camera0.rotation * gravity.camera_gravity0;
        assert_relative_eq!(predicted, gravity.world_gravity, epsilon = 1e-9);
    }
}
