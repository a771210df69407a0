//! PnP (Perspective-n-Point) pose solver using OpenCV.

use anyhow::Result;
use nalgebra::{Matrix3, Vector2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Point3d};
use opencv::prelude::*;
use rand::RngCore;

use super::camera::Camera;
use super::pose_solver::{pose_inliers, DltPoseSolver, PoseEstimate, PoseParams, PoseSolver};
use crate::geometry::SE3;

/// [`PoseSolver`] backed by `solvePnPRansac`; refinement uses the native LM.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCvPoseSolver;

/// Pinhole intrinsics of a camera, read from its projection at the optical axis.
fn camera_matrix(camera: &dyn Camera) -> Result<Mat> {
    let axis = Vector3::z();
    let center = camera.project(&axis);
    let jacobian = camera.projection_jacobian(&axis);
    Ok(Mat::from_slice_2d(&[
        [jacobian[(0, 0)], 0.0, center.x],
        [0.0, jacobian[(1, 1)], center.y],
        [0.0, 0.0, 1.0],
    ])?
    .try_clone()?)
}

/// Run OpenCV's RANSAC PnP and return the pose as T_cw.
fn solve_pnp_ransac(
    camera: &dyn Camera,
    object_points: &[Vector3<f64>],
    image_points: &[Vector2<f64>],
    params: &PoseParams,
) -> Result<SE3> {
    let pts3d: Vec<Point3d> = object_points
        .iter()
        .map(|p| Point3d::new(p.x, p.y, p.z))
        .collect();
    let pts2d: Vec<Point2f> = image_points
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect();
    let obj_points = Mat::from_slice(&pts3d)?.try_clone()?;
    let img_points = Mat::from_slice(&pts2d)?.try_clone()?;

    let camera_matrix = camera_matrix(camera)?;
    let dist_coeffs = Mat::zeros(1, 5, opencv::core::CV_64F)?.to_mat()?;

    let mut rvec = Mat::default();
    let mut tvec = Mat::default();
    let mut inliers = Mat::default();
    calib3d::solve_pnp_ransac(
        &obj_points,
        &img_points,
        &camera_matrix,
        &dist_coeffs,
        &mut rvec,
        &mut tvec,
        false,
        params.iterations as i32,
        params.max_sqr_error.sqrt() as f32,
        0.99,
        &mut inliers,
        calib3d::SOLVEPNP_ITERATIVE,
    )?;

    let mut rot_mat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rot_mat, &mut opencv::core::no_array())?;
    let rotation = mat3_to_matrix3(&rot_mat)?;
    let translation = Vector3::new(
        *tvec.at::<f64>(0i32)?,
        *tvec.at::<f64>(1i32)?,
        *tvec.at::<f64>(2i32)?,
    );

    // OpenCV returns T_cw
    Ok(SE3::from_rt(rotation, translation))
}

/// Convert OpenCV 3x3 Mat to nalgebra Matrix3.
fn mat3_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut arr = [0.0f64; 9];
    for (i, value) in arr.iter_mut().enumerate() {
        *value = *mat.at::<f64>(i as i32)?;
    }
    Ok(Matrix3::from_row_slice(&arr))
}

impl PoseSolver for OpenCvPoseSolver {
    fn ransac_pose(
        &self,
        camera: &dyn Camera,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        _rng: &mut dyn RngCore,
        params: &PoseParams,
    ) -> Option<PoseEstimate> {
        if object_points.len() < params.minimal_valid.max(4) || object_points.len() != image_points.len() {
            return None;
        }
        let camera_t_world = match solve_pnp_ransac(camera, object_points, image_points, params) {
            Ok(pose) => pose,
            Err(e) => {
                tracing::warn!("[PnP] solvePnPRansac failed: {}", e);
                return None;
            }
        };
        let (inliers, _) = pose_inliers(camera, &camera_t_world, object_points, image_points, params.max_sqr_error);
        if inliers.len() < params.minimal_valid {
            return None;
        }
        let object_inliers: Vec<Vector3<f64>> = inliers.iter().map(|&i| object_points[i]).collect();
        let image_inliers: Vec<Vector2<f64>> = inliers.iter().map(|&i| image_points[i]).collect();
        let refined = DltPoseSolver.refine_pose(
            camera,
            &camera_t_world.inverse(),
            &object_inliers,
            &image_inliers,
            &PoseParams {
                iterations: 20,
                ..*params
            },
        )?;
        let (inliers, sqr_error) = pose_inliers(
            camera,
            &refined.world_t_camera.inverse(),
            object_points,
            image_points,
            params.max_sqr_error,
        );
        (inliers.len() >= params.minimal_valid).then_some(PoseEstimate {
            world_t_camera: refined.world_t_camera,
            inliers,
            sqr_error,
        })
    }

    fn refine_pose(
        &self,
        camera: &dyn Camera,
        world_t_camera: &SE3,
        object_points: &[Vector3<f64>],
        image_points: &[Vector2<f64>],
        params: &PoseParams,
    ) -> Option<PoseEstimate> {
        DltPoseSolver.refine_pose(camera, world_t_camera, object_points, image_points, params)
    }
}
