//! Camera projection model.
//!
//! The tracker only needs a small capability set from a camera: project a point
//! given in camera coordinates, back-project a pixel to a viewing ray, the
//! Jacobian of the projection, and a validity check.

use nalgebra::{Matrix2x3, Vector2, Vector3};

use super::SE3;

/// Minimal depth for a point to count as "in front of" a camera.
pub const MIN_DEPTH: f64 = 1e-6;

/// A camera projection model (camera looks along +z).
pub trait Camera: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Project a point given in camera coordinates (z > 0) into the image.
    fn project(&self, camera_point: &Vector3<f64>) -> Vector2<f64>;

    /// Viewing ray through an image point, scaled so that z == 1.
    fn unproject(&self, image_point: &Vector2<f64>) -> Vector3<f64>;

    /// Jacobian of `project` with respect to the camera-frame point.
    fn projection_jacobian(&self, camera_point: &Vector3<f64>) -> Matrix2x3<f64>;

    /// Whether the model parameters are usable.
    fn is_valid(&self) -> bool;

    /// Whether an image point lies inside the image area.
    fn is_inside(&self, image_point: &Vector2<f64>) -> bool {
        image_point.x >= 0.0
            && image_point.y >= 0.0
            && image_point.x < self.width() as f64
            && image_point.y < self.height() as f64
    }
}

/// Pinhole camera without distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeCamera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl PinholeCamera {
    pub fn new(width: u32, height: u32, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { width, height, fx, fy, cx, cy }
    }

    /// Camera with the principal point in the image center and a horizontal field of view in radians.
    pub fn with_fov(width: u32, height: u32, fov_x: f64) -> Self {
        let fx = width as f64 * 0.5 / (fov_x * 0.5).tan();
        Self::new(width, height, fx, fx, width as f64 * 0.5, height as f64 * 0.5)
    }
}

impl Camera for PinholeCamera {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn project(&self, camera_point: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / camera_point.z;
        Vector2::new(
            self.fx * camera_point.x * inv_z + self.cx,
            self.fy * camera_point.y * inv_z + self.cy,
        )
    }

    #[inline]
    fn unproject(&self, image_point: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (image_point.x - self.cx) / self.fx,
            (image_point.y - self.cy) / self.fy,
            1.0,
        )
    }

    fn projection_jacobian(&self, camera_point: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / camera_point.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z, 0.0, -self.fx * camera_point.x * inv_z2,
            0.0, self.fy * inv_z, -self.fy * camera_point.y * inv_z2,
        )
    }

    fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.fx > 0.0
            && self.fy > 0.0
            && self.fx.is_finite()
            && self.fy.is_finite()
    }
}

/// Whether a world point lies in front of the camera with pose `camera_t_world` (T_cw).
#[inline]
pub fn is_in_front(camera_t_world: &SE3, world_point: &Vector3<f64>) -> bool {
    camera_t_world.transform_point(world_point).z > MIN_DEPTH
}

/// Project a world point; `None` if the point is behind the camera.
#[inline]
pub fn project_world(
    camera: &dyn Camera,
    camera_t_world: &SE3,
    world_point: &Vector3<f64>,
) -> Option<Vector2<f64>> {
    let p_cam = camera_t_world.transform_point(world_point);
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    Some(camera.project(&p_cam))
}

/// Squared reprojection error of a world point, infinite if the point is behind the camera.
#[inline]
pub fn sqr_projection_error(
    camera: &dyn Camera,
    camera_t_world: &SE3,
    world_point: &Vector3<f64>,
    image_point: &Vector2<f64>,
) -> f64 {
    match project_world(camera, camera_t_world, world_point) {
        Some(projected) => (projected - image_point).norm_squared(),
        None => f64::INFINITY,
    }
}
