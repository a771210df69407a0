//! Gravity soft constraint for pose estimation and bundle adjustment.

use nalgebra::{UnitQuaternion, Vector3};

use super::SE3;

/// Soft constraint aligning a camera's measured gravity with the world gravity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GravityConstraint {
    /// Unit gravity vector measured in the camera frame.
    pub camera_gravity: Vector3<f64>,
    /// Unit gravity vector of the world frame.
    pub world_gravity: Vector3<f64>,
    /// Weight of the 3-vector alignment residual relative to pixel residuals.
    pub weight: f64,
    /// Maximal allowed angle (radians) between measured and estimated gravity.
    pub max_angle: f64,
}

impl GravityConstraint {
    pub fn new(camera_gravity: Vector3<f64>, world_gravity: Vector3<f64>, weight: f64, max_angle: f64) -> Self {
        Self {
            camera_gravity,
            world_gravity,
            weight,
            max_angle,
        }
    }

    /// World gravity expressed in the camera frame of `camera_t_world`.
    pub fn predicted(&self, camera_t_world: &SE3) -> Vector3<f64> {
        camera_t_world.rotation * self.world_gravity
    }

    /// Weighted residual `weight * (measured - predicted)`.
    pub fn residual(&self, camera_t_world: &SE3) -> Vector3<f64> {
        (self.camera_gravity - self.predicted(camera_t_world)) * self.weight
    }

    /// Angle between measured and predicted gravity, in radians.
    pub fn alignment_angle(&self, camera_t_world: &SE3) -> f64 {
        self.camera_gravity.angle(&self.predicted(camera_t_world))
    }

    pub fn is_satisfied(&self, camera_t_world: &SE3) -> bool {
        self.alignment_angle(camera_t_world) <= self.max_angle
    }

    /// Rotation taking the camera's measured gravity onto the world gravity.
    ///
    /// Used to orient a freshly bootstrapped map so that its first camera agrees
    /// with gravity.
    pub fn world_r_camera(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::rotation_between(&self.camera_gravity, &self.world_gravity)
            .unwrap_or_else(|| {
                // anti-parallel vectors: any half turn about an orthogonal axis works
                let axis = self.camera_gravity.cross(&Vector3::x());
                let axis = if axis.norm() < 1e-6 {
                    self.camera_gravity.cross(&Vector3::y())
                } else {
                    axis
                };
                UnitQuaternion::from_scaled_axis(axis.normalize() * std::f64::consts::PI)
            })
    }
}
