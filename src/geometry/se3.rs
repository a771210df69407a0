//! Rigid-body transforms.
//!
//! Naming follows `a_t_b`: the transform mapping points expressed in frame `b`
//! into frame `a`. Camera poses are stored as `world_t_camera` (T_wc); the
//! projection path uses the inverse `camera_t_world` (T_cw).

use nalgebra::{Matrix3, Matrix4, Unit, UnitQuaternion, Vector3, Vector6};

/// A rigid transform in 3D (rotation followed by translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    /// Build from a (not necessarily perfectly orthonormal) rotation matrix and translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_matrix(&rotation);
        Self { rotation, translation }
    }

    /// Build from an axis-angle (scaled axis) rotation and translation.
    pub fn from_scaled_axis(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(axis_angle),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// `self * other`, i.e. apply `other` first.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Apply a left perturbation `exp(delta) * self` with `delta = [omega, v]`.
    ///
    /// This is the update matching the g2o-style projection Jacobians used by the
    /// optimizers (rotation block first, translation block second).
    pub fn left_perturbed(&self, delta: &Vector6<f64>) -> SE3 {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let v = Vector3::new(delta[3], delta[4], delta[5]);
        let d_rot = exp_so3(&omega);
        SE3 {
            rotation: d_rot * self.rotation,
            translation: d_rot * self.translation + v,
        }
    }

    /// Rotation angle of the transform, in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

/// Exponential map of SO(3).
pub fn exp_so3(omega: &Vector3<f64>) -> UnitQuaternion<f64> {
    let angle = omega.norm();
    if angle < 1e-12 {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(*omega), angle)
    }
}

/// Skew-symmetric matrix `[v]x` such that `[v]x u = v x u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_pose() -> SE3 {
        SE3::from_scaled_axis(Vector3::new(0.1, -0.2, 0.3), Vector3::new(1.0, 2.0, -0.5))
    }

    #[test]
    fn test_inverse_roundtrip() {
        let pose = test_pose();
        let p = Vector3::new(0.3, -1.0, 4.0);
        let back = pose.inverse().transform_point(&pose.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = test_pose();
        let b = SE3::from_scaled_axis(Vector3::new(-0.3, 0.0, 0.1), Vector3::new(0.0, 1.0, 0.0));
        let composed = (a * b).to_matrix();
        let expected = a.to_matrix() * b.to_matrix();
        assert_relative_eq!(composed, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_left_perturbation_zero_is_identity() {
        let pose = test_pose();
        let same = pose.left_perturbed(&Vector6::zeros());
        assert_relative_eq!(same.to_matrix(), pose.to_matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_left_perturbation_translation() {
        let pose = SE3::identity();
        let moved = pose.left_perturbed(&Vector6::new(0.0, 0.0, 0.0, 1.0, 2.0, 3.0));
        assert_relative_eq!(moved.translation, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-0.5, 0.1, 2.0);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-12);
    }
}
