//! LocalizedPoint - a map point with a known 3D position.
//!
//! Besides the position, a localized point keeps every 2D observation (frame
//! index to image point), a precision tag derived from its observation geometry,
//! and a small set of binary descriptors used for relocalization and
//! re-identification after occlusion.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, SymmetricEigen, Vector2, Vector3};

use super::descriptor::Descriptor;
use super::point_track::PointTrack;
use super::poses::CameraPoses;
use super::types::{FrameIndex, LocalizationPrecision};
use crate::geometry::camera::Camera;
use crate::geometry::ransac::median;
use crate::geometry::SE3;
use crate::optimizer::point_refinement::average_sqr_error;

/// Point observed by at most this many posed frames is only `Low` precision.
pub const LOW_PRECISION_MAX_POSES: usize = 5;

/// Ratio (squared) of the two largest covariance axes for `High` precision, ~20-30 degrees.
pub const HIGH_PRECISION_SQR_AXIS_RATIO: f64 = 7.0 * 7.0;

/// Ratio (squared) of the two largest covariance axes for `Medium` precision, ~10-15 degrees.
pub const MEDIUM_PRECISION_SQR_AXIS_RATIO: f64 = 14.0 * 14.0;

/// A point does not collect descriptors beyond this count.
pub const MAX_DESCRIPTORS: usize = 10;

/// Frames to wait after the first descriptor; doubled with every further descriptor.
pub const DESCRIPTOR_INTERVAL: FrameIndex = 30;

/// A 3D map point.
#[derive(Debug, Clone)]
pub struct LocalizedPoint {
    pub position: Vector3<f64>,
    observations: BTreeMap<FrameIndex, Vector2<f64>>,
    pub precision: LocalizationPrecision,
    descriptors: Vec<Descriptor>,
    last_descriptor_frame: Option<FrameIndex>,
    /// Whether the position is the result of a bundle adjustment.
    pub bundle_adjusted: bool,
}

impl LocalizedPoint {
    /// Create a localized point from a track, keeping all of its observations.
    pub fn from_track(
        track: &PointTrack,
        position: Vector3<f64>,
        precision: LocalizationPrecision,
        bundle_adjusted: bool,
    ) -> Self {
        Self {
            position,
            observations: track.iter().collect(),
            precision,
            descriptors: Vec::new(),
            last_descriptor_frame: None,
            bundle_adjusted,
        }
    }

    /// Number of observations.
    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn first_observation_frame(&self) -> Option<FrameIndex> {
        self.observations.keys().next().copied()
    }

    pub fn last_observation_frame(&self) -> Option<FrameIndex> {
        self.observations.keys().next_back().copied()
    }

    pub fn observation(&self, frame: FrameIndex) -> Option<Vector2<f64>> {
        self.observations.get(&frame).copied()
    }

    pub fn is_observed_at(&self, frame: FrameIndex) -> bool {
        self.observations.contains_key(&frame)
    }

    /// All observations in increasing frame order.
    pub fn observations(&self) -> impl DoubleEndedIterator<Item = (FrameIndex, Vector2<f64>)> + '_ {
        self.observations.iter().map(|(f, p)| (*f, *p))
    }

    /// Append an observation; frames must be strictly increasing.
    pub fn add_observation(&mut self, frame: FrameIndex, image_point: Vector2<f64>) -> bool {
        if let Some(last) = self.last_observation_frame() {
            debug_assert!(frame > last, "observation {} not after {}", frame, last);
            if frame <= last {
                return false;
            }
        }
        self.observations.insert(frame, image_point);
        true
    }

    /// Append all observations of a track seen strictly after this point's last observation.
    ///
    /// Returns false without modification if the observation windows overlap.
    pub fn merge_track(&mut self, track: &PointTrack) -> bool {
        if let Some(last) = self.last_observation_frame() {
            if track.first_frame() <= last {
                return false;
            }
        }
        self.observations.extend(track.iter());
        true
    }

    /// Drop all observations after `frame`.
    pub fn truncate_after(&mut self, frame: FrameIndex) {
        self.observations.retain(|f, _| *f <= frame);
    }

    /// Contiguous observations ending at the last observation, oldest first.
    pub fn contiguous_tail(&self) -> Vec<(FrameIndex, Vector2<f64>)> {
        let mut tail: Vec<(FrameIndex, Vector2<f64>)> = Vec::new();
        for (frame, point) in self.observations().rev() {
            if let Some((previous, _)) = tail.last() {
                if frame + 1 != *previous {
                    break;
                }
            }
            tail.push((frame, point));
        }
        tail.reverse();
        tail
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn has_descriptors(&self) -> bool {
        !self.descriptors.is_empty()
    }

    /// Whether a new descriptor should be extracted at `frame`.
    ///
    /// The first descriptor is taken immediately, further ones with an interval
    /// doubling each time, until [`MAX_DESCRIPTORS`] are collected.
    pub fn need_descriptor(&self, frame: FrameIndex) -> bool {
        let count = self.descriptors.len();
        if count == 0 {
            return true;
        }
        if count >= MAX_DESCRIPTORS {
            return false;
        }
        let Some(last) = self.last_descriptor_frame else {
            return true;
        };
        let interval = DESCRIPTOR_INTERVAL.saturating_mul(1 << (count - 1));
        frame >= last.saturating_add(interval)
    }

    pub fn add_descriptor(&mut self, frame: FrameIndex, descriptor: Descriptor) {
        debug_assert!(self.last_descriptor_frame.map_or(true, |last| last < frame));
        self.descriptors.push(descriptor);
        self.last_descriptor_frame = Some(frame);
    }

    /// Camera poses (T_cw) and image points of all observations with a pose.
    pub fn posed_observations(&self, poses: &CameraPoses) -> (Vec<SE3>, Vec<Vector2<f64>>) {
        let mut camera_t_worlds = Vec::new();
        let mut image_points = Vec::new();
        for (frame, image_point) in self.observations() {
            if let Some(pose) = poses.get(frame) {
                camera_t_worlds.push(pose.camera_t_world());
                image_points.push(image_point);
            }
        }
        (camera_t_worlds, image_points)
    }

    /// Average squared reprojection error over all posed observations.
    pub fn sqr_projection_error(&self, camera: &dyn Camera, poses: &CameraPoses) -> f64 {
        let (camera_t_worlds, image_points) = self.posed_observations(poses);
        average_sqr_error(camera, &camera_t_worlds, &image_points, &self.position)
    }

    /// Re-derive the precision from the observation geometry; `High` is never lowered.
    ///
    /// Returns whether the precision changed.
    pub fn update_uncertainty(&mut self, camera: &dyn Camera, poses: &CameraPoses) -> bool {
        if self.precision >= LocalizationPrecision::High {
            return false;
        }
        let (camera_t_worlds, _) = self.posed_observations(poses);
        let precision = if camera_t_worlds.len() <= 1 {
            LocalizationPrecision::Unknown
        } else {
            determine_uncertainty(camera, &camera_t_worlds, &self.position)
        };
        let changed = precision != self.precision;
        self.precision = precision;
        changed
    }

    /// Median angle between the viewing rays and their mean direction, in radians.
    pub fn median_viewing_angle(&self, poses: &CameraPoses) -> f64 {
        let centers: Vec<Vector3<f64>> = self
            .observations()
            .filter_map(|(frame, _)| poses.get(frame).map(|pose| pose.center()))
            .collect();
        median_viewing_angle(&self.position, &centers)
    }
}

/// Median angle between rays from `position` to the camera centers and their mean ray.
pub fn median_viewing_angle(position: &Vector3<f64>, camera_centers: &[Vector3<f64>]) -> f64 {
    let rays: Vec<Vector3<f64>> = camera_centers
        .iter()
        .filter_map(|center| (center - position).try_normalize(1e-12))
        .collect();
    if rays.len() < 2 {
        return 0.0;
    }
    let Some(mean) = rays.iter().sum::<Vector3<f64>>().try_normalize(1e-12) else {
        return 0.0;
    };
    let angles: Vec<f64> = rays.iter().map(|ray| mean.angle(ray)).collect();
    median(&angles).unwrap_or(0.0)
}

/// Precision of a point from the shape of its position covariance.
///
/// # Arguments
/// * `camera_t_worlds` - Poses (T_cw) of the frames observing the point
pub fn determine_uncertainty(
    camera: &dyn Camera,
    camera_t_worlds: &[SE3],
    position: &Vector3<f64>,
) -> LocalizationPrecision {
    if camera_t_worlds.len() < 2 {
        return LocalizationPrecision::Invalid;
    }
    if camera_t_worlds.len() <= LOW_PRECISION_MAX_POSES {
        return LocalizationPrecision::Low;
    }

    // information matrix sum(J^T J) of the point Jacobians
    let mut information = Matrix3::<f64>::zeros();
    for pose in camera_t_worlds {
        let p_cam = pose.transform_point(position);
        if p_cam.z <= f64::EPSILON {
            continue;
        }
        let j = camera.projection_jacobian(&p_cam) * pose.rotation_matrix();
        information += j.transpose() * j;
    }

    let max_abs = information.amax();
    if max_abs > f64::EPSILON {
        information /= max_abs;
    }

    let Some(covariance) = information.try_inverse() else {
        return LocalizationPrecision::Unknown;
    };
    precision_from_covariance(&covariance)
}

/// Classify a 3x3 covariance by the ratio of its two largest eigenvalues.
pub fn precision_from_covariance(covariance: &Matrix3<f64>) -> LocalizationPrecision {
    let mut eigenvalues: Vec<f64> = SymmetricEigen::new(*covariance).eigenvalues.iter().copied().collect();
    eigenvalues.sort_by(|a, b| b.total_cmp(a));

    if eigenvalues[2] <= f64::EPSILON || eigenvalues[1] <= f64::EPSILON {
        return LocalizationPrecision::Unknown;
    }

    let sqr_ratio = eigenvalues[0] / eigenvalues[1];
    if sqr_ratio <= HIGH_PRECISION_SQR_AXIS_RATIO {
        LocalizationPrecision::High
    } else if sqr_ratio <= MEDIUM_PRECISION_SQR_AXIS_RATIO {
        LocalizationPrecision::Medium
    } else {
        LocalizationPrecision::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::camera::PinholeCamera;
    use crate::map::camera_pose::CameraPose;
    use crate::map::types::{MapVersion, MotionType, PoseQuality};
    use approx::assert_relative_eq;

    fn track(first: FrameIndex, len: usize) -> PointTrack {
        let mut track = PointTrack::new(first, Vector2::new(10.0, 10.0));
        for i in 1..len {
            track.add_observation(first + i as FrameIndex, Vector2::new(10.0 + i as f64, 10.0));
        }
        track
    }

    #[test]
    fn test_observations_from_track() {
        let point = LocalizedPoint::from_track(&track(3, 4), Vector3::zeros(), LocalizationPrecision::Low, false);
        assert_eq!(point.num_observations(), 4);
        assert_eq!(point.first_observation_frame(), Some(3));
        assert_eq!(point.last_observation_frame(), Some(6));
        assert!(point.is_observed_at(5));
    }

    #[test]
    fn test_merge_rejects_overlap() {
        let mut point = LocalizedPoint::from_track(&track(0, 10), Vector3::zeros(), LocalizationPrecision::Low, false);
        assert!(!point.merge_track(&track(9, 5)));
        assert_eq!(point.num_observations(), 10);

        assert!(point.merge_track(&track(20, 5)));
        assert_eq!(point.num_observations(), 15);
        assert_eq!(point.last_observation_frame(), Some(24));
    }

    #[test]
    fn test_contiguous_tail() {
        let mut point = LocalizedPoint::from_track(&track(0, 3), Vector3::zeros(), LocalizationPrecision::Low, false);
        point.merge_track(&track(10, 4));
        let frames: Vec<FrameIndex> = point.contiguous_tail().iter().map(|(f, _)| *f).collect();
        assert_eq!(frames, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_descriptor_schedule() {
        let mut point = LocalizedPoint::from_track(&track(0, 2), Vector3::zeros(), LocalizationPrecision::Medium, true);
        assert!(point.need_descriptor(1));
        point.add_descriptor(1, Descriptor([1, 0, 0, 0]));

        // second descriptor after 30 frames, third after another 60
        assert!(!point.need_descriptor(30));
        assert!(point.need_descriptor(31));
        point.add_descriptor(31, Descriptor([2, 0, 0, 0]));
        assert!(!point.need_descriptor(90));
        assert!(point.need_descriptor(91));

        for i in 0..8 {
            point.add_descriptor(100 + i, Descriptor([i as u64, 1, 0, 0]));
        }
        assert_eq!(point.descriptors().len(), MAX_DESCRIPTORS);
        assert!(!point.need_descriptor(u32::MAX));
    }

    #[test]
    fn test_median_viewing_angle() {
        let position = Vector3::new(0.0, 0.0, 10.0);
        let centers = [Vector3::new(-0.5, 0.0, 0.0), Vector3::new(0.5, 0.0, 0.0)];
        let expected = (0.5f64 / 10.0).atan();
        assert_relative_eq!(median_viewing_angle(&position, &centers), expected, epsilon = 1e-9);
        assert_eq!(median_viewing_angle(&position, &centers[..1]), 0.0);
    }

    #[test]
    fn test_uncertainty_levels() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let position = Vector3::new(0.0, 0.0, 4.0);

        let poses = |spread: f64, count: usize| -> Vec<SE3> {
            (0..count)
                .map(|i| {
                    let x = spread * (i as f64 / (count - 1) as f64 - 0.5);
                    SE3::from_scaled_axis(Vector3::zeros(), Vector3::new(x, 0.0, 0.0)).inverse()
                })
                .collect()
        };

        assert_eq!(determine_uncertainty(&camera, &poses(1.0, 1), &position), LocalizationPrecision::Invalid);
        assert_eq!(determine_uncertainty(&camera, &poses(1.0, 4), &position), LocalizationPrecision::Low);
        // wide baseline constrains depth well
        assert_eq!(determine_uncertainty(&camera, &poses(8.0, 10), &position), LocalizationPrecision::High);
        // tiny baseline leaves depth uncertain
        assert_eq!(determine_uncertainty(&camera, &poses(0.05, 10), &position), LocalizationPrecision::Low);
    }

    #[test]
    fn test_high_precision_is_kept() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut point = LocalizedPoint::from_track(&track(0, 2), Vector3::new(0.0, 0.0, 4.0), LocalizationPrecision::High, true);
        let mut poses = CameraPoses::new();
        poses.set(0, CameraPose::new(SE3::identity(), PoseQuality::High, MotionType::Unknown, MapVersion(1)));
        assert!(!point.update_uncertainty(&camera, &poses));
        assert_eq!(point.precision, LocalizationPrecision::High);
    }
}
