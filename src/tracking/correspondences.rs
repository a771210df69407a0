//! Frame-to-frame tracking of all map points alive in the previous frame.
//!
//! The background worker snapshots the image points of every track and localized
//! point observed in the latest frame (together with the 3D position of points
//! precise enough for pose estimation). The main thread then tracks these image
//! points into the next frame, forward and backward, and keeps those that return
//! to their starting location.

use nalgebra::{UnitQuaternion, Vector2, Vector3};

use crate::geometry::camera::project_world;
use crate::geometry::{Camera, SE3};
use crate::map::{FrameIndex, LocalizationPrecision, MapState, MapVersion, PointId};
use crate::vision::{FlowTracker, ImagePyramid};

/// Image points observed in one frame, to be tracked into the next frame.
#[derive(Debug, Clone, Default)]
pub struct TrackingCorrespondences {
    /// Frame of `previous_points`; `None` before the first refresh.
    previous_frame: Option<FrameIndex>,
    /// Map version the object points were read at.
    map_version: MapVersion,
    point_ids: Vec<PointId>,
    previous_points: Vec<Vector2<f64>>,
    /// 3D positions of points usable for pose estimation.
    object_points: Vec<Option<Vector3<f64>>>,
    precisions: Vec<LocalizationPrecision>,
    current_points: Vec<Vector2<f64>>,
    valid: Vec<bool>,
}

impl TrackingCorrespondences {
    /// Snapshot all points observed at `frame`.
    ///
    /// Localized points contribute their position when their precision is at least
    /// `minimal_front_precision` or when they are bundle adjusted.
    pub fn from_map(map: &MapState, frame: FrameIndex, minimal_front_precision: LocalizationPrecision) -> Self {
        let mut correspondences = Self {
            previous_frame: Some(frame),
            map_version: map.version(),
            ..Default::default()
        };

        for (id, track) in map.points.tracks() {
            if let Some(image_point) = track.observation(frame) {
                correspondences.push(id, image_point, None, LocalizationPrecision::Invalid);
            }
        }
        for (id, point) in map.points.localized_points() {
            if let Some(image_point) = point.observation(frame) {
                let usable = point.precision >= minimal_front_precision || point.bundle_adjusted;
                let object_point = usable.then_some(point.position);
                correspondences.push(id, image_point, object_point, point.precision);
            }
        }

        correspondences
    }

    fn push(
        &mut self,
        id: PointId,
        image_point: Vector2<f64>,
        object_point: Option<Vector3<f64>>,
        precision: LocalizationPrecision,
    ) {
        self.point_ids.push(id);
        self.previous_points.push(image_point);
        self.object_points.push(object_point);
        self.precisions.push(precision);
    }

    pub fn previous_frame(&self) -> Option<FrameIndex> {
        self.previous_frame
    }

    pub fn map_version(&self) -> MapVersion {
        self.map_version
    }

    pub fn len(&self) -> usize {
        self.point_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.point_ids.is_empty()
    }

    pub fn point_ids(&self) -> &[PointId] {
        &self.point_ids
    }

    pub fn previous_points(&self) -> &[Vector2<f64>] {
        &self.previous_points
    }

    pub fn current_points(&self) -> &[Vector2<f64>] {
        &self.current_points
    }

    pub fn object_point(&self, index: usize) -> Option<Vector3<f64>> {
        self.object_points.get(index).copied().flatten()
    }

    pub fn precision(&self, index: usize) -> LocalizationPrecision {
        self.precisions
            .get(index)
            .copied()
            .unwrap_or(LocalizationPrecision::Invalid)
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.valid.get(index).copied().unwrap_or(false)
    }

    pub fn count_valid(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Indices of the correspondences tracked successfully.
    pub fn valid_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.then_some(i))
    }

    /// Predicted locations in the current frame.
    ///
    /// Localized points are projected with the predicted pose (if any); otherwise
    /// points are rotated with the relative orientation; otherwise they stay put.
    ///
    /// # Arguments
    /// * `predicted_world_t_camera` - Predicted pose (T_wc) of the current frame
    /// * `previous_r_current` - Rotation of the current camera in the previous camera frame
    pub fn predictions(
        &self,
        camera: &dyn Camera,
        predicted_world_t_camera: Option<&SE3>,
        previous_r_current: Option<&UnitQuaternion<f64>>,
    ) -> Vec<Vector2<f64>> {
        let predicted_camera_t_world = predicted_world_t_camera.map(SE3::inverse);
        let current_r_previous = previous_r_current.map(UnitQuaternion::inverse);

        self.previous_points
            .iter()
            .zip(&self.object_points)
            .map(|(previous, object_point)| {
                if let (Some(camera_t_world), Some(object_point)) = (&predicted_camera_t_world, object_point) {
                    if let Some(projected) = project_world(camera, camera_t_world, object_point) {
                        if camera.is_inside(&projected) {
                            return projected;
                        }
                    }
                }
                if let Some(rotation) = &current_r_previous {
                    let ray = rotation * camera.unproject(previous);
                    if ray.z > f64::EPSILON {
                        let projected = camera.project(&ray);
                        if camera.is_inside(&projected) {
                            return projected;
                        }
                    }
                }
                *previous
            })
            .collect()
    }

    /// Track the previous image points into `current`, validating each by tracking back.
    ///
    /// A correspondence is valid when the backward track returns within
    /// `sqr_tolerance` of its starting point. Returns the number of valid correspondences.
    pub fn track(
        &mut self,
        flow: &dyn FlowTracker,
        previous: &ImagePyramid,
        current: &ImagePyramid,
        predictions: &[Vector2<f64>],
        sqr_tolerance: f64,
    ) -> usize {
        debug_assert_eq!(predictions.len(), self.previous_points.len());
        let n = self.previous_points.len();
        self.current_points = self.previous_points.clone();
        self.valid = vec![false; n];
        if n == 0 {
            return 0;
        }

        let forward = flow.track(previous, current, &self.previous_points, predictions);
        if forward.len() != n {
            return 0;
        }

        let mut forward_indices = Vec::with_capacity(n);
        let mut forward_points = Vec::with_capacity(n);
        let (width, height) = (current.width() as f64, current.height() as f64);
        for (i, point) in forward.iter().enumerate() {
            if let Some(point) = point {
                if point.x >= 0.0 && point.y >= 0.0 && point.x < width && point.y < height {
                    forward_indices.push(i);
                    forward_points.push(*point);
                }
            }
        }

        let hints: Vec<Vector2<f64>> = forward_indices.iter().map(|&i| self.previous_points[i]).collect();
        let backward = flow.track(current, previous, &forward_points, &hints);
        if backward.len() != forward_points.len() {
            return 0;
        }

        for ((&i, point), back) in forward_indices.iter().zip(&forward_points).zip(&backward) {
            if let Some(back) = back {
                if (back - self.previous_points[i]).norm_squared() <= sqr_tolerance {
                    self.current_points[i] = *point;
                    self.valid[i] = true;
                }
            }
        }

        self.count_valid()
    }

    /// Forget the current tracking results, e.g. when the previous frame is missing.
    pub fn invalidate(&mut self) {
        self.current_points = self.previous_points.clone();
        self.valid = vec![false; self.previous_points.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PinholeCamera;
    use crate::map::PointTrack;
    use crate::vision::GrayImage;

    /// Shifts every point by a constant offset, except points left of `x_min`.
    struct ShiftFlow {
        offset: Vector2<f64>,
        x_min: f64,
    }

    impl FlowTracker for ShiftFlow {
        fn track(
            &self,
            previous: &ImagePyramid,
            current: &ImagePyramid,
            points: &[Vector2<f64>],
            _predictions: &[Vector2<f64>],
        ) -> Vec<Option<Vector2<f64>>> {
            let sign = if current.frame_index > previous.frame_index { 1.0 } else { -1.0 };
            points
                .iter()
                .map(|p| (p.x >= self.x_min).then(|| p + self.offset * sign))
                .collect()
        }
    }

    fn pyramid(frame: u32) -> ImagePyramid {
        ImagePyramid::new(frame, frame as f64 * 0.03, GrayImage::blank(640, 480), 1)
    }

    #[test]
    fn test_snapshot_and_track() {
        let mut map = MapState::new();
        map.points.add_track(PointTrack::new(3, Vector2::new(100.0, 100.0)));
        map.points.add_track(PointTrack::new(3, Vector2::new(10.0, 100.0)));
        map.points.add_track(PointTrack::new(2, Vector2::new(300.0, 100.0)));

        let mut correspondences = TrackingCorrespondences::from_map(&map, 3, LocalizationPrecision::Low);
        assert_eq!(correspondences.len(), 2);
        assert_eq!(correspondences.previous_frame(), Some(3));

        let flow = ShiftFlow {
            offset: Vector2::new(2.0, 1.0),
            x_min: 50.0,
        };
        let predictions = correspondences.previous_points().to_vec();
        let valid = correspondences.track(&flow, &pyramid(3), &pyramid(4), &predictions, 0.81);
        assert_eq!(valid, 1);

        let index = correspondences.valid_indices().next().unwrap();
        assert_eq!(correspondences.current_points()[index], Vector2::new(102.0, 101.0));
    }

    #[test]
    fn test_rotation_prediction() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut map = MapState::new();
        map.points.add_track(PointTrack::new(0, Vector2::new(320.0, 240.0)));
        let correspondences = TrackingCorrespondences::from_map(&map, 0, LocalizationPrecision::Low);

        // rotation about the y axis moves the principal point to the left
        let previous_r_current = UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.05, 0.0));
        let predictions = correspondences.predictions(&camera, None, Some(&previous_r_current));
        assert!(predictions[0].x < 320.0);

        let unchanged = correspondences.predictions(&camera, None, None);
        assert_eq!(unchanged[0], Vector2::new(320.0, 240.0));
    }
}
