//! Descriptor augmentation of well-localized points.

use nalgebra::Vector2;
use tracing::debug;

use super::worker::MappingWorker;
use crate::map::{FrameIndex, LocalizationPrecision, MapState, PointId};
use crate::vision::ImagePyramid;

/// Precision a point needs before descriptors are collected for it.
pub const MIN_DESCRIPTOR_PRECISION: LocalizationPrecision = LocalizationPrecision::Medium;

/// Points observed at `frame` that are due for a new descriptor, with their image positions.
pub fn points_needing_descriptors(map: &MapState, frame: FrameIndex) -> (Vec<PointId>, Vec<Vector2<f64>>) {
    map.points
        .localized_points()
        .filter(|(_, point)| point.precision >= MIN_DESCRIPTOR_PRECISION && point.need_descriptor(frame))
        .filter_map(|(id, point)| point.observation(frame).map(|image_point| (id, image_point)))
        .unzip()
}

impl MappingWorker {
    /// Extract descriptors in `pyramid` for the points that need one.
    pub(super) fn describe_points(&mut self, frame: FrameIndex, pyramid: &ImagePyramid) {
        let (ids, image_points) = {
            let map = self.shared.map.read();
            points_needing_descriptors(&map, frame)
        };
        if ids.is_empty() {
            return;
        }

        let descriptors = self.collaborators.descriptors.describe(pyramid, &image_points);

        let mut map = self.shared.map.write();
        let mut added = 0;
        for (id, descriptor) in ids.into_iter().zip(descriptors) {
            let Some(descriptor) = descriptor else {
                continue;
            };
            // the point may have been removed or already described meanwhile
            if let Some(point) = map.points.localized_mut(id).filter(|point| point.need_descriptor(frame)) {
                point.add_descriptor(frame, descriptor);
                added += 1;
            }
        }
        debug!("[Descriptors] {} points described at frame {}", added, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Descriptor, PointTrack};
    use nalgebra::Vector3;

    fn localized(map: &mut MapState, frames: FrameIndex, precision: LocalizationPrecision) -> PointId {
        let mut track = PointTrack::new(0, Vector2::new(1.0, 2.0));
        for frame in 1..frames {
            track.add_observation(frame, Vector2::new(1.0, 2.0 + frame as f64));
        }
        let id = map.points.add_track(track);
        map.points.promote(id, Vector3::new(0.0, 0.0, 4.0), precision, true);
        id
    }

    #[test]
    fn test_only_precise_observed_points_are_described() {
        let mut map = MapState::new();
        let medium = localized(&mut map, 5, LocalizationPrecision::Medium);
        let _low = localized(&mut map, 5, LocalizationPrecision::Low);
        let _gone = localized(&mut map, 3, LocalizationPrecision::High);

        let (ids, image_points) = points_needing_descriptors(&map, 4);
        assert_eq!(ids, vec![medium]);
        assert_eq!(image_points, vec![Vector2::new(1.0, 6.0)]);
    }

    #[test]
    fn test_described_point_waits_for_next_interval() {
        let mut map = MapState::new();
        let id = localized(&mut map, 5, LocalizationPrecision::High);
        map.points
            .localized_mut(id)
            .unwrap()
            .add_descriptor(4, Descriptor([0; 4]));

        let (ids, _) = points_needing_descriptors(&map, 4);
        assert!(ids.is_empty());
    }
}
