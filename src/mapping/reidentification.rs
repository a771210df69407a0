//! Re-identification of localized points that were lost, e.g. after an occlusion.
//!
//! A localized point with descriptors that is not observed in the current frame
//! but projects into it is a candidate. Two strategies exist:
//! - match the corners detected in the frame anyway against the candidates
//!   ([`match_corners_to_points`])
//! - detect corners in a small region around each projected candidate and pick
//!   the best-matching one ([`MappingWorker::reidentify_in_regions`])

use std::collections::HashSet;

use nalgebra::Vector2;
use tracing::debug;

use super::worker::MappingWorker;
use crate::geometry::camera::project_world;
use crate::geometry::{Camera, SE3};
use crate::map::descriptor::{best_distance, DESCRIPTOR_MATCH_THRESHOLD};
use crate::map::{Descriptor, FrameIndex, LocalizationPrecision, MapState, PointId};
use crate::vision::{Corner, ImagePyramid, ImageRegion};

/// Side length of the detection region around a projected point, in pixels.
pub const REIDENTIFICATION_REGION_SIZE: u32 = 20;

/// Minimal visible width and height of a detection region.
pub const MIN_REGION_SIZE: u32 = 10;

/// A described localized point not observed in the current frame.
#[derive(Debug, Clone)]
pub struct InvisiblePoint {
    pub id: PointId,
    pub projection: Vector2<f64>,
    pub descriptors: Vec<Descriptor>,
}

/// Localized points that are candidates for re-identification at `frame`.
///
/// # Arguments
/// * `camera_t_world` - Pose (T_cw) of `frame`
pub fn invisible_points(
    camera: &dyn Camera,
    map: &MapState,
    frame: FrameIndex,
    camera_t_world: &SE3,
) -> Vec<InvisiblePoint> {
    map.points
        .localized_points()
        .filter(|(_, point)| {
            point.precision >= LocalizationPrecision::Low
                && point.has_descriptors()
                && point.last_observation_frame().map_or(true, |last| last < frame)
        })
        .filter_map(|(id, point)| {
            let projection = project_world(camera, camera_t_world, &point.position)?;
            Some(InvisiblePoint {
                id,
                projection,
                descriptors: point.descriptors().to_vec(),
            })
        })
        .collect()
}

/// Match detected corners to invisible points.
///
/// A corner is a candidate for every point projecting within
/// `max_projection_error`. Only corners with at least one candidate are
/// described (through `describe`), and a match needs a descriptor distance below
/// [`DESCRIPTOR_MATCH_THRESHOLD`]. Each point is matched at most once, corners are
/// processed in the given order.
///
/// Returns `(point, corner index)` pairs.
pub fn match_corners_to_points<F>(
    corners: &[Corner],
    points: &[InvisiblePoint],
    max_projection_error: f64,
    describe: F,
) -> Vec<(PointId, usize)>
where
    F: FnOnce(&[Vector2<f64>]) -> Vec<Option<Descriptor>>,
{
    if corners.is_empty() || points.is_empty() {
        return Vec::new();
    }
    let sqr_max = max_projection_error * max_projection_error;

    let candidates: Vec<Vec<usize>> = corners
        .iter()
        .map(|corner| {
            points
                .iter()
                .enumerate()
                .filter(|(_, point)| (point.projection - corner.position).norm_squared() < sqr_max)
                .map(|(index, _)| index)
                .collect()
        })
        .collect();

    let described: Vec<usize> = (0..corners.len()).filter(|&i| !candidates[i].is_empty()).collect();
    if described.is_empty() {
        return Vec::new();
    }
    let positions: Vec<Vector2<f64>> = described.iter().map(|&i| corners[i].position).collect();
    let descriptors = describe(&positions);

    let mut matched = HashSet::new();
    let mut matches = Vec::new();
    for (k, &corner_index) in described.iter().enumerate() {
        let Some(Some(descriptor)) = descriptors.get(k) else {
            continue;
        };
        let best = candidates[corner_index]
            .iter()
            .filter(|index| !matched.contains(*index))
            .filter_map(|&index| best_distance(descriptor, &points[index].descriptors).map(|d| (d, index)))
            .min_by_key(|(distance, _)| *distance);

        if let Some((distance, index)) = best {
            if distance < DESCRIPTOR_MATCH_THRESHOLD {
                matched.insert(index);
                matches.push((points[index].id, corner_index));
            }
        }
    }
    matches
}

/// Index of the corner descriptor closest to any of `point_descriptors`, if below the match threshold.
pub fn best_region_match(corner_descriptors: &[Option<Descriptor>], point_descriptors: &[Descriptor]) -> Option<usize> {
    corner_descriptors
        .iter()
        .enumerate()
        .filter_map(|(index, descriptor)| {
            let descriptor = descriptor.as_ref()?;
            best_distance(descriptor, point_descriptors).map(|distance| (distance, index))
        })
        .min_by_key(|(distance, _)| *distance)
        .filter(|(distance, _)| *distance < DESCRIPTOR_MATCH_THRESHOLD)
        .map(|(_, index)| index)
}

impl MappingWorker {
    /// Detect corners around each invisible point and re-identify it by its descriptors.
    ///
    /// Returns the number of re-identified points.
    pub(super) fn reidentify_in_regions(
        &mut self,
        pyramid: &ImagePyramid,
        frame: FrameIndex,
        camera_t_world: &SE3,
    ) -> usize {
        let camera = self.collaborators.camera.clone();
        let candidates = invisible_points(camera.as_ref(), &self.shared.map.read(), frame, camera_t_world);
        if candidates.is_empty() {
            return 0;
        }

        let mut matches = Vec::new();
        for candidate in &candidates {
            let Some(region) = ImageRegion::centered(
                &candidate.projection,
                REIDENTIFICATION_REGION_SIZE,
                pyramid.width(),
                pyramid.height(),
            ) else {
                continue;
            };
            if region.width < MIN_REGION_SIZE || region.height < MIN_REGION_SIZE {
                continue;
            }

            let corners = self
                .collaborators
                .corners
                .detect(pyramid, self.detection_threshold, Some(&region));
            if corners.is_empty() {
                continue;
            }
            let positions: Vec<Vector2<f64>> = corners.iter().map(|corner| corner.position).collect();
            let descriptors = self.collaborators.descriptors.describe(pyramid, &positions);
            if let Some(index) = best_region_match(&descriptors, &candidate.descriptors) {
                matches.push((candidate.id, positions[index]));
            }
        }

        let mut map = self.shared.map.write();
        let mut count = 0;
        for (id, image_point) in matches {
            if map.points.add_observation(id, frame, image_point) {
                if let Some(occupancy) = self.occupancy.as_mut() {
                    occupancy.add_point(&image_point);
                }
                count += 1;
            }
        }
        debug!("[Mapping] re-identified {} of {} points in regions", count, candidates.len());
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PinholeCamera;
    use crate::map::PointTrack;
    use nalgebra::Vector3;

    fn descriptor(seed: u64) -> Descriptor {
        Descriptor([seed, seed.rotate_left(17), !seed, seed ^ 0x5555])
    }

    fn point(id: u64, x: f64, y: f64, seed: u64) -> InvisiblePoint {
        InvisiblePoint {
            id: PointId(id),
            projection: Vector2::new(x, y),
            descriptors: vec![descriptor(seed)],
        }
    }

    fn corner(x: f64, y: f64) -> Corner {
        Corner {
            position: Vector2::new(x, y),
            strength: 1.0,
        }
    }

    #[test]
    fn test_only_corners_near_points_are_described() {
        let points = vec![point(1, 100.0, 100.0, 7), point(2, 300.0, 200.0, 99)];
        let corners = vec![corner(101.0, 99.0), corner(500.0, 400.0), corner(302.0, 201.0)];

        let mut described = Vec::new();
        let matches = match_corners_to_points(&corners, &points, 3.5, |positions| {
            described = positions.to_vec();
            vec![Some(descriptor(7)), Some(descriptor(99))]
        });

        assert_eq!(described.len(), 2);
        assert_eq!(matches, vec![(PointId(1), 0), (PointId(2), 2)]);
    }

    #[test]
    fn test_each_point_matches_once() {
        let points = vec![point(1, 100.0, 100.0, 7)];
        let corners = vec![corner(100.5, 100.0), corner(99.5, 100.0)];

        let matches = match_corners_to_points(&corners, &points, 3.5, |positions| {
            positions.iter().map(|_| Some(descriptor(7))).collect()
        });
        assert_eq!(matches, vec![(PointId(1), 0)]);
    }

    #[test]
    fn test_distant_descriptor_is_rejected() {
        let points = vec![point(1, 100.0, 100.0, 7)];
        let corners = vec![corner(100.0, 100.0)];

        let far = Descriptor([!7u64, !(7u64.rotate_left(17)), 7, !(7u64 ^ 0x5555)]);
        let matches = match_corners_to_points(&corners, &points, 3.5, |_| vec![Some(far)]);
        assert!(matches.is_empty());

        assert_eq!(best_region_match(&[None, Some(far)], &[descriptor(7)]), None);
        assert_eq!(best_region_match(&[Some(far), Some(descriptor(7))], &[descriptor(7)]), Some(1));
    }

    #[test]
    fn test_invisible_points_skip_observed_and_undescribed() {
        let camera = PinholeCamera::new(640, 480, 500.0, 500.0, 320.0, 240.0);
        let mut map = MapState::new();

        let mut add = |observed_until: FrameIndex, describe: bool, position: Vector3<f64>| {
            let mut track = PointTrack::new(0, Vector2::new(320.0, 240.0));
            for frame in 1..=observed_until {
                track.add_observation(frame, Vector2::new(320.0, 240.0));
            }
            let id = map.points.add_track(track);
            map.points.promote(id, position, LocalizationPrecision::Medium, true);
            if describe {
                if let Some(point) = map.points.localized_mut(id) {
                    point.add_descriptor(0, descriptor(id.0));
                }
            }
            id
        };

        let lost = add(5, true, Vector3::new(0.0, 0.0, 4.0));
        let _visible = add(10, true, Vector3::new(0.1, 0.0, 4.0));
        let _undescribed = add(5, false, Vector3::new(0.2, 0.0, 4.0));
        let _behind = add(5, true, Vector3::new(0.0, 0.0, -4.0));

        let candidates = invisible_points(&camera, &map, 10, &SE3::identity());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, lost);
        assert!((candidates[0].projection - Vector2::new(320.0, 240.0)).norm() < 1e-9);
    }
}
