//! Per-frame work of the mapping worker, run once for every submitted frame.
//!
//! 1. Apply the frame-to-frame tracking results: extend tracks and localized
//!    points, drop points that were lost
//! 2. Re-identify lost localized points
//! 3. Detect new corners where the occupancy grid is empty and start new tracks
//! 4. Snapshot the points of this frame for tracking into the next frame

use std::collections::HashMap;
use std::time::Instant;

use nalgebra::Vector2;
use tracing::{debug, warn};

use super::reidentification::{invisible_points, match_corners_to_points};
use super::worker::MappingWorker;
use crate::geometry::SE3;
use crate::map::{FrameIndex, LocalizationPrecision, MapState, PointId, PointState, PointTrack};
use crate::system::handoff::{FrameJob, FrameResult, JobPort};
use crate::tracking::statistics::Timer;
use crate::tracking::tracker::MINIMAL_FRONT_PRECISION;
use crate::tracking::{OccupancyGrid, TrackingCorrespondences};
use crate::vision::{Corner, ImagePyramid};

/// Outcome of applying one frame's tracking results to the map.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackingUpdate {
    pub extended: usize,
    pub removed_tracks: usize,
    pub removed_points: usize,
}

/// Apply the tracking results of `frame` to the map.
///
/// Results are only used when they were tracked from the frame right before
/// `frame`. Identifiers of tracks merged in the meantime are followed through
/// `redirects`. Lost tracks are removed, lost localized points only when their
/// precision is below `Low`.
///
/// Returns the update counts and the identifiers of removed localized points.
pub fn apply_tracking_results(
    map: &mut MapState,
    frame: FrameIndex,
    tracking: &TrackingCorrespondences,
    redirects: &HashMap<PointId, PointId>,
    mut occupancy: Option<&mut OccupancyGrid>,
) -> (TrackingUpdate, Vec<PointId>) {
    let mut update = TrackingUpdate::default();
    let mut removed = Vec::new();
    if frame == 0 || tracking.previous_frame() != Some(frame - 1) {
        return (update, removed);
    }

    for (index, &id) in tracking.point_ids().iter().enumerate() {
        let id = redirects.get(&id).copied().unwrap_or(id);

        if tracking.is_valid(index) {
            let image_point = tracking.current_points()[index];
            if map.points.add_observation(id, frame, image_point) {
                if let Some(occupancy) = occupancy.as_deref_mut() {
                    occupancy.add_point(&image_point);
                }
                update.extended += 1;
            }
            continue;
        }

        match map.points.get(id) {
            Some(PointState::Track(_)) => {
                map.points.remove(id);
                update.removed_tracks += 1;
            }
            Some(PointState::Localized(point)) if point.precision < LocalizationPrecision::Low => {
                map.points.remove(id);
                removed.push(id);
                update.removed_points += 1;
            }
            _ => {}
        }
    }
    (update, removed)
}

/// Next detection threshold, steering the grid coverage towards `target_coverage`.
pub fn adapt_threshold(threshold: u32, coverage: f64, target_coverage: f64, min: u32, max: u32) -> u32 {
    let coverage_percent = (coverage * 100.0).round() as i64;
    let target_percent = (target_coverage * 100.0).round() as i64;
    let next = if coverage_percent < target_percent {
        threshold.saturating_sub(1)
    } else {
        threshold.saturating_add(1)
    };
    next.clamp(min, max)
}

/// Start new tracks at the strongest corners in empty occupancy bins.
///
/// Returns the number of new tracks.
pub fn add_new_tracks(map: &mut MapState, frame: FrameIndex, mut corners: Vec<Corner>, occupancy: &mut OccupancyGrid) -> usize {
    corners.sort_by(|a, b| b.strength.total_cmp(&a.strength));
    let mut added = 0;
    for corner in corners {
        if occupancy.add_point_if_empty(&corner.position) {
            map.points.add_track(PointTrack::new(frame, corner.position));
            added += 1;
        }
    }
    added
}

impl MappingWorker {
    /// Process one frame job and report the result to tracking.
    ///
    /// Returns false if tracking is gone.
    pub(super) fn post_frame(&mut self, job: FrameJob, port: &JobPort) -> bool {
        let start = Instant::now();
        let FrameJob {
            frame_index: frame,
            pyramid,
            tracking,
        } = job;

        let (width, height) = (pyramid.width(), pyramid.height());
        if let Some(occupancy) = self.occupancy.as_mut().filter(|grid| grid.matches_size(width, height)) {
            occupancy.clear();
        } else {
            self.occupancy = OccupancyGrid::new(width, height, self.config.number_bins, self.config.min_coverage);
            if self.occupancy.is_none() {
                warn!("[Mapping] cannot build an occupancy grid for {}x{} images", width, height);
            }
        }

        let camera_t_world = {
            let mut map = self.shared.map.write();
            let (update, removed) =
                apply_tracking_results(&mut map, frame, &tracking, &self.redirects, self.occupancy.as_mut());
            if !removed.is_empty() {
                self.shared.clear_inaccurate(removed);
            }
            debug!(
                "[Mapping] frame {}: {} extended, {} tracks and {} points lost",
                frame, update.extended, update.removed_tracks, update.removed_points
            );
            map.poses.get(frame).map(|pose| pose.camera_t_world())
        };
        self.redirects.clear();

        if !self.config.match_corners_to_localized_points {
            if let Some(camera_t_world) = &camera_t_world {
                self.reidentify_in_regions(&pyramid, frame, camera_t_world);
            }
        }

        if self.occupancy.as_ref().is_some_and(OccupancyGrid::need_more_points) {
            let detection_start = Instant::now();
            self.detect_corners(frame, &pyramid, camera_t_world.as_ref());
            self.shared.record_time(Timer::Detection, detection_start);
        }

        let next_tracking = {
            let map = self.shared.map.read();
            TrackingCorrespondences::from_map(&map, frame, MINIMAL_FRONT_PRECISION)
        };

        self.latest = Some(pyramid);
        self.shared.record_time(Timer::PostFrame, start);

        port.complete(FrameResult {
            frame_index: frame,
            tracking: next_tracking,
        })
    }

    /// Detect corners, re-identify lost points among them and start new tracks.
    fn detect_corners(
        &mut self,
        frame: FrameIndex,
        pyramid: &ImagePyramid,
        camera_t_world: Option<&SE3>,
    ) {
        let mut corners = self.collaborators.corners.detect(pyramid, self.detection_threshold, None);

        if self.config.match_corners_to_localized_points {
            if let Some(camera_t_world) = camera_t_world {
                let camera = self.collaborators.camera.clone();
                let candidates = invisible_points(camera.as_ref(), &self.shared.map.read(), frame, camera_t_world);
                let descriptors = self.collaborators.descriptors.clone();
                let matches = match_corners_to_points(&corners, &candidates, self.config.max_projection_error, |points| {
                    descriptors.describe(pyramid, points)
                });

                if !matches.is_empty() {
                    let mut matched_corners = vec![false; corners.len()];
                    let mut map = self.shared.map.write();
                    let mut count = 0;
                    for &(id, corner_index) in &matches {
                        let image_point: Vector2<f64> = corners[corner_index].position;
                        if map.points.add_observation(id, frame, image_point) {
                            if let Some(occupancy) = self.occupancy.as_mut() {
                                occupancy.add_point(&image_point);
                            }
                            matched_corners[corner_index] = true;
                            count += 1;
                        }
                    }
                    drop(map);

                    let mut index = 0;
                    corners.retain(|_| {
                        let keep = !matched_corners[index];
                        index += 1;
                        keep
                    });
                    debug!("[Mapping] re-identified {} of {} points among new corners", count, candidates.len());
                }
            }
        }

        let Some(occupancy) = self.occupancy.as_mut() else {
            return;
        };
        let added = {
            let mut map = self.shared.map.write();
            add_new_tracks(&mut map, frame, corners, occupancy)
        };

        let previous = self.detection_threshold;
        self.detection_threshold = adapt_threshold(
            previous,
            occupancy.coverage(),
            self.config.target_coverage,
            self.config.detection_threshold_min,
            self.config.detection_threshold_max,
        );
        debug!(
            "[Mapping] {} new tracks at frame {}, coverage {:.2}, threshold {} -> {}",
            added,
            frame,
            occupancy.coverage(),
            previous,
            self.detection_threshold
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{FlowTracker, GrayImage};
    use nalgebra::Vector3;

    /// Moves every point right by one pixel, except points left of `x_min` which are lost.
    struct ShiftFlow {
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
            let direction = if current.frame_index > previous.frame_index { 1.0 } else { -1.0 };
            points
                .iter()
                .map(|p| (p.x >= self.x_min).then(|| p + Vector2::new(direction, 0.0)))
                .collect()
        }
    }

    fn pyramid(frame: FrameIndex) -> ImagePyramid {
        ImagePyramid::new(frame, frame as f64 * 0.03, GrayImage::blank(640, 480), 1)
    }

    #[test]
    fn test_tracking_results_extend_and_remove() {
        let mut map = MapState::new();
        let kept = map.points.add_track(PointTrack::new(0, Vector2::new(200.0, 100.0)));
        let lost = map.points.add_track(PointTrack::new(0, Vector2::new(10.0, 100.0)));

        let lost_imprecise = map.points.add_track(PointTrack::new(0, Vector2::new(20.0, 100.0)));
        map.points
            .promote(lost_imprecise, Vector3::new(0.0, 0.0, 5.0), LocalizationPrecision::Unknown, true);
        let lost_precise = map.points.add_track(PointTrack::new(0, Vector2::new(30.0, 100.0)));
        map.points
            .promote(lost_precise, Vector3::new(0.0, 0.0, 5.0), LocalizationPrecision::Medium, true);

        let mut tracking = TrackingCorrespondences::from_map(&map, 0, MINIMAL_FRONT_PRECISION);
        let predictions = tracking.previous_points().to_vec();
        tracking.track(&ShiftFlow { x_min: 100.0 }, &pyramid(0), &pyramid(1), &predictions, 0.81);

        let mut occupancy = OccupancyGrid::new(640, 480, 200, 0.8).unwrap();
        let (update, removed) = apply_tracking_results(&mut map, 1, &tracking, &HashMap::new(), Some(&mut occupancy));

        assert_eq!(update.extended, 1);
        assert_eq!(update.removed_tracks, 1);
        assert_eq!(update.removed_points, 1);
        assert_eq!(removed, vec![lost_imprecise]);
        assert_eq!(map.points.observation(kept, 1), Some(Vector2::new(201.0, 100.0)));
        assert!(map.points.get(lost).is_none());
        assert!(map.points.is_localized(lost_precise));
        assert!(occupancy.is_occupied(&Vector2::new(201.0, 100.0)));
    }

    #[test]
    fn test_results_of_a_gap_are_ignored() {
        let mut map = MapState::new();
        let id = map.points.add_track(PointTrack::new(0, Vector2::new(200.0, 100.0)));
        let mut tracking = TrackingCorrespondences::from_map(&map, 0, MINIMAL_FRONT_PRECISION);
        tracking.invalidate();

        let (update, _) = apply_tracking_results(&mut map, 2, &tracking, &HashMap::new(), None);
        assert_eq!(update, TrackingUpdate::default());
        assert!(map.points.is_track(id));
    }

    #[test]
    fn test_redirected_track_extends_localized_point() {
        let mut map = MapState::new();
        let track = map.points.add_track(PointTrack::new(3, Vector2::new(200.0, 100.0)));
        let mut tracking = TrackingCorrespondences::from_map(&map, 3, MINIMAL_FRONT_PRECISION);
        let predictions = tracking.previous_points().to_vec();
        tracking.track(&ShiftFlow { x_min: 0.0 }, &pyramid(3), &pyramid(4), &predictions, 0.81);

        // relocalization merged the track into a localized point in the meantime
        let mut merged = PointTrack::new(0, Vector2::new(190.0, 100.0));
        for frame in 1..=3 {
            merged.add_observation(frame, Vector2::new(190.0 + frame as f64, 100.0));
        }
        let localized = map.points.add_track(merged);
        map.points
            .promote(localized, Vector3::new(0.0, 0.0, 5.0), LocalizationPrecision::Medium, true);
        map.points.remove(track);

        let redirects = HashMap::from([(track, localized)]);
        let (update, _) = apply_tracking_results(&mut map, 4, &tracking, &redirects, None);
        assert_eq!(update.extended, 1);
        assert_eq!(map.points.observation(localized, 4), Some(Vector2::new(201.0, 100.0)));
    }

    #[test]
    fn test_new_tracks_fill_empty_bins_strongest_first() {
        let mut map = MapState::new();
        let mut occupancy = OccupancyGrid::new(640, 480, 200, 0.8).unwrap();
        occupancy.add_point(&Vector2::new(100.0, 100.0));

        let corners = vec![
            Corner {
                position: Vector2::new(101.0, 101.0),
                strength: 50.0,
            },
            Corner {
                position: Vector2::new(400.0, 300.0),
                strength: 10.0,
            },
            Corner {
                position: Vector2::new(401.0, 300.0),
                strength: 30.0,
            },
        ];
        let added = add_new_tracks(&mut map, 5, corners, &mut occupancy);

        assert_eq!(added, 1);
        let (_, track) = map.points.tracks().next().unwrap();
        assert_eq!(track.first_frame(), 5);
        assert_eq!(track.last_observation(), Vector2::new(401.0, 300.0));
    }

    #[test]
    fn test_threshold_steers_coverage() {
        assert_eq!(adapt_threshold(25, 0.2, 0.4, 10, 40), 24);
        assert_eq!(adapt_threshold(25, 0.4, 0.4, 10, 40), 26);
        assert_eq!(adapt_threshold(10, 0.0, 0.4, 10, 40), 10);
        assert_eq!(adapt_threshold(40, 0.9, 0.4, 10, 40), 40);
    }
}
