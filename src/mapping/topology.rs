//! Key-frame selection for Bundle Adjustment.
//!
//! Key frames are kept across adjustments and grow by at most one per run. A new
//! key frame is chosen among the frames farthest from all key frames, preferring
//! the one observing the most localized points; when the farthest frame is much
//! farther than that choice it wins instead, to spread the key frames out.

use std::collections::HashMap;

use nalgebra::Vector2;

use crate::geometry::SE3;
use crate::map::{FrameIndex, MapState, MapVersion, PointId};

/// New key frames per adjustment.
pub const MAX_NEW_KEY_FRAMES: usize = 1;

/// Key frames needed for an adjustment.
pub const MIN_KEY_FRAMES: usize = 3;

/// Key frames kept at most; the oldest are dropped first.
pub const MAX_KEY_FRAMES: usize = 15;

/// Once the key-frame set is full, only this many recent frames are candidates.
pub const MAX_FRAME_HISTORY: FrameIndex = 300;

/// Localized points a key frame must observe.
pub const MIN_KEY_FRAME_POINTS: usize = 20;

/// Candidates closer than this (squared) to a key frame are ignored.
const MIN_SQR_KEY_FRAME_DISTANCE: f64 = 1e-6;

/// Key frames of one adjustment and the observations linking them to points.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub key_frames: Vec<FrameIndex>,
    /// Poses (T_wc) of the key frames, same order.
    pub world_t_cameras: Vec<SE3>,
    /// Points observed by at least two key frames.
    pub point_ids: Vec<PointId>,
    /// Per point: (key-frame index, image point).
    pub observations: Vec<Vec<(usize, Vector2<f64>)>>,
}

/// Number of localized points observed per frame.
fn localized_points_per_frame(map: &MapState) -> HashMap<FrameIndex, usize> {
    let mut counts = HashMap::new();
    for (_, point) in map.points.localized_points() {
        for (frame, _) in point.observations() {
            *counts.entry(frame).or_insert(0) += 1;
        }
    }
    counts
}

/// Frame with a current pose observing the most localized points (at least `min_points`).
pub fn frame_with_most_points(map: &MapState, version: MapVersion, min_points: usize) -> Option<FrameIndex> {
    let counts = localized_points_per_frame(map);
    map.poses
        .iter()
        .filter(|(_, pose)| pose.is_current(version))
        .map(|(frame, _)| (counts.get(&frame).copied().unwrap_or(0), frame))
        .filter(|(count, _)| *count >= min_points)
        .max_by_key(|(count, frame)| (*count, std::cmp::Reverse(*frame)))
        .map(|(_, frame)| frame)
}

/// Extend (and trim) `key_frames` for the next adjustment.
///
/// Key frames without a pose of the current map version are dropped first.
/// Returns false, with `key_frames` cleared, when no frame is left to add or
/// fewer than [`MIN_KEY_FRAMES`] key frames remain.
pub fn select_key_frames(map: &MapState, key_frames: &mut Vec<FrameIndex>) -> bool {
    let version = map.version();
    key_frames.retain(|frame| map.poses.current(*frame, version).is_some());

    let latest = map.poses.last_frame().unwrap_or(0);
    let mut first_candidate = 0;
    if key_frames.len() >= MAX_KEY_FRAMES {
        first_candidate = (latest + 1).saturating_sub(MAX_FRAME_HISTORY);
    }
    while key_frames.len() >= MAX_KEY_FRAMES {
        key_frames.remove(0);
    }

    if key_frames.is_empty() {
        match frame_with_most_points(map, version, MIN_KEY_FRAME_POINTS) {
            Some(frame) => key_frames.push(frame),
            None => return false,
        }
    }

    let centers: Vec<_> = key_frames
        .iter()
        .filter_map(|frame| map.poses.get(*frame).map(|pose| pose.center()))
        .collect();

    let mut candidates: Vec<(f64, FrameIndex)> = map
        .poses
        .range(first_candidate, latest)
        .filter(|(_, pose)| pose.is_current(version))
        .filter_map(|(frame, pose)| {
            let center = pose.center();
            let sqr_distance = centers
                .iter()
                .map(|key_center| (center - key_center).norm_squared())
                .fold(f64::INFINITY, f64::min);
            (sqr_distance >= MIN_SQR_KEY_FRAME_DISTANCE).then_some((sqr_distance, frame))
        })
        .collect();
    if candidates.is_empty() {
        key_frames.clear();
        return false;
    }

    let counts = localized_points_per_frame(map);
    let points_at = |frame: FrameIndex| counts.get(&frame).copied().unwrap_or(0);

    let mut added = 0;
    while !candidates.is_empty() && key_frames.len() < MAX_KEY_FRAMES {
        // the farthest tenth of the candidates
        let bracket = ((candidates.len() * 10 + 50) / 100).max(1);
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut best: Option<(usize, f64, FrameIndex)> = None;
        for &(sqr_distance, frame) in &candidates[..bracket] {
            let points = points_at(frame);
            if best.map_or(true, |(best_points, _, _)| points > best_points) {
                best = Some((points, sqr_distance, frame));
            }
        }
        let Some((best_points, best_sqr_distance, mut chosen)) = best else {
            break;
        };
        if best_points < MIN_KEY_FRAME_POINTS {
            break;
        }

        let (largest_sqr_distance, largest_frame) = candidates[0];
        if best_sqr_distance * 4.0 < largest_sqr_distance && points_at(largest_frame) >= MIN_KEY_FRAME_POINTS {
            chosen = largest_frame;
        }

        key_frames.push(chosen);
        added += 1;
        if added >= MAX_NEW_KEY_FRAMES {
            break;
        }

        let Some(chosen_center) = map.poses.get(chosen).map(|pose| pose.center()) else {
            break;
        };
        candidates.retain_mut(|(sqr_distance, frame)| {
            let Some(pose) = map.poses.get(*frame) else {
                return false;
            };
            let new_sqr_distance = (pose.center() - chosen_center).norm_squared();
            *sqr_distance = sqr_distance.min(new_sqr_distance);
            new_sqr_distance >= MIN_SQR_KEY_FRAME_DISTANCE
        });
    }

    if key_frames.len() < MIN_KEY_FRAMES {
        key_frames.clear();
        return false;
    }
    true
}

impl Topology {
    /// Select the key frames and gather the observations of all localized points in them.
    ///
    /// `key_frames` is updated in place; `None` if no adjustment is possible.
    pub fn determine(map: &MapState, key_frames: &mut Vec<FrameIndex>) -> Option<Self> {
        if !select_key_frames(map, key_frames) {
            return None;
        }

        let world_t_cameras = key_frames
            .iter()
            .map(|frame| map.poses.get(*frame).map(|pose| pose.world_t_camera))
            .collect::<Option<Vec<_>>>()?;

        let mut topology = Self {
            key_frames: key_frames.clone(),
            world_t_cameras,
            ..Default::default()
        };
        for (id, point) in map.points.localized_points() {
            let observations: Vec<(usize, Vector2<f64>)> = key_frames
                .iter()
                .enumerate()
                .filter_map(|(index, frame)| point.observation(*frame).map(|image_point| (index, image_point)))
                .collect();
            if observations.len() >= 2 {
                topology.point_ids.push(id);
                topology.observations.push(observations);
            }
        }
        Some(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{CameraPose, LocalizationPrecision, MotionType, PointTrack, PoseQuality};
    use nalgebra::{UnitQuaternion, Vector3};

    /// `frames` poses along x, `points` localized points observed in all of them.
    fn scene(frames: FrameIndex, points: usize) -> MapState {
        let mut map = MapState::new();
        let version = map.commit();
        for frame in 0..frames {
            let world_t_camera = SE3::new(UnitQuaternion::identity(), Vector3::new(0.1 * frame as f64, 0.0, 0.0));
            map.poses.set(
                frame,
                CameraPose::new(world_t_camera, PoseQuality::High, MotionType::Translational, version),
            );
        }
        for i in 0..points {
            let mut track = PointTrack::new(0, Vector2::new(i as f64, 0.0));
            for frame in 1..frames {
                track.add_observation(frame, Vector2::new(i as f64, frame as f64));
            }
            let id = map.points.add_track(track);
            map.points
                .promote(id, Vector3::new(0.0, 0.0, 5.0), LocalizationPrecision::Medium, true);
        }
        map
    }

    #[test]
    fn test_one_new_key_frame_per_run() {
        let map = scene(30, 25);
        let mut key_frames = vec![0, 10];

        assert!(select_key_frames(&map, &mut key_frames));
        assert_eq!(key_frames.len(), 3);
        // the farthest frame from both key frames is the last one
        assert_eq!(key_frames[2], 29);

        let topology = Topology::determine(&map, &mut key_frames).unwrap();
        assert_eq!(topology.key_frames.len(), 4);
        assert_eq!(topology.point_ids.len(), 25);
        assert!(topology.observations.iter().all(|o| o.len() == 4));
    }

    #[test]
    fn test_stale_key_frame_poses_are_ignored() {
        let mut map = scene(30, 25);
        // frame 10 was posed against version 1, the map is now at version 2
        let version = map.commit();
        for frame in (0..30).filter(|f| *f != 10) {
            if let Some(mut pose) = map.poses.get(frame).copied() {
                pose.map_version = version;
                map.poses.set(frame, pose);
            }
        }
        let mut key_frames = vec![0, 10, 20];

        assert!(select_key_frames(&map, &mut key_frames));
        assert!(!key_frames.contains(&10));
        assert_eq!(key_frames.len(), 3);
    }

    #[test]
    fn test_key_frames_are_capped() {
        let map = scene(40, 25);
        let mut key_frames: Vec<FrameIndex> = (0..MAX_KEY_FRAMES as FrameIndex).collect();

        assert!(select_key_frames(&map, &mut key_frames));
        assert_eq!(key_frames.len(), MAX_KEY_FRAMES);
        assert!(!key_frames.contains(&0));
        assert_eq!(key_frames.last(), Some(&39));
    }

    #[test]
    fn test_too_few_points_clear_key_frames() {
        let map = scene(30, 10);
        let mut key_frames = vec![0, 10];
        assert!(!select_key_frames(&map, &mut key_frames));
        assert!(key_frames.is_empty());
    }

    #[test]
    fn test_no_candidates_clear_key_frames() {
        let map = scene(3, 25);
        let mut key_frames = vec![0, 1, 2];
        assert!(!select_key_frames(&map, &mut key_frames));
        assert!(key_frames.is_empty());
        assert!(Topology::determine(&map, &mut key_frames).is_none());
    }
}
