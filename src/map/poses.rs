//! Versioned per-frame pose store.

use std::collections::BTreeMap;

use super::camera_pose::CameraPose;
use super::types::{FrameIndex, MapVersion};

/// Poses of all frames that have one, keyed by frame index.
#[derive(Debug, Clone, Default)]
pub struct CameraPoses {
    poses: BTreeMap<FrameIndex, CameraPose>,
}

impl CameraPoses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the pose of a frame.
    pub fn set(&mut self, frame: FrameIndex, pose: CameraPose) {
        self.poses.insert(frame, pose);
    }

    pub fn get(&self, frame: FrameIndex) -> Option<&CameraPose> {
        self.poses.get(&frame)
    }

    pub fn has_pose(&self, frame: FrameIndex) -> bool {
        self.poses.contains_key(&frame)
    }

    /// The pose of `frame` only if it was computed against `version`.
    ///
    /// Poses from older map versions are stale: the points they were estimated
    /// from have moved since.
    pub fn current(&self, frame: FrameIndex, version: MapVersion) -> Option<&CameraPose> {
        self.poses.get(&frame).filter(|pose| pose.is_current(version))
    }

    pub fn remove(&mut self, frame: FrameIndex) -> Option<CameraPose> {
        self.poses.remove(&frame)
    }

    pub fn clear(&mut self) {
        self.poses.clear();
    }

    /// Most recent frame with a pose.
    pub fn last_frame(&self) -> Option<FrameIndex> {
        self.poses.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Iterate in increasing frame order.
    pub fn iter(&self) -> impl Iterator<Item = (FrameIndex, &CameraPose)> {
        self.poses.iter().map(|(frame, pose)| (*frame, pose))
    }

    /// Poses within `first..=last`.
    pub fn range(&self, first: FrameIndex, last: FrameIndex) -> impl Iterator<Item = (FrameIndex, &CameraPose)> {
        self.poses.range(first..=last).map(|(frame, pose)| (*frame, pose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::types::{MotionType, PoseQuality};

    fn pose(version: u64) -> CameraPose {
        CameraPose::new(SE3::identity(), PoseQuality::Medium, MotionType::Unknown, MapVersion(version))
    }

    #[test]
    fn test_stale_pose_is_not_current() {
        let mut poses = CameraPoses::new();
        poses.set(10, pose(3));

        assert!(poses.has_pose(10));
        assert!(poses.current(10, MapVersion(3)).is_some());
        assert!(poses.current(10, MapVersion(4)).is_none());
    }

    #[test]
    fn test_replace_and_range() {
        let mut poses = CameraPoses::new();
        for frame in 0..5 {
            poses.set(frame, pose(1));
        }
        poses.set(2, pose(2));

        assert_eq!(poses.len(), 5);
        assert_eq!(poses.get(2).map(|p| p.map_version), Some(MapVersion(2)));
        let frames: Vec<FrameIndex> = poses.range(1, 3).map(|(f, _)| f).collect();
        assert_eq!(frames, vec![1, 2, 3]);
    }
}
