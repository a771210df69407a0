//! The shared map: points, poses and the map version, mutated together.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::point_store::PointStore;
use super::poses::CameraPoses;
use super::types::{FrameIndex, LocalizationPrecision, MapVersion, PointId};

/// Everything protected by the map lock.
///
/// The version is bumped by [`MapState::commit`] only, so a writer holding the lock
/// publishes points, poses and the new version in one step.
#[derive(Debug, Clone, Default)]
pub struct MapState {
    pub points: PointStore,
    pub poses: CameraPoses,
    version: MapVersion,
    /// Unit gravity measured in the camera frame, for frames that had one.
    pub gravities: BTreeMap<FrameIndex, Vector3<f64>>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> MapVersion {
        self.version
    }

    /// Publish a committed mutation and return the new version.
    pub fn commit(&mut self) -> MapVersion {
        self.version = self.version.next();
        self.version
    }

    /// Drop all 3D information and poses, keeping 2D tracking alive.
    pub fn reset(&mut self, latest_frame: FrameIndex) {
        self.points.reset_localized(latest_frame);
        self.poses.clear();
    }

    /// Identifiers of localized points observed at `frame`.
    pub fn localized_at(&self, frame: FrameIndex) -> Vec<PointId> {
        self.points
            .localized_points()
            .filter(|(_, point)| point.is_observed_at(frame))
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of localized points observed at `frame` with at least `min_precision`.
    pub fn count_localized_at(&self, frame: FrameIndex, min_precision: LocalizationPrecision) -> usize {
        self.points
            .localized_points()
            .filter(|(_, point)| point.is_observed_at(frame) && point.precision >= min_precision)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_only_changes_on_commit() {
        let mut state = MapState::new();
        assert_eq!(state.version(), MapVersion(0));
        state.reset(0);
        assert_eq!(state.version(), MapVersion(0));
        assert_eq!(state.commit(), MapVersion(1));
        assert_eq!(state.commit(), MapVersion(2));
    }
}
