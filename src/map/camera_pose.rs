//! A camera pose tagged with its quality and the map version it was computed against.

use nalgebra::Vector3;

use super::types::{MapVersion, MotionType, PoseQuality};
use crate::geometry::SE3;

/// The pose of one frame.
///
/// Poses are written once per frame and only ever replaced as a whole (e.g. after
/// bundle adjustment under a new map version), never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    /// Camera-to-world transform (T_wc).
    pub world_t_camera: SE3,
    pub quality: PoseQuality,
    pub motion: MotionType,
    /// Version of the localized map the pose was determined with.
    pub map_version: MapVersion,
}

impl CameraPose {
    pub fn new(world_t_camera: SE3, quality: PoseQuality, motion: MotionType, map_version: MapVersion) -> Self {
        Self {
            world_t_camera,
            quality,
            motion,
            map_version,
        }
    }

    /// World-to-camera transform (T_cw).
    #[inline]
    pub fn camera_t_world(&self) -> SE3 {
        self.world_t_camera.inverse()
    }

    /// Camera center in world coordinates.
    #[inline]
    pub fn center(&self) -> Vector3<f64> {
        self.world_t_camera.translation
    }

    /// Whether the pose was computed against `version` of the map.
    #[inline]
    pub fn is_current(&self, version: MapVersion) -> bool {
        self.map_version == version
    }
}
