//! Map data model: identifiers, poses, point tracks and localized points.

pub mod camera_pose;
pub mod descriptor;
pub mod localized_point;
pub mod point_store;
pub mod point_track;
pub mod poses;
pub mod state;
pub mod types;

pub use camera_pose::CameraPose;
pub use descriptor::Descriptor;
pub use localized_point::LocalizedPoint;
pub use point_store::{PointState, PointStore};
pub use point_track::PointTrack;
pub use poses::CameraPoses;
pub use state::MapState;
pub use types::{FrameIndex, LocalizationPrecision, MapVersion, MotionType, PointId, PoseQuality};
