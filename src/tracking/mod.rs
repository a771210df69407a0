//! Tracking: the per-frame work done in the caller's thread.
//!
//! - Frame-to-frame tracking of all points of the previous frame
//! - Pose estimation from tracked localized points
//! - State machine (unknown, initializing, tracking)
//! - Occupancy grid and statistics used by the mapping worker

pub mod config;
pub mod correspondences;
pub mod occupancy;
pub mod pose_correspondences;
pub mod pose_quality;
pub mod state;
pub mod statistics;
pub mod tracker;

pub use config::TrackerConfig;
pub use correspondences::TrackingCorrespondences;
pub use occupancy::OccupancyGrid;
pub use pose_correspondences::PoseCorrespondences;
pub use pose_quality::PoseQualityCalculator;
pub use state::TrackerState;
pub use statistics::{DebugData, FrameStatistics, PerformanceStatistics, Timer};
pub use tracker::{FrameInput, Tracker};
