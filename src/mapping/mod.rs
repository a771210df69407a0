//! Background map maintenance, run by the single mapping worker thread.
//!
//! The worker finishes the per-frame job handed over by tracking (new
//! observations, corner detection, snapshot for the next frame) and, once per new
//! frame, maintains the map in a fixed priority order:
//! 1. Bootstrap of the initial map (only while requested)
//! 2. Precision repair of points rejected by pose estimation
//! 3. Relocalization when tracking has no pose for the latest frame
//! 4. Bundle adjustment of key frames
//! 5. Promotion of mature point tracks
//! 6. Descriptor augmentation of precise points
//!
//! Every step computes under the read lock (or without any lock) and commits
//! under the write lock, re-checking the map version first.

mod bootstrap;
mod bundle_adjustment;
mod descriptors;
mod post_frame;
mod promotion;
mod reidentification;
mod relocalization;
mod repair;
mod topology;
mod worker;

pub use bundle_adjustment::BundleState;
pub use topology::{Topology, MAX_KEY_FRAMES, MIN_KEY_FRAMES};
pub use worker::MappingWorker;
