//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs tracking and
//! spawns the mapping worker, along with the shared state, the frame handoff
//! between both threads and the collaborators they use.

pub mod collaborators;
pub mod handoff;
pub mod shared_state;
mod slam_system;

pub use collaborators::Collaborators;
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
