//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs the tracker in the caller's thread and
//! spawns the mapping worker thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::info;

use crate::map::CameraPose;
use crate::mapping::MappingWorker;
use crate::tracking::{DebugData, FrameInput, FrameStatistics, PerformanceStatistics, Tracker, TrackerConfig, TrackerState};

use super::collaborators::Collaborators;
use super::handoff::handoff;
use super::shared_state::SharedState;

/// Monocular SLAM system: tracking in the caller's thread, map maintenance in a worker thread.
pub struct SlamSystem {
    /// Shared state (map, flags) accessible by both threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the calling thread.
    tracker: Tracker,

    /// Handle to the mapping worker thread.
    mapping_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Create a new SLAM system.
    ///
    /// This validates the configuration, creates the shared state and spawns the mapping thread.
    pub fn new(config: TrackerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate().context("invalid tracker configuration")?;
        if !collaborators.camera().is_valid() {
            anyhow::bail!("invalid camera model");
        }

        let shared = SharedState::new();
        let collaborators = Arc::new(collaborators);
        let (frame_handoff, port) = handoff();

        let mut worker = MappingWorker::new(config.clone(), collaborators.clone(), shared.clone());
        let mapping_handle = thread::Builder::new()
            .name("mapping".to_string())
            .spawn(move || worker.run(port))
            .context("failed to spawn the mapping thread")?;

        let tracker = Tracker::new(config, collaborators, shared.clone(), frame_handoff);
        info!("[System] started");

        Ok(Self {
            shared,
            tracker,
            mapping_handle: Some(mapping_handle),
        })
    }

    /// Process one frame and return its pose, if one could be determined.
    ///
    /// Blocks while the worker still processes the previous frame.
    pub fn handle_frame(&mut self, input: FrameInput) -> Result<Option<CameraPose>> {
        self.tracker.handle_frame(input)
    }

    pub fn state(&self) -> TrackerState {
        self.tracker.state()
    }

    /// Snapshot of tracks and points (empty unless enabled in the configuration).
    pub fn debug_data(&self) -> DebugData {
        self.tracker.debug_data()
    }

    /// Statistics of all frames so far (empty unless enabled in the configuration).
    pub fn frame_statistics(&self) -> &[FrameStatistics] {
        self.tracker.frame_statistics()
    }

    pub fn performance(&self) -> PerformanceStatistics {
        self.shared.performance()
    }

    /// Human-readable timing report of both threads.
    pub fn performance_report(&self) -> String {
        self.shared.performance_report()
    }

    /// Get a reference to the shared state.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals the mapping thread to finish and waits for it. The worker only
    /// checks the flag between two steps, so a running step completes first.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.mapping_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("[System] mapping thread panicked");
            }
            info!("[System] stopped");
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}
