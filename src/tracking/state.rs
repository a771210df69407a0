//! Tracker state machine.

use std::sync::atomic::{AtomicU8, Ordering};

/// State of the tracker.
///
/// Moves forward `Unknown -> Initializing -> Tracking`; a map reset returns to
/// `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerState {
    /// No frame processed yet.
    #[default]
    Unknown,
    /// Waiting for the initial map.
    Initializing,
    /// Poses are determined from the map.
    Tracking,
}

impl TrackerState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Initializing => 1,
            Self::Tracking => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Tracking,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Initializing => "initializing",
            Self::Tracking => "tracking",
        };
        f.write_str(name)
    }
}

/// A [`TrackerState`] readable from both threads.
#[derive(Debug, Default)]
pub struct AtomicTrackerState(AtomicU8);

impl AtomicTrackerState {
    pub fn new(state: TrackerState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn load(&self) -> TrackerState {
        TrackerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: TrackerState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_roundtrip() {
        let state = AtomicTrackerState::default();
        assert_eq!(state.load(), TrackerState::Unknown);
        state.store(TrackerState::Tracking);
        assert_eq!(state.load(), TrackerState::Tracking);
        state.store(TrackerState::Initializing);
        assert_eq!(state.load(), TrackerState::Initializing);
    }
}
