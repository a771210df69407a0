//! Arena holding every map point, tracked or localized.
//!
//! Each identifier maps to exactly one [`PointState`], so a point can never be a
//! track and a localized point at the same time. Promotion replaces the state in
//! place and keeps the identifier.

use std::collections::HashMap;

use nalgebra::{Vector2, Vector3};

use super::localized_point::LocalizedPoint;
use super::point_track::PointTrack;
use super::types::{FrameIndex, LocalizationPrecision, PointId};

/// State of a single map point.
#[derive(Debug, Clone)]
pub enum PointState {
    /// 2D-only, waiting for enough baseline to be triangulated.
    Track(PointTrack),
    /// Has a 3D position.
    Localized(LocalizedPoint),
}

/// All points of the map, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct PointStore {
    points: HashMap<PointId, PointState>,
    next_id: u64,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new track and return its identifier.
    pub fn add_track(&mut self, track: PointTrack) -> PointId {
        let id = PointId::new(self.next_id);
        self.next_id += 1;
        self.points.insert(id, PointState::Track(track));
        id
    }

    pub fn get(&self, id: PointId) -> Option<&PointState> {
        self.points.get(&id)
    }

    pub fn track(&self, id: PointId) -> Option<&PointTrack> {
        match self.points.get(&id) {
            Some(PointState::Track(track)) => Some(track),
            _ => None,
        }
    }

    pub fn track_mut(&mut self, id: PointId) -> Option<&mut PointTrack> {
        match self.points.get_mut(&id) {
            Some(PointState::Track(track)) => Some(track),
            _ => None,
        }
    }

    pub fn localized(&self, id: PointId) -> Option<&LocalizedPoint> {
        match self.points.get(&id) {
            Some(PointState::Localized(point)) => Some(point),
            _ => None,
        }
    }

    pub fn localized_mut(&mut self, id: PointId) -> Option<&mut LocalizedPoint> {
        match self.points.get_mut(&id) {
            Some(PointState::Localized(point)) => Some(point),
            _ => None,
        }
    }

    pub fn is_track(&self, id: PointId) -> bool {
        matches!(self.points.get(&id), Some(PointState::Track(_)))
    }

    pub fn is_localized(&self, id: PointId) -> bool {
        matches!(self.points.get(&id), Some(PointState::Localized(_)))
    }

    /// Promote a track to a localized point; false if `id` is not a track.
    pub fn promote(
        &mut self,
        id: PointId,
        position: Vector3<f64>,
        precision: LocalizationPrecision,
        bundle_adjusted: bool,
    ) -> bool {
        let Some(PointState::Track(track)) = self.points.get(&id) else {
            return false;
        };
        let point = LocalizedPoint::from_track(track, position, precision, bundle_adjusted);
        self.points.insert(id, PointState::Localized(point));
        true
    }

    /// Insert a localized point under an existing identifier (used when restoring a snapshot).
    pub fn insert_localized(&mut self, id: PointId, point: LocalizedPoint) {
        self.next_id = self.next_id.max(id.0 + 1);
        self.points.insert(id, PointState::Localized(point));
    }

    pub fn remove(&mut self, id: PointId) -> Option<PointState> {
        self.points.remove(&id)
    }

    /// Append an observation to a track or a localized point.
    pub fn add_observation(&mut self, id: PointId, frame: FrameIndex, image_point: Vector2<f64>) -> bool {
        match self.points.get_mut(&id) {
            Some(PointState::Track(track)) => track.add_observation(frame, image_point),
            Some(PointState::Localized(point)) => point.add_observation(frame, image_point),
            None => false,
        }
    }

    /// Latest observation of a point at `frame`, whatever its state.
    pub fn observation(&self, id: PointId, frame: FrameIndex) -> Option<Vector2<f64>> {
        match self.points.get(&id)? {
            PointState::Track(track) => track.observation(frame),
            PointState::Localized(point) => point.observation(frame),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = (PointId, &PointTrack)> {
        self.points.iter().filter_map(|(id, state)| match state {
            PointState::Track(track) => Some((*id, track)),
            PointState::Localized(_) => None,
        })
    }

    pub fn localized_points(&self) -> impl Iterator<Item = (PointId, &LocalizedPoint)> {
        self.points.iter().filter_map(|(id, state)| match state {
            PointState::Localized(point) => Some((*id, point)),
            PointState::Track(_) => None,
        })
    }

    pub fn localized_points_mut(&mut self) -> impl Iterator<Item = (PointId, &mut LocalizedPoint)> {
        self.points.iter_mut().filter_map(|(id, state)| match state {
            PointState::Localized(point) => Some((*id, point)),
            PointState::Track(_) => None,
        })
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks().count()
    }

    pub fn num_localized(&self) -> usize {
        self.localized_points().count()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Discard all 3D information.
    ///
    /// Localized points still observed at `latest_frame` fall back to tracks built
    /// from their contiguous observation tail, so frame-to-frame tracking
    /// continues; all other localized points are removed. Tracks are kept.
    pub fn reset_localized(&mut self, latest_frame: FrameIndex) {
        self.points.retain(|_, state| match state {
            PointState::Track(_) => true,
            PointState::Localized(point) => point.is_observed_at(latest_frame),
        });
        for state in self.points.values_mut() {
            if let PointState::Localized(point) = state {
                let tail = point.contiguous_tail();
                let first_frame = tail.first().map(|(frame, _)| *frame).unwrap_or(latest_frame);
                let image_points = tail.into_iter().map(|(_, p)| p).collect();
                if let Some(track) = PointTrack::from_observations(first_frame, image_points) {
                    *state = PointState::Track(track);
                }
            }
        }
    }
}
