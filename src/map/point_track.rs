//! 2D-only observation history of a point that has no 3D position yet.

use nalgebra::Vector2;

use super::types::FrameIndex;

/// Observations of a point in consecutive frames.
///
/// A track has no gaps: the point was seen in every frame from `first_frame` to
/// [`last_frame`](Self::last_frame).
#[derive(Debug, Clone, PartialEq)]
pub struct PointTrack {
    first_frame: FrameIndex,
    image_points: Vec<Vector2<f64>>,
}

impl PointTrack {
    /// Start a track with a single observation.
    pub fn new(frame: FrameIndex, image_point: Vector2<f64>) -> Self {
        Self {
            first_frame: frame,
            image_points: vec![image_point],
        }
    }

    /// Build a track from an existing contiguous history; `None` if empty.
    pub fn from_observations(first_frame: FrameIndex, image_points: Vec<Vector2<f64>>) -> Option<Self> {
        (!image_points.is_empty()).then_some(Self {
            first_frame,
            image_points,
        })
    }

    pub fn first_frame(&self) -> FrameIndex {
        self.first_frame
    }

    pub fn last_frame(&self) -> FrameIndex {
        self.first_frame + self.image_points.len() as FrameIndex - 1
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    /// Append the observation of the frame following the last one.
    ///
    /// Returns false (and ignores the observation) if `frame` would leave a gap.
    pub fn add_observation(&mut self, frame: FrameIndex, image_point: Vector2<f64>) -> bool {
        debug_assert_eq!(frame, self.last_frame() + 1);
        if frame != self.last_frame() + 1 {
            return false;
        }
        self.image_points.push(image_point);
        true
    }

    pub fn observation(&self, frame: FrameIndex) -> Option<Vector2<f64>> {
        if frame < self.first_frame {
            return None;
        }
        self.image_points.get((frame - self.first_frame) as usize).copied()
    }

    pub fn last_observation(&self) -> Vector2<f64> {
        self.image_points[self.image_points.len() - 1]
    }

    /// All observations in frame order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (FrameIndex, Vector2<f64>)> + '_ {
        self.image_points
            .iter()
            .enumerate()
            .map(move |(i, p)| (self.first_frame + i as FrameIndex, *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_observations() {
        let mut track = PointTrack::new(5, Vector2::new(1.0, 2.0));
        assert!(track.add_observation(6, Vector2::new(1.5, 2.0)));
        assert!(track.add_observation(7, Vector2::new(2.0, 2.0)));

        assert_eq!(track.len(), 3);
        assert_eq!(track.first_frame(), 5);
        assert_eq!(track.last_frame(), 7);
        assert_eq!(track.observation(6), Some(Vector2::new(1.5, 2.0)));
        assert_eq!(track.observation(4), None);
        assert_eq!(track.observation(8), None);

        let frames: Vec<FrameIndex> = track.iter().map(|(f, _)| f).collect();
        assert_eq!(frames, vec![5, 6, 7]);
    }

    #[test]
    fn test_from_empty_history() {
        assert!(PointTrack::from_observations(3, Vec::new()).is_none());
    }
}
