//! Image input and the image-processing collaborators of the tracker.
//!
//! The tracker does not detect, describe or track features itself. It relies on
//! the traits below, which operate on an [`ImagePyramid`].

#[cfg(feature = "opencv")]
pub mod opencv;
pub mod pyramid;

use nalgebra::Vector2;

use crate::map::Descriptor;
pub use pyramid::{GrayImage, ImagePyramid};

/// A detected corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub position: Vector2<f64>,
    pub strength: f64,
}

/// Axis-aligned pixel region of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRegion {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageRegion {
    /// Region of `size`x`size` centered at `center`, clipped to the image.
    pub fn centered(center: &Vector2<f64>, size: u32, image_width: u32, image_height: u32) -> Option<Self> {
        let half = size as f64 * 0.5;
        let left = (center.x - half).max(0.0).floor();
        let top = (center.y - half).max(0.0).floor();
        let right = (center.x + half).min(image_width as f64).floor();
        let bottom = (center.y + half).min(image_height as f64).floor();
        if right <= left || bottom <= top {
            return None;
        }
        Some(Self {
            left: left as u32,
            top: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
        })
    }

    pub fn contains(&self, point: &Vector2<f64>) -> bool {
        point.x >= self.left as f64
            && point.y >= self.top as f64
            && point.x < (self.left + self.width) as f64
            && point.y < (self.top + self.height) as f64
    }
}

/// Sparse frame-to-frame point tracking.
pub trait FlowTracker: Send + Sync {
    /// Track `points` from `previous` into `current`.
    ///
    /// `predictions` holds one starting location per point in `current`. The result
    /// has one entry per point, `None` where tracking failed.
    fn track(
        &self,
        previous: &ImagePyramid,
        current: &ImagePyramid,
        points: &[Vector2<f64>],
        predictions: &[Vector2<f64>],
    ) -> Vec<Option<Vector2<f64>>>;
}

/// Corner detection with a strength threshold.
pub trait CornerDetector: Send + Sync {
    /// Detect corners in the whole image or, if given, inside `region` only.
    fn detect(&self, pyramid: &ImagePyramid, threshold: u32, region: Option<&ImageRegion>) -> Vec<Corner>;
}

/// Fixed-length binary descriptors.
pub trait DescriptorExtractor: Send + Sync {
    /// One descriptor per point, `None` where no descriptor can be computed (e.g. near the border).
    fn describe(&self, pyramid: &ImagePyramid, points: &[Vector2<f64>]) -> Vec<Option<Descriptor>>;
}
