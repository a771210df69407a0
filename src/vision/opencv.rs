//! OpenCV-backed collaborators: pyramidal LK flow, FAST corners and ORB descriptors.

use anyhow::Result;
use nalgebra::Vector2;
use opencv::core::{self, KeyPoint, Mat, Point2f, Rect, Size, TermCriteria, Vector};
use opencv::features2d;
use opencv::prelude::*;
use opencv::video;

use super::{Corner, CornerDetector, DescriptorExtractor, FlowTracker, GrayImage, ImagePyramid, ImageRegion};
use crate::map::Descriptor;

fn to_mat(image: &GrayImage) -> Result<Mat> {
    Ok(Mat::from_slice(&image.data)?
        .reshape(1, image.height as i32)?
        .try_clone()?)
}

fn to_points(points: &[Vector2<f64>]) -> Vector<Point2f> {
    points
        .iter()
        .map(|p| Point2f::new(p.x as f32, p.y as f32))
        .collect()
}

/// Pyramidal Lucas-Kanade tracking.
#[derive(Debug, Clone, Copy)]
pub struct LucasKanadeTracker {
    pub window_size: i32,
    pub max_level: i32,
}

impl Default for LucasKanadeTracker {
    fn default() -> Self {
        Self {
            window_size: 21,
            max_level: 3,
        }
    }
}

impl LucasKanadeTracker {
    fn try_track(
        &self,
        previous: &ImagePyramid,
        current: &ImagePyramid,
        points: &[Vector2<f64>],
        predictions: &[Vector2<f64>],
    ) -> Result<Vec<Option<Vector2<f64>>>> {
        let previous_image = to_mat(previous.finest())?;
        let current_image = to_mat(current.finest())?;
        let previous_points = to_points(points);
        let mut next_points = to_points(predictions);
        let mut status = Vector::<u8>::new();
        let mut errors = Vector::<f32>::new();
        let criteria = TermCriteria::new(
            core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
            30,
            0.01,
        )?;
        video::calc_optical_flow_pyr_lk(
            &previous_image,
            &current_image,
            &previous_points,
            &mut next_points,
            &mut status,
            &mut errors,
            Size::new(self.window_size, self.window_size),
            self.max_level,
            criteria,
            video::OPTFLOW_USE_INITIAL_FLOW,
            1e-4,
        )?;

        Ok(next_points
            .iter()
            .zip(status.iter())
            .map(|(p, ok)| (ok != 0).then(|| Vector2::new(p.x as f64, p.y as f64)))
            .collect())
    }
}

impl FlowTracker for LucasKanadeTracker {
    fn track(
        &self,
        previous: &ImagePyramid,
        current: &ImagePyramid,
        points: &[Vector2<f64>],
        predictions: &[Vector2<f64>],
    ) -> Vec<Option<Vector2<f64>>> {
        if points.is_empty() {
            return Vec::new();
        }
        match self.try_track(previous, current, points, predictions) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("[Flow] LK tracking failed: {}", e);
                vec![None; points.len()]
            }
        }
    }
}

/// FAST corner detection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastCornerDetector;

impl FastCornerDetector {
    fn try_detect(&self, pyramid: &ImagePyramid, threshold: u32, region: Option<&ImageRegion>) -> Result<Vec<Corner>> {
        let image = to_mat(pyramid.finest())?;
        let (offset_x, offset_y, roi) = match region {
            Some(r) => (
                r.left as f32,
                r.top as f32,
                Mat::roi(&image, Rect::new(r.left as i32, r.top as i32, r.width as i32, r.height as i32))?.try_clone()?,
            ),
            None => (0.0, 0.0, image),
        };
        let mut keypoints = Vector::<KeyPoint>::new();
        features2d::fast(&roi, &mut keypoints, threshold as i32, true)?;
        Ok(keypoints
            .iter()
            .map(|kp| Corner {
                position: Vector2::new((kp.pt().x + offset_x) as f64, (kp.pt().y + offset_y) as f64),
                strength: kp.response() as f64,
            })
            .collect())
    }
}

impl CornerDetector for FastCornerDetector {
    fn detect(&self, pyramid: &ImagePyramid, threshold: u32, region: Option<&ImageRegion>) -> Vec<Corner> {
        self.try_detect(pyramid, threshold, region).unwrap_or_else(|e| {
            tracing::warn!("[Detection] FAST failed: {}", e);
            Vec::new()
        })
    }
}

/// ORB (rBRIEF) descriptors, 32 bytes each.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrbDescriptorExtractor;

impl OrbDescriptorExtractor {
    fn try_describe(&self, pyramid: &ImagePyramid, points: &[Vector2<f64>]) -> Result<Vec<Option<Descriptor>>> {
        let image = to_mat(pyramid.finest())?;
        let mut keypoints = Vector::<KeyPoint>::new();
        for (i, p) in points.iter().enumerate() {
            keypoints.push(KeyPoint::new_coords(p.x as f32, p.y as f32, 31.0, -1.0, 0.0, 0, i as i32)?);
        }
        let mut orb = features2d::ORB::create(
            500,
            1.2,
            1,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;
        let mut descriptors = Mat::default();
        orb.compute(&image, &mut keypoints, &mut descriptors)?;

        // compute() drops keypoints it cannot describe, class_id maps back to the input
        let mut result = vec![None; points.len()];
        for (row, kp) in keypoints.iter().enumerate() {
            let mut bytes = [0u8; 32];
            for (j, byte) in bytes.iter_mut().enumerate() {
                *byte = *descriptors.at_2d::<u8>(row as i32, j as i32)?;
            }
            if let Some(slot) = result.get_mut(kp.class_id() as usize) {
                *slot = Some(Descriptor::from_bytes(&bytes));
            }
        }
        Ok(result)
    }
}

impl DescriptorExtractor for OrbDescriptorExtractor {
    fn describe(&self, pyramid: &ImagePyramid, points: &[Vector2<f64>]) -> Vec<Option<Descriptor>> {
        self.try_describe(pyramid, points).unwrap_or_else(|e| {
            tracing::warn!("[Describe] ORB failed: {}", e);
            vec![None; points.len()]
        })
    }
}
