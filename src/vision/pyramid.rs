//! 8-bit luma images and image pyramids.

use anyhow::{bail, Result};

/// Smallest layer side length kept in a pyramid.
const MIN_LAYER_SIZE: u32 = 16;

/// A grayscale image, row-major, without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() != width as usize * height as usize {
            bail!(
                "image buffer has {} bytes, expected {}x{}",
                data.len(),
                width,
                height
            );
        }
        Ok(Self { width, height, data })
    }

    /// A black image.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize],
        }
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Half-size image, each pixel the average of a 2x2 block.
    pub fn downsample(&self) -> GrayImage {
        let width = self.width / 2;
        let height = self.height / 2;
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let sum = self.pixel(2 * x, 2 * y) as u32
                    + self.pixel(2 * x + 1, 2 * y) as u32
                    + self.pixel(2 * x, 2 * y + 1) as u32
                    + self.pixel(2 * x + 1, 2 * y + 1) as u32;
                data.push(((sum + 2) / 4) as u8);
            }
        }
        GrayImage { width, height, data }
    }
}

/// An image pyramid of one frame; layer 0 is the full resolution image.
///
/// Pyramids are shared behind `Arc` between the caller and the background worker
/// and released once neither needs them.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    pub frame_index: u32,
    /// Timestamp in seconds.
    pub timestamp: f64,
    layers: Vec<GrayImage>,
}

impl ImagePyramid {
    /// Build a pyramid with at most `max_layers` layers.
    pub fn new(frame_index: u32, timestamp: f64, image: GrayImage, max_layers: usize) -> Self {
        let mut layers = vec![image];
        while layers.len() < max_layers.max(1) {
            let Some(last) = layers.last() else { break };
            if last.width / 2 < MIN_LAYER_SIZE || last.height / 2 < MIN_LAYER_SIZE {
                break;
            }
            let next = last.downsample();
            layers.push(next);
        }
        Self {
            frame_index,
            timestamp,
            layers,
        }
    }

    pub fn finest(&self) -> &GrayImage {
        &self.layers[0]
    }

    pub fn layer(&self, index: usize) -> Option<&GrayImage> {
        self.layers.get(index)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn width(&self) -> u32 {
        self.layers[0].width
    }

    pub fn height(&self) -> u32 {
        self.layers[0].height
    }
}
