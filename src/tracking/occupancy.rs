//! Occupancy grid measuring how well the image is covered with tracked points.
//!
//! A point occupies its own bin; a location counts as "covered" if any bin of its
//! 3x3 neighborhood is occupied.

use nalgebra::Vector2;

/// Side length of the neighborhood (in bins) considered around each bin.
pub const NEIGHBORHOOD_SIZE: u32 = 3;

/// Bin layout with roughly `number_bins` square-ish bins for an image.
pub fn ideal_bins(width: u32, height: u32, number_bins: u32) -> (u32, u32) {
    if width == 0 || height == 0 || number_bins == 0 {
        return (0, 0);
    }
    let horizontal = ((number_bins as f64 * width as f64 / height as f64).sqrt().round() as u32).clamp(1, width);
    let vertical = ((number_bins as f64 / horizontal as f64).round() as u32).clamp(1, height);
    (horizontal, vertical)
}

#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    width: f64,
    height: f64,
    horizontal_bins: u32,
    vertical_bins: u32,
    counts: Vec<u32>,
    /// Coverage below which more points are needed.
    min_coverage: f64,
}

impl OccupancyGrid {
    /// Grid for an image of `width`x`height` pixels with `number_bins` ideal bins,
    /// each split by the neighborhood size.
    pub fn new(width: u32, height: u32, number_bins: u32, min_coverage: f64) -> Option<Self> {
        let (horizontal, vertical) = ideal_bins(width, height, number_bins);
        if horizontal == 0 || vertical == 0 {
            return None;
        }
        let horizontal_bins = horizontal * NEIGHBORHOOD_SIZE;
        let vertical_bins = vertical * NEIGHBORHOOD_SIZE;
        Some(Self {
            width: width as f64,
            height: height as f64,
            horizontal_bins,
            vertical_bins,
            counts: vec![0; (horizontal_bins * vertical_bins) as usize],
            min_coverage,
        })
    }

    pub fn horizontal_bins(&self) -> u32 {
        self.horizontal_bins
    }

    pub fn vertical_bins(&self) -> u32 {
        self.vertical_bins
    }

    /// Whether the grid was built for an image of this size.
    pub fn matches_size(&self, width: u32, height: u32) -> bool {
        self.width == width as f64 && self.height == height as f64
    }

    fn bin(&self, point: &Vector2<f64>) -> Option<(u32, u32)> {
        if point.x < 0.0 || point.y < 0.0 || point.x >= self.width || point.y >= self.height {
            return None;
        }
        let x = ((point.x * self.horizontal_bins as f64 / self.width) as u32).min(self.horizontal_bins - 1);
        let y = ((point.y * self.vertical_bins as f64 / self.height) as u32).min(self.vertical_bins - 1);
        Some((x, y))
    }

    fn neighborhood_occupied(&self, x: u32, y: u32) -> bool {
        let radius = NEIGHBORHOOD_SIZE / 2;
        let x0 = x.saturating_sub(radius);
        let y0 = y.saturating_sub(radius);
        let x1 = (x + radius).min(self.horizontal_bins - 1);
        let y1 = (y + radius).min(self.vertical_bins - 1);
        (y0..=y1).any(|yy| (x0..=x1).any(|xx| self.counts[(yy * self.horizontal_bins + xx) as usize] > 0))
    }

    /// Register a point; points outside the image are ignored.
    pub fn add_point(&mut self, point: &Vector2<f64>) {
        if let Some((x, y)) = self.bin(point) {
            self.counts[(y * self.horizontal_bins + x) as usize] += 1;
        }
    }

    /// Register a point only if its neighborhood is still empty.
    pub fn add_point_if_empty(&mut self, point: &Vector2<f64>) -> bool {
        let Some((x, y)) = self.bin(point) else {
            return false;
        };
        if self.neighborhood_occupied(x, y) {
            return false;
        }
        self.counts[(y * self.horizontal_bins + x) as usize] += 1;
        true
    }

    /// Whether the neighborhood of a point already holds a point.
    pub fn is_occupied(&self, point: &Vector2<f64>) -> bool {
        self.bin(point)
            .map_or(true, |(x, y)| self.neighborhood_occupied(x, y))
    }

    /// Fraction of bins whose neighborhood holds at least one point.
    pub fn coverage(&self) -> f64 {
        let total = self.horizontal_bins * self.vertical_bins;
        let covered = (0..self.vertical_bins)
            .flat_map(|y| (0..self.horizontal_bins).map(move |x| (x, y)))
            .filter(|&(x, y)| self.neighborhood_occupied(x, y))
            .count();
        covered as f64 / total as f64
    }

    pub fn need_more_points(&self) -> bool {
        self.coverage() < self.min_coverage
    }

    pub fn clear(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ideal_bins() {
        assert_eq!(ideal_bins(640, 480, 200), (16, 13));
        assert_eq!(ideal_bins(100, 100, 1), (1, 1));
        assert_eq!(ideal_bins(0, 100, 10), (0, 0));
    }

    #[test]
    fn test_neighborhood_blocks_new_points() {
        let mut grid = OccupancyGrid::new(640, 480, 200, 0.8).unwrap();
        assert_eq!((grid.horizontal_bins(), grid.vertical_bins()), (48, 39));

        assert!(grid.add_point_if_empty(&Vector2::new(100.0, 100.0)));
        // bins are ~13x12 px: a point one bin over is inside the neighborhood
        assert!(!grid.add_point_if_empty(&Vector2::new(112.0, 100.0)));
        assert!(grid.add_point_if_empty(&Vector2::new(160.0, 100.0)));
        assert!(!grid.add_point_if_empty(&Vector2::new(-1.0, 100.0)));
    }

    #[test]
    fn test_coverage() {
        let mut grid = OccupancyGrid::new(90, 90, 1, 0.8).unwrap();
        // single ideal bin split into 3x3: one point in the center covers everything
        assert_relative_eq!(grid.coverage(), 0.0);
        assert!(grid.need_more_points());
        grid.add_point(&Vector2::new(45.0, 45.0));
        assert_relative_eq!(grid.coverage(), 1.0);
        assert!(!grid.need_more_points());

        grid.clear();
        grid.add_point(&Vector2::new(1.0, 1.0));
        assert_relative_eq!(grid.coverage(), 4.0 / 9.0);
    }
}
