//! Tracker configuration.

use anyhow::{bail, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::geometry::GravityConstraint;

/// Configuration of the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Lower bound of the adaptive corner detection threshold.
    pub detection_threshold_min: u32,
    /// Upper bound of the adaptive corner detection threshold.
    pub detection_threshold_max: u32,
    /// Threshold used for the first frames.
    pub detection_threshold_initial: u32,

    /// Ideal number of occupancy bins (before splitting each into a 3x3 neighborhood).
    pub number_bins: u32,
    /// Occupancy coverage below which new corners are detected.
    pub min_coverage: f64,
    /// Coverage the detection threshold is steered towards.
    pub target_coverage: f64,

    /// Maximal projection error of an inlier, in pixels.
    pub max_projection_error: f64,

    /// Gravity direction of the world frame.
    pub world_gravity: [f64; 3],
    /// Weight of gravity residuals relative to pixel residuals.
    pub gravity_weight: f64,
    /// Maximal angle between measured and estimated gravity, in degrees.
    pub gravity_max_angle_deg: f64,

    /// Frame intervals (seconds) outside this range disable motion priors.
    pub min_frame_interval: f64,
    pub max_frame_interval: f64,

    /// Forward-backward flow tolerance, in pixels.
    pub flow_tolerance: f64,
    /// Number of pyramid layers built per frame.
    pub pyramid_layers: usize,

    /// Re-identify occluded points among new corners (otherwise detect around each point).
    pub match_corners_to_localized_points: bool,
    /// Record per-frame statistics.
    pub frame_statistics: bool,
    /// Maintain a [`DebugData`](super::DebugData) snapshot while tracking.
    pub debug_data: bool,

    /// Seed of the random generators of both threads.
    pub random_seed: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            detection_threshold_min: 10,
            detection_threshold_max: 40,
            detection_threshold_initial: 25,
            number_bins: 200,
            min_coverage: 0.8,
            target_coverage: 0.4,
            max_projection_error: 3.5,
            world_gravity: [0.0, -1.0, 0.0],
            gravity_weight: 10.0,
            gravity_max_angle_deg: 10.0,
            min_frame_interval: 0.001,
            max_frame_interval: 0.2,
            flow_tolerance: 0.9,
            pyramid_layers: 4,
            match_corners_to_localized_points: true,
            frame_statistics: false,
            debug_data: false,
            random_seed: 0,
        }
    }
}

impl TrackerConfig {
    pub fn world_gravity(&self) -> Vector3<f64> {
        Vector3::from(self.world_gravity)
    }

    pub fn gravity_max_angle(&self) -> f64 {
        self.gravity_max_angle_deg.to_radians()
    }

    /// Constraint for a gravity measured in the camera frame.
    pub fn gravity_constraint(&self, camera_gravity: Vector3<f64>) -> GravityConstraint {
        GravityConstraint::new(
            camera_gravity,
            self.world_gravity(),
            self.gravity_weight,
            self.gravity_max_angle(),
        )
    }

    pub fn max_sqr_projection_error(&self) -> f64 {
        self.max_projection_error * self.max_projection_error
    }

    /// Check that the configuration is consistent.
    pub fn validate(&self) -> Result<()> {
        if self.detection_threshold_min > self.detection_threshold_max {
            bail!(
                "detection threshold range is empty: {} > {}",
                self.detection_threshold_min,
                self.detection_threshold_max
            );
        }
        if !(self.detection_threshold_min..=self.detection_threshold_max).contains(&self.detection_threshold_initial) {
            bail!("initial detection threshold {} outside of range", self.detection_threshold_initial);
        }
        if self.number_bins == 0 {
            bail!("number_bins must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_coverage) || !(0.0..=1.0).contains(&self.target_coverage) {
            bail!("coverage thresholds must be within [0, 1]");
        }
        if self.max_projection_error <= 0.0 || self.flow_tolerance <= 0.0 {
            bail!("error tolerances must be positive");
        }
        if (self.world_gravity().norm() - 1.0).abs() > 1e-6 {
            bail!("world gravity must be a unit vector");
        }
        if self.min_frame_interval <= 0.0 || self.min_frame_interval > self.max_frame_interval {
            bail!("invalid expected frame interval");
        }
        if self.pyramid_layers == 0 {
            bail!("at least one pyramid layer is needed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = TrackerConfig {
            detection_threshold_initial: 50,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TrackerConfig {
            world_gravity: [0.0, -2.0, 0.0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
