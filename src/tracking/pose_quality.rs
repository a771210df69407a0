//! Pose quality from the precision of the points a pose was estimated with.

use crate::map::{LocalizationPrecision, PoseQuality};

/// Score at or above which a pose is `High` quality.
pub const HIGH_QUALITY_SCORE: f64 = 50.0;

/// Score at or above which a pose is `Medium` quality.
pub const MEDIUM_QUALITY_SCORE: f64 = 20.0;

/// Accumulates a weighted count of point precisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseQualityCalculator {
    score: f64,
}

impl PoseQualityCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, precision: LocalizationPrecision) {
        self.score += match precision {
            LocalizationPrecision::High => 1.0,
            LocalizationPrecision::Medium => 0.6,
            LocalizationPrecision::Low => 0.3,
            LocalizationPrecision::Unknown => 0.1,
            LocalizationPrecision::Invalid => 0.0,
        };
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn quality(&self) -> PoseQuality {
        if self.score >= HIGH_QUALITY_SCORE {
            PoseQuality::High
        } else if self.score >= MEDIUM_QUALITY_SCORE {
            PoseQuality::Medium
        } else if self.score > 0.0 {
            PoseQuality::Low
        } else {
            PoseQuality::Invalid
        }
    }
}

impl FromIterator<LocalizationPrecision> for PoseQualityCalculator {
    fn from_iter<I: IntoIterator<Item = LocalizationPrecision>>(iter: I) -> Self {
        let mut calculator = Self::new();
        for precision in iter {
            calculator.add_point(precision);
        }
        calculator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_levels() {
        let empty = PoseQualityCalculator::new();
        assert_eq!(empty.quality(), PoseQuality::Invalid);

        let low: PoseQualityCalculator = std::iter::repeat(LocalizationPrecision::Unknown).take(30).collect();
        assert_eq!(low.quality(), PoseQuality::Low);

        let medium: PoseQualityCalculator = std::iter::repeat(LocalizationPrecision::Medium).take(40).collect();
        assert_eq!(medium.quality(), PoseQuality::Medium);

        let high: PoseQualityCalculator = std::iter::repeat(LocalizationPrecision::High).take(50).collect();
        assert_eq!(high.quality(), PoseQuality::High);

        let invalid: PoseQualityCalculator = std::iter::repeat(LocalizationPrecision::Invalid).take(100).collect();
        assert_eq!(invalid.quality(), PoseQuality::Invalid);
    }
}
