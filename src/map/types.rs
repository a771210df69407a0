//! Core identifier and tag types shared by the map structures.

use serde::Serialize;

/// Index of a camera frame, assigned sequentially by the tracker.
pub type FrameIndex = u32;

/// Unique identifier for a point in the map.
///
/// The same identifier is kept when a point track is promoted to a localized
/// point, so tracking data referring to the id stays valid across promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PointId(pub u64);

impl PointId {
    /// Create a new PointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Version of the localized map.
///
/// Incremented exactly once per committed background mutation (bootstrap or
/// bundle adjustment). Poses carry the version they were computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct MapVersion(pub u64);

impl MapVersion {
    /// The version following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MapVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Confidence in the 3D position of a localized point.
///
/// Ordered so that comparisons read naturally: `Invalid < Unknown < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LocalizationPrecision {
    /// The point failed a reprojection check and is kept only for 2D tracking.
    Invalid,
    /// Not enough information to judge (e.g., fresh from bootstrap).
    Unknown,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for LocalizationPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

/// Quality tag of a camera pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PoseQuality {
    Invalid,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for PoseQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

/// Dominant camera motion between the previous and the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum MotionType {
    #[default]
    Unknown,
    Rotational,
    Translational,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_id_display() {
        let id = PointId::new(123);
        assert_eq!(format!("{}", id), "P123");
    }

    #[test]
    fn test_point_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<PointId, &str> = HashMap::new();
        map.insert(PointId::new(1), "first");
        map.insert(PointId::new(2), "second");

        assert_eq!(map.get(&PointId::new(1)), Some(&"first"));
        assert_eq!(map.get(&PointId::new(3)), None);
    }

    #[test]
    fn test_map_version_next() {
        let v = MapVersion::default();
        assert_eq!(v.next(), MapVersion(1));
        assert!(v.next() > v);
    }

    #[test]
    fn test_precision_ordering() {
        assert!(LocalizationPrecision::Invalid < LocalizationPrecision::Unknown);
        assert!(LocalizationPrecision::Unknown < LocalizationPrecision::Low);
        assert!(LocalizationPrecision::Medium < LocalizationPrecision::High);
        assert!(PoseQuality::Low < PoseQuality::Medium);
    }
}
