//! Fixed-length binary descriptors used for re-identification.

/// Number of bits of a [`Descriptor`].
pub const DESCRIPTOR_BITS: u32 = 256;

/// Maximal Hamming distance (exclusive) for two descriptors to be considered a match,
/// roughly 35% of all bits.
pub const DESCRIPTOR_MATCH_THRESHOLD: u32 = DESCRIPTOR_BITS * 35 / 100;

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    /// Hamming distance to another descriptor.
    #[inline]
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Build a descriptor from 32 raw bytes (e.g., an ORB row), little-endian per word.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self(words)
    }
}

/// Smallest distance between `descriptor` and any of `candidates`, if there are candidates.
pub fn best_distance(descriptor: &Descriptor, candidates: &[Descriptor]) -> Option<u32> {
    candidates.iter().map(|c| descriptor.distance(c)).min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 3 + 64);
        assert_eq!(b.distance(&a), a.distance(&b));
    }

    #[test]
    fn test_threshold_is_35_percent() {
        assert_eq!(DESCRIPTOR_MATCH_THRESHOLD, 89);
    }

    #[test]
    fn test_from_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        bytes[8] = 2;
        let d = Descriptor::from_bytes(&bytes);
        assert_eq!(d.0, [1, 2, 0, 0]);
    }

    #[test]
    fn test_best_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let candidates = [Descriptor([0xff, 0, 0, 0]), Descriptor([0x1, 0, 0, 0])];
        assert_eq!(best_distance(&a, &candidates), Some(1));
        assert_eq!(best_distance(&a, &[]), None);
    }
}
