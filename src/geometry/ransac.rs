//! Small RANSAC helpers shared by the geometric solvers.

use rand::{Rng, RngCore};

/// Success probability used to derive adaptive iteration counts.
pub const RANSAC_PROBABILITY: f64 = 0.99;

/// Sample `k` unique random indices out of `0..n`.
///
/// `k` must not exceed `n`.
pub fn sample_unique_indices(rng: &mut dyn RngCore, n: usize, k: usize) -> Vec<usize> {
    debug_assert!(k <= n);
    let mut indices = Vec::with_capacity(k);
    while indices.len() < k.min(n) {
        let candidate = rng.gen_range(0..n);
        if !indices.contains(&candidate) {
            indices.push(candidate);
        }
    }
    indices
}

/// Number of iterations needed to draw one outlier-free sample with `probability`.
///
/// `k = log(1 - p) / log(1 - w^n)` with `w` the inlier ratio and `n` the sample size.
pub fn adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return usize::MAX;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

/// Median of a slice (upper median for even lengths); `None` if empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(sorted[sorted.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_unique_sampling() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let mut sample = sample_unique_indices(&mut rng, 8, 6);
            assert_eq!(sample.len(), 6);
            sample.sort_unstable();
            sample.dedup();
            assert_eq!(sample.len(), 6);
            assert!(sample.iter().all(|&i| i < 8));
        }
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(adaptive_iterations(1.0, 0.99, 3), 1);
        assert_eq!(adaptive_iterations(0.0, 0.99, 3), usize::MAX);
        // 0.5^3 = 0.125 -> log(0.01) / log(0.875) ~ 34.5
        assert_eq!(adaptive_iterations(0.5, 0.99, 3), 35);
        assert!(adaptive_iterations(0.15, 0.99, 3) > 1000);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(3.0));
    }
}
