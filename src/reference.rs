//! Straightforward sequential estimator in double precision.
//!
//! Used to check the parallel backends and as a baseline in benchmarks.

use crate::kernel::gaussian_f64;

/// Unnormalised kernel sum `Σ_j K((query - x_j)/h)`.
pub fn kernel_sum_f64(sample: &[f32], query: f32, h: f32) -> f64 {
    let (query, h) = (query as f64, h as f64);
    sample
        .iter()
        .map(|&xj| gaussian_f64((query - xj as f64) / h))
        .sum()
}

pub fn estimate_at_f64(sample: &[f32], queries: &[f32], h: f32) -> Vec<f64> {
    let scale = 1.0 / (sample.len() as f64 * h as f64);
    queries
        .iter()
        .map(|&q| kernel_sum_f64(sample, q, h) * scale)
        .collect()
}

/// Density of `x` at each of its own points.
pub fn gaussian_kde_f64(x: &[f32], h: f32) -> Vec<f64> {
    estimate_at_f64(x, x, h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::INV_SQRT_2PI_F64;
    use approx::assert_relative_eq;

    #[test]
    fn identical_points_give_peak_over_h() {
        let y = gaussian_kde_f64(&[2.0; 5], 0.5);
        for v in y {
            assert_relative_eq!(v, INV_SQRT_2PI_F64 / 0.5, max_relative = 1e-12);
        }
    }

    #[test]
    fn separated_points_do_not_interact() {
        let y = gaussian_kde_f64(&[0.0, 10.0], 0.5);
        assert_relative_eq!(y[0], INV_SQRT_2PI_F64, max_relative = 1e-12);
        assert_relative_eq!(y[1], INV_SQRT_2PI_F64, max_relative = 1e-12);
    }
}
