//! Gaussian kernel math shared by every backend.
//!
//! Workers evaluate the kernel in single precision; the `_f64` variants back
//! the sequential reference estimator.

/// `1 / sqrt(2π)`, the peak value `K(0)` of the standard Gaussian kernel.
pub const INV_SQRT_2PI: f32 = 0.398_942_3;

pub const INV_SQRT_2PI_F64: f64 = 0.398_942_280_401_432_7;

/// Standard Gaussian kernel `K(u) = exp(-u²/2) / sqrt(2π)`.
#[inline]
pub fn gaussian(u: f32) -> f32 {
    INV_SQRT_2PI * (-(u.powi(2)) / 2.0).exp()
}

#[inline]
pub fn gaussian_f64(u: f64) -> f64 {
    INV_SQRT_2PI_F64 * (-0.5 * u * u).exp()
}

/// Kernel contribution of sample point `xj` to the density at `query`.
#[inline]
pub fn contribution(query: f32, xj: f32, h: f32) -> f32 {
    gaussian((query - xj) / h)
}

/// Normalisation `1 / (n·h)` applied to every reduced sum.
#[inline]
pub fn scale_factor(n: usize, h: f32) -> f32 {
    1.0 / (n as f32 * h)
}
