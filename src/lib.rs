//! Gaussian kernel density estimation as a two-level parallel reduction.
//!
//! For a sample `x` of `n` points and bandwidth `h`, every query point gets
//! `y_i = 1/(n·h) · Σ_j K((x_i - x_j)/h)` with the standard Gaussian kernel
//! `K`. One worker group reduces one query: its workers evaluate kernel
//! contributions, combine them in group-shared memory between barriers, and
//! the group's first worker hands the sum on to be scaled into the query's
//! output slot.
//!
//! Groups run on a WebGPU device ([`GpuKdeAsync`], or [`blocking::GpuKde`])
//! or on CPU threads ([`cpu`]); [`Estimator`] picks one from a [`KdeConfig`].
//!
//! ```no_run
//! let y = sgpu_kde::gaussian_kde(3, 1.0, &[0.0, 0.0, 0.0])?;
//! assert_eq!(y.len(), 3);
//! # Ok::<(), sgpu_kde::KdeError>(())
//! ```

#[cfg(feature = "blocking")]
use std::sync::{Mutex, PoisonError};

use tracing::info;

pub mod atomic_float;
#[cfg(feature = "blocking")]
pub mod blocking;
pub mod config;
pub mod cpu;
pub mod error;
pub mod gpu;
pub mod kernel;
pub mod prelude;
pub mod reference;

pub use config::{BackendKind, KdeConfig};
pub use error::{KdeError, Result};
pub use gpu::GpuKdeAsync;

/// Checks the preconditions of [`gaussian_kde`]: a non-empty sample of
/// exactly `n` points and a finite, positive bandwidth.
pub fn validate(n: usize, h: f32, x: &[f32]) -> Result<()> {
    if n == 0 {
        return Err(KdeError::EmptySample);
    }
    if x.len() != n {
        return Err(KdeError::LengthMismatch { n, len: x.len() });
    }
    check_bandwidth(h)
}

pub(crate) fn check_sample(sample: &[f32], h: f32) -> Result<()> {
    if sample.is_empty() {
        return Err(KdeError::EmptySample);
    }
    check_bandwidth(h)
}

fn check_bandwidth(h: f32) -> Result<()> {
    if h.is_finite() && h > 0.0 {
        Ok(())
    } else {
        Err(KdeError::InvalidBandwidth(h))
    }
}

enum Engine {
    Cpu,
    #[cfg(feature = "blocking")]
    Gpu(Mutex<blocking::GpuKde>),
}

impl Engine {
    #[cfg(feature = "blocking")]
    fn resolve(config: &KdeConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Cpu => Ok(Engine::Cpu),
            BackendKind::Gpu => blocking::GpuKde::with_config(config).map(|gpu| Engine::Gpu(Mutex::new(gpu))),
            BackendKind::Auto => match blocking::GpuKde::with_config(config) {
                Ok(gpu) => Ok(Engine::Gpu(Mutex::new(gpu))),
                Err(KdeError::AdapterUnavailable) => {
                    tracing::warn!("no GPU adapter found, falling back to CPU worker groups");
                    Ok(Engine::Cpu)
                }
                Err(err) => Err(err),
            },
        }
    }

    #[cfg(not(feature = "blocking"))]
    fn resolve(config: &KdeConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Cpu | BackendKind::Auto => Ok(Engine::Cpu),
            BackendKind::Gpu => Err(KdeError::InvalidConfig(
                "the synchronous GPU backend needs the `blocking` feature; use GpuKdeAsync".to_string(),
            )),
        }
    }
}

/// Runs density estimates on the backend chosen by its [`KdeConfig`].
///
/// The GPU device, when one is used, is acquired once in [`Estimator::new`]
/// and reused by every estimate. Concurrent GPU estimates through a shared
/// `Estimator` run one at a time.
pub struct Estimator {
    config: KdeConfig,
    engine: Engine,
}

impl Estimator {
    pub fn new(config: KdeConfig) -> Result<Self> {
        config.validate()?;
        let engine = Engine::resolve(&config)?;
        let estimator = Self { config, engine };
        info!(backend = ?estimator.backend(), "density estimator ready");
        Ok(estimator)
    }

    pub fn config(&self) -> &KdeConfig {
        &self.config
    }

    /// The backend actually in use; never [`BackendKind::Auto`].
    pub fn backend(&self) -> BackendKind {
        match self.engine {
            Engine::Cpu => BackendKind::Cpu,
            #[cfg(feature = "blocking")]
            Engine::Gpu(_) => BackendKind::Gpu,
        }
    }

    /// Density of `x` at each of its own points. `y[i]` corresponds to `x[i]`.
    pub fn estimate(&self, n: usize, h: f32, x: &[f32]) -> Result<Vec<f32>> {
        validate(n, h, x)?;
        self.estimate_at(x, x, h)
    }

    /// Density of `sample` evaluated at arbitrary `queries`.
    pub fn estimate_at(&self, sample: &[f32], queries: &[f32], h: f32) -> Result<Vec<f32>> {
        match &self.engine {
            Engine::Cpu => cpu::estimate_at(sample, queries, h, &self.config),
            #[cfg(feature = "blocking")]
            Engine::Gpu(gpu) => gpu
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .estimate_at(sample, queries, h),
        }
    }
}

/// Estimates the density of `x` at each of its `n` points with bandwidth `h`.
///
/// Inputs are validated before any device is touched. The result is either
/// the complete vector of `n` densities or an error; no partial output is
/// returned.
pub fn gaussian_kde(n: usize, h: f32, x: &[f32]) -> Result<Vec<f32>> {
    validate(n, h, x)?;
    Estimator::new(KdeConfig::default())?.estimate(n, h, x)
}
