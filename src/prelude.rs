//! Common re-exports for the crate.

#[cfg(feature = "blocking")]
pub use crate::blocking::GpuKde;

pub use crate::config::{BackendKind, KdeConfig};
pub use crate::error::{KdeError, Result};
pub use crate::gpu::GpuKdeAsync;
pub use crate::{gaussian_kde, Estimator};
