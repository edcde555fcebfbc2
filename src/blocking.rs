use crate::config::KdeConfig;
use crate::error::Result;
use crate::gpu::GpuKdeAsync;

/// Synchronous front for [`GpuKdeAsync`], driving its futures with `pollster`.
pub struct GpuKde(GpuKdeAsync);

impl GpuKde {
    pub fn new() -> Result<Self> {
        pollster::block_on(GpuKdeAsync::new()).map(Self)
    }

    pub fn with_config(config: &KdeConfig) -> Result<Self> {
        pollster::block_on(GpuKdeAsync::with_config(config)).map(Self)
    }

    pub fn group_width(&self) -> u32 {
        self.0.group_width()
    }

    pub fn estimate(&mut self, x: &[f32], h: f32) -> Result<Vec<f32>> {
        pollster::block_on(self.0.estimate(x, h))
    }

    pub fn estimate_at(&mut self, sample: &[f32], queries: &[f32], h: f32) -> Result<Vec<f32>> {
        pollster::block_on(self.0.estimate_at(sample, queries, h))
    }
}
