use thiserror::Error;

#[derive(Error, Debug)]
pub enum KdeError {
    #[error("Empty sample: at least one observation is required")]
    EmptySample,

    #[error("Sample length mismatch: expected {n} observations, got {len}")]
    LengthMismatch { n: usize, len: usize },

    #[error("Invalid bandwidth: {0} (must be finite and > 0)")]
    InvalidBandwidth(f32),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("No GPU adapter available")]
    AdapterUnavailable,

    #[error("Could not acquire GPU device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("Out of memory: required={required} bytes, limit={limit} bytes")]
    OutOfMemory { required: u64, limit: u64 },

    #[error("Device allocation failed: {0}")]
    Allocation(String),

    #[error("Launch config too large: {groups} workgroups per query, limit={limit}")]
    LaunchConfigTooLarge { groups: u64, limit: u32 },

    #[error("Kernel launch failed: {0}")]
    Launch(String),

    #[error("Could not read back output: {0}")]
    Transfer(#[from] wgpu::BufferAsyncError),

    #[error("Work channel closed before all queries were submitted")]
    ChannelClosed,

    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("A worker thread panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, KdeError>;
