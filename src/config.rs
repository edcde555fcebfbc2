use serde::{Deserialize, Serialize};

use crate::error::{KdeError, Result};

/// Workgroup width of the reduction kernel when none is configured.
pub const DEFAULT_GROUP_WIDTH: u32 = 256;

/// Worker threads sharing one accumulator on the CPU backend.
pub const DEFAULT_WORKERS_PER_GROUP: usize = 4;

/// Which execution backend runs the reduction groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// GPU when an adapter is found, CPU worker groups otherwise.
    #[default]
    Auto,
    Gpu,
    Cpu,
}

/// Tuning knobs for an [`Estimator`](crate::Estimator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdeConfig {
    pub backend: BackendKind,
    /// Invocations per GPU workgroup.
    pub group_width: u32,
    /// Threads per CPU worker group.
    pub workers_per_group: usize,
    /// CPU worker groups running concurrently, each on its own lane.
    pub lanes: usize,
}

impl Default for KdeConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            backend: BackendKind::Auto,
            group_width: DEFAULT_GROUP_WIDTH,
            workers_per_group: DEFAULT_WORKERS_PER_GROUP,
            lanes: (threads / DEFAULT_WORKERS_PER_GROUP).max(1),
        }
    }
}

impl KdeConfig {
    pub fn cpu() -> Self {
        Self {
            backend: BackendKind::Cpu,
            ..Self::default()
        }
    }

    pub fn gpu() -> Self {
        Self {
            backend: BackendKind::Gpu,
            ..Self::default()
        }
    }

    pub fn with_group_width(mut self, group_width: u32) -> Self {
        self.group_width = group_width;
        self
    }

    pub fn with_workers_per_group(mut self, workers: usize) -> Self {
        self.workers_per_group = workers;
        self
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    /// Rejects values no backend can run with. Device-specific limits are
    /// checked again once an adapter is known.
    pub fn validate(&self) -> Result<()> {
        if self.group_width == 0 {
            return Err(KdeError::InvalidConfig(
                "group_width must be at least 1".to_string(),
            ));
        }
        if self.workers_per_group == 0 {
            return Err(KdeError::InvalidConfig(
                "workers_per_group must be at least 1".to_string(),
            ));
        }
        if self.lanes == 0 {
            return Err(KdeError::InvalidConfig(
                "lanes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = KdeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::Auto);
        assert_eq!(config.group_width, 256);
        assert!(config.lanes >= 1);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for config in [
            KdeConfig::cpu().with_group_width(0),
            KdeConfig::cpu().with_workers_per_group(0),
            KdeConfig::cpu().with_lanes(0),
        ] {
            assert!(matches!(config.validate(), Err(KdeError::InvalidConfig(_))));
        }
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: KdeConfig =
            serde_json::from_str(r#"{ "backend": "cpu", "workers_per_group": 8 }"#).unwrap();
        assert_eq!(config.backend, BackendKind::Cpu);
        assert_eq!(config.workers_per_group, 8);
        assert_eq!(config.group_width, DEFAULT_GROUP_WIDTH);
    }
}
