//! DeepSpeed-style training configuration.
//!
//! Only the fields that shape the offloadable state are modelled; anything
//! else in the document is ignored.

use std::path::{Path, PathBuf};

use kore_core::{DType, Device, HostAlloc};
use serde::{Deserialize, Serialize};

use crate::{CategorySelection, OffloadOptions, StateCategory};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionSection {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadOptimizerSection {
    #[serde(default)]
    pub device: Device,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroSection {
    #[serde(default = "default_stage")]
    pub stage: u8,
    #[serde(default = "default_reduce_bucket_size")]
    pub reduce_bucket_size: usize,
    #[serde(default)]
    pub offload_optimizer: Option<OffloadOptimizerSection>,
}

impl Default for ZeroSection {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            reduce_bucket_size: default_reduce_bucket_size(),
            offload_optimizer: None,
        }
    }
}

/// Defaults for `OffloadEngine::offload` calls made from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadStatesSection {
    #[serde(default)]
    pub device: Device,
    #[serde(default = "default_pin_memory")]
    pub pin_memory: bool,
    /// `None` selects every tracked category.
    #[serde(default)]
    pub include: Option<Vec<StateCategory>>,
}

impl Default for OffloadStatesSection {
    fn default() -> Self {
        Self { device: Device::Cpu, pin_memory: default_pin_memory(), include: None }
    }
}

fn default_stage() -> u8 { 3 }
fn default_reduce_bucket_size() -> usize { 500_000_000 }
fn default_pin_memory() -> bool { true }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub bf16: PrecisionSection,
    #[serde(default)]
    pub fp16: PrecisionSection,
    #[serde(default)]
    pub optimizer: Option<OptimizerSection>,
    #[serde(default)]
    pub zero_optimization: ZeroSection,
    #[serde(default)]
    pub offload_states: OffloadStatesSection,
}

impl TrainingConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zero_optimization.stage != 3 {
            return Err(ConfigError::Invalid(format!(
                "zero_optimization.stage must be 3, got {}",
                self.zero_optimization.stage
            )));
        }
        if self.bf16.enabled && self.fp16.enabled {
            return Err(ConfigError::Invalid("bf16 and fp16 cannot both be enabled".into()));
        }
        if !self.offload_states.device.is_cpu() {
            return Err(ConfigError::Invalid(format!(
                "offload_states.device must be cpu, got {}",
                self.offload_states.device
            )));
        }
        if let Some(section) = &self.zero_optimization.offload_optimizer {
            if !section.device.is_cpu() {
                return Err(ConfigError::Invalid(format!(
                    "zero_optimization.offload_optimizer.device must be cpu, got {}",
                    section.device
                )));
            }
        }
        if self.zero_optimization.reduce_bucket_size == 0 {
            return Err(ConfigError::Invalid("zero_optimization.reduce_bucket_size must be positive".into()));
        }
        Ok(())
    }

    /// Dtype of the low-precision copies. fp32 when neither bf16 nor fp16
    /// is enabled.
    pub fn compute_dtype(&self) -> DType {
        if self.bf16.enabled {
            DType::BF16
        } else if self.fp16.enabled {
            DType::F16
        } else {
            DType::F32
        }
    }

    pub fn has_optimizer(&self) -> bool {
        self.optimizer.is_some()
    }

    /// Optimizer state and master weights already live on the host.
    pub fn optimizer_offloaded(&self) -> bool {
        self.zero_optimization
            .offload_optimizer
            .as_ref()
            .is_some_and(|s| s.device.is_cpu())
    }

    pub fn offload_options(&self) -> OffloadOptions {
        OffloadOptions { host_alloc: HostAlloc::from_pin_memory(self.offload_states.pin_memory) }
    }

    pub fn selection(&self) -> CategorySelection {
        self.offload_states.include.clone().into()
    }
}
