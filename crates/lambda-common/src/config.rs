//! Worker configuration. Loaded from a JSON file; every field has a default
//! so partial configs are fine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, WorkerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How long a successful registry check suppresses the next one, in
    /// milliseconds.
    pub registry_cache_ms: u64,
    pub limits: LimitsConfig,
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global per-request limit in milliseconds; `<= 0` disables it.
    pub max_timeout_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Try the import cache before the sandbox pool when creating sandboxes.
    pub import_cache: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            registry_cache_ms: 5000,
            limits: LimitsConfig::default(),
            features: FeaturesConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_timeout_ms: 0 }
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self { import_cache: true }
    }
}

impl WorkerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| WorkerError::Config(e.to_string()))
    }
}
