//! Model registry and cache configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::ModelId;

/// Where a model executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    #[default]
    Cpu,
    Gpu,
    Npu,
}

/// Load priority. `High` models are pinned when warmed up.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Registry entry for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModelSpec {
    pub size_bytes: u64,
    #[serde(default)]
    pub backend: ExecutionBackend,
    #[serde(default)]
    pub priority: ModelPriority,
    /// Load at startup.
    #[serde(default)]
    pub warmup: bool,
}

impl ModelSpec {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            size_bytes,
            backend: ExecutionBackend::default(),
            priority: ModelPriority::default(),
            warmup: false,
        }
    }

    pub fn with_priority(mut self, priority: ModelPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_warmup(mut self) -> Self {
        self.warmup = true;
        self
    }
}

/// Model cache capacity and registry, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModelCacheConfig {
    /// Upper bound on the summed size of resident models.
    pub capacity_bytes: u64,
    pub registry: BTreeMap<ModelId, ModelSpec>,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 2000 * 1024 * 1024,
            registry: BTreeMap::new(),
        }
    }
}

impl ModelCacheConfig {
    pub fn with_model(mut self, id: &str, spec: ModelSpec) -> Self {
        self.registry.insert(ModelId::must(id), spec);
        self
    }
}
