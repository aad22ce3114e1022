//! Configuration structures.
//!
//! Configuration is loaded from a JSON file with environment overrides. Every
//! section has defaults so a partial file (or none at all) is valid.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use crate::kernel::cleanup::CleanupConfig;
use crate::kernel::launcher::LauncherConfig;
use crate::kernel::rate_limiter::RateLimitConfig;
use crate::kernel::types::SupervisorConfig;
use crate::models::registry::ModelCacheConfig;
use crate::orchestrator::kinds::OrchestratorConfig;

/// Global host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct HostConfig {
    /// Wire transport configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Router limits and timeouts.
    #[serde(default)]
    pub router: RouterConfig,

    /// Per-(process, message type) admission windows.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Process supervision.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Model cache capacity and registry.
    #[serde(default)]
    pub models: ModelCacheConfig,

    /// Orchestrated request kinds and result caching.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Background cleanup.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// OS process launch commands per role.
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl HostConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: HostConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config {}: {}", path.display(), e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = HostConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SWITCHYARD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SWITCHYARD_LISTEN_ADDR") {
            if !addr.is_empty() {
                self.server.listen_addr = addr;
            }
        }
        if let Ok(capacity) = std::env::var("SWITCHYARD_MODEL_CAPACITY_BYTES") {
            match capacity.parse::<u64>() {
                Ok(bytes) => self.models.capacity_bytes = bytes,
                Err(e) => tracing::warn!(
                    value = %capacity,
                    error = %e,
                    "ignoring invalid SWITCHYARD_MODEL_CAPACITY_BYTES"
                ),
            }
        }
        if let Ok(format) = std::env::var("SWITCHYARD_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
    }

    /// Reject configurations that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.router.max_envelope_bytes == 0 {
            return Err(Error::config("router.max_envelope_bytes must be positive"));
        }
        if self.router.default_request_timeout > self.router.max_request_timeout {
            return Err(Error::config(
                "router.default_request_timeout exceeds router.max_request_timeout",
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::config("rate_limit.window must be non-zero"));
        }
        if self.supervisor.health_timeout <= self.supervisor.health_check_interval {
            return Err(Error::config(
                "supervisor.health_timeout must exceed supervisor.health_check_interval",
            ));
        }
        for (id, spec) in &self.models.registry {
            if spec.size_bytes > self.models.capacity_bytes && spec.warmup {
                return Err(Error::config(format!(
                    "model {} is flagged warmup but exceeds cache capacity",
                    id
                )));
            }
        }
        for kind in &self.orchestrator.kinds {
            if kind.facets.is_empty() {
                return Err(Error::config(format!(
                    "request kind {} has no facets",
                    kind.name
                )));
            }
        }
        Ok(())
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(HostConfig)).unwrap_or(serde_json::Value::Null)
    }
}

/// Wire transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ServerConfig {
    /// Address worker processes connect to (TCP).
    pub listen_addr: String,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent worker connections.
    pub max_connections: usize,

    /// A connection must announce itself within this window.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub hello_timeout: Duration,

    /// Slow consumers that cannot accept a frame within this window are dropped.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:47100".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
            max_connections: 256,
            hello_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// What to do with a reply whose request already timed out or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LateReplyPolicy {
    /// Drop it and log a warning.
    #[default]
    Log,
    /// Drop it silently (counted in router stats only).
    Discard,
}

/// Router limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RouterConfig {
    /// Ceiling on the encoded inline size of an envelope.
    pub max_envelope_bytes: usize,

    /// Timeout applied when the caller does not supply one.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub default_request_timeout: Duration,

    /// Caller-supplied timeouts are capped to this value.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub max_request_timeout: Duration,

    pub late_reply_policy: LateReplyPolicy,

    /// Outbound batching for wire-attached processes.
    pub batch: BatchConfig,

    /// Optional JSON Schemas keyed by message type, checked against payloads.
    pub message_schemas: BTreeMap<String, serde_json::Value>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_envelope_bytes: 1024 * 1024,
            default_request_timeout: Duration::from_secs(5),
            max_request_timeout: Duration::from_secs(30),
            late_reply_policy: LateReplyPolicy::Log,
            batch: BatchConfig::default(),
            message_schemas: BTreeMap::new(),
        }
    }
}

/// Batcher thresholds. A batch is flushed when any threshold is reached.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BatchConfig {
    pub max_envelopes: usize,
    pub max_bytes: usize,
    /// Maximum time the first buffered envelope waits.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_envelopes: 64,
            max_bytes: 256 * 1024,
            flush_interval: Duration::from_millis(5),
        }
    }
}
