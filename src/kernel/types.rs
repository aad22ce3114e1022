//! Kernel types: ProcessRole, ProcessState, ProcessRecord, role profiles.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{ProcessId, SessionId};

/// Functional category of a process. Determines its capability profile.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Host,
    Renderer,
    Graphics,
    ModelExec,
    Utility,
}

impl ProcessRole {
    pub const ALL: [ProcessRole; 5] = [
        ProcessRole::Host,
        ProcessRole::Renderer,
        ProcessRole::Graphics,
        ProcessRole::ModelExec,
        ProcessRole::Utility,
    ];

    /// Roles whose single instance is shared by every session.
    pub fn is_shared_service(self) -> bool {
        matches!(
            self,
            ProcessRole::Graphics | ProcessRole::ModelExec | ProcessRole::Utility
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Host => "host",
            ProcessRole::Renderer => "renderer",
            ProcessRole::Graphics => "graphics",
            ProcessRole::ModelExec => "model_exec",
            ProcessRole::Utility => "utility",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process lifecycle state.
///
/// State transitions:
/// ```text
/// CREATED → READY → ACTIVE ⇄ SUSPENDED
///    └────────┴────────┴─────────┴──→ TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Created,
    Ready,
    Active,
    Suspended,
    Terminated,
}

impl ProcessState {
    /// Check if this is the absorbing state.
    pub fn is_terminal(self) -> bool {
        self == ProcessState::Terminated
    }

    /// Can receive routed work.
    pub fn is_live(self) -> bool {
        matches!(self, ProcessState::Ready | ProcessState::Active)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        match (self, to) {
            // TERMINATED is absorbing
            (ProcessState::Terminated, _) => false,
            (_, ProcessState::Terminated) => true,
            (ProcessState::Created, ProcessState::Ready) => true,
            (ProcessState::Ready, ProcessState::Active) => true,
            (ProcessState::Active, ProcessState::Suspended) => true,
            (ProcessState::Suspended, ProcessState::Active) => true,
            _ => false,
        }
    }
}

/// Resource usage snapshot reported by a health probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

/// Soft and hard resource limits for a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct ResourceLimits {
    pub soft_memory_bytes: u64,
    pub hard_memory_bytes: u64,
    pub soft_cpu_percent: f64,
    pub hard_cpu_percent: f64,
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            soft_memory_bytes: u64::MAX,
            hard_memory_bytes: u64::MAX,
            soft_cpu_percent: f64::MAX,
            hard_cpu_percent: f64::MAX,
        }
    }

    /// Classify a snapshot against these limits.
    pub fn assess(&self, usage: &ResourceUsage) -> HealthAssessment {
        if usage.memory_bytes >= self.hard_memory_bytes || usage.cpu_percent >= self.hard_cpu_percent
        {
            return HealthAssessment::OverHardLimit(format!(
                "memory={}B cpu={:.1}% (hard: {}B / {:.1}%)",
                usage.memory_bytes, usage.cpu_percent, self.hard_memory_bytes, self.hard_cpu_percent
            ));
        }
        if usage.memory_bytes > self.soft_memory_bytes || usage.cpu_percent > self.soft_cpu_percent
        {
            return HealthAssessment::OverSoftLimit;
        }
        HealthAssessment::Healthy
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            soft_memory_bytes: 2 * 1024 * 1024 * 1024,
            hard_memory_bytes: 4 * 1024 * 1024 * 1024,
            soft_cpu_percent: 90.0,
            hard_cpu_percent: 100.0,
        }
    }
}

/// Outcome of comparing a usage snapshot with role limits.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAssessment {
    Healthy,
    OverSoftLimit,
    OverHardLimit(String),
}

/// Crash recovery strategy for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Terminate and notify the owning session only.
    Isolate,
    /// Restart automatically, degraded mode until the replacement is ready.
    Restart,
    /// The whole host shuts down.
    Fatal,
}

/// Capability profile of a role, assembled once at supervisor startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RoleProfile {
    /// Message types the role may emit. `"*"` allows all, `"prefix.*"` allows a namespace.
    pub allowed_message_types: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub recovery: RecoveryPolicy,
}

impl RoleProfile {
    /// Whether the role may emit `message_type`.
    pub fn allows(&self, message_type: &str) -> bool {
        self.allowed_message_types.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            match pattern.strip_suffix(".*") {
                Some(prefix) => message_type
                    .strip_prefix(prefix)
                    .map_or(false, |rest| rest.starts_with('.')),
                None => pattern == message_type,
            }
        })
    }
}

fn types(patterns: &[&str]) -> Vec<String> {
    patterns.iter().map(|s| s.to_string()).collect()
}

/// Explicit profile per role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct RoleProfiles {
    pub host: RoleProfile,
    pub renderer: RoleProfile,
    pub graphics: RoleProfile,
    pub model_exec: RoleProfile,
    pub utility: RoleProfile,
}

impl RoleProfiles {
    pub fn get(&self, role: ProcessRole) -> &RoleProfile {
        match role {
            ProcessRole::Host => &self.host,
            ProcessRole::Renderer => &self.renderer,
            ProcessRole::Graphics => &self.graphics,
            ProcessRole::ModelExec => &self.model_exec,
            ProcessRole::Utility => &self.utility,
        }
    }

    pub fn get_mut(&mut self, role: ProcessRole) -> &mut RoleProfile {
        match role {
            ProcessRole::Host => &mut self.host,
            ProcessRole::Renderer => &mut self.renderer,
            ProcessRole::Graphics => &mut self.graphics,
            ProcessRole::ModelExec => &mut self.model_exec,
            ProcessRole::Utility => &mut self.utility,
        }
    }
}

impl Default for RoleProfiles {
    fn default() -> Self {
        Self {
            host: RoleProfile {
                allowed_message_types: types(&["*"]),
                limits: ResourceLimits::unlimited(),
                recovery: RecoveryPolicy::Fatal,
            },
            renderer: RoleProfile {
                allowed_message_types: types(&["content.*", "render.*", "session.*", "host.*"]),
                limits: ResourceLimits::default(),
                recovery: RecoveryPolicy::Isolate,
            },
            graphics: RoleProfile {
                allowed_message_types: types(&["graphics.*", "host.*"]),
                limits: ResourceLimits {
                    soft_memory_bytes: 3 * 1024 * 1024 * 1024,
                    hard_memory_bytes: 6 * 1024 * 1024 * 1024,
                    ..ResourceLimits::default()
                },
                recovery: RecoveryPolicy::Restart,
            },
            model_exec: RoleProfile {
                allowed_message_types: types(&["model.*", "host.*"]),
                limits: ResourceLimits {
                    soft_memory_bytes: 12 * 1024 * 1024 * 1024,
                    hard_memory_bytes: 16 * 1024 * 1024 * 1024,
                    ..ResourceLimits::default()
                },
                recovery: RecoveryPolicy::Restart,
            },
            utility: RoleProfile {
                allowed_message_types: types(&["net.*", "storage.*", "host.*"]),
                limits: ResourceLimits {
                    soft_memory_bytes: 512 * 1024 * 1024,
                    hard_memory_bytes: 1024 * 1024 * 1024,
                    ..ResourceLimits::default()
                },
                recovery: RecoveryPolicy::Restart,
            },
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often the health monitor runs.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub health_check_interval: Duration,

    /// A process silent for longer than this is treated as crashed.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub health_timeout: Duration,

    /// Restarts allowed per role within `restart_window` before giving up.
    pub max_restarts: u32,

    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub restart_window: Duration,

    /// Ready processes kept per role for fast creation.
    pub warm_pool: BTreeMap<ProcessRole, usize>,

    /// Shared-service processes launched with the host and routable as soon
    /// as they report ready.
    pub baseline: BTreeMap<ProcessRole, usize>,

    pub roles: RoleProfiles,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(15),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            warm_pool: BTreeMap::new(),
            baseline: ProcessRole::ALL
                .into_iter()
                .filter(|role| role.is_shared_service())
                .map(|role| (role, 1))
                .collect(),
            roles: RoleProfiles::default(),
        }
    }
}

/// Supervisor's record of one process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: ProcessId,
    pub role: ProcessRole,
    pub state: ProcessState,
    pub session: Option<SessionId>,
    pub usage: ResourceUsage,
    pub created_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Last health report (or creation), on the tokio clock.
    pub last_heartbeat: Instant,
    /// The process this one replaced after a crash.
    pub replaces: Option<ProcessId>,
    /// A release-resources request is outstanding for the current excursion.
    pub degradation_requested: bool,
    /// Set when the process ended through crash handling.
    pub crash_reason: Option<String>,
}

impl ProcessRecord {
    pub fn new(pid: ProcessId, role: ProcessRole, session: Option<SessionId>) -> Self {
        Self {
            pid,
            role,
            state: ProcessState::Created,
            session,
            usage: ResourceUsage::default(),
            created_at: Utc::now(),
            terminated_at: None,
            last_heartbeat: Instant::now(),
            replaces: None,
            degradation_requested: false,
            crash_reason: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}
