//! Process launch seam.
//!
//! The supervisor never touches the OS directly: it hands a [`LaunchSpec`] to a
//! [`ProcessLauncher`]. [`CommandLauncher`] runs configured per-role commands
//! with `tokio::process`; tests substitute their own launchers.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};

use super::types::{ProcessRole, RoleProfile};
use crate::types::{Error, ProcessId, Result, SessionId};

/// Environment variable carrying the assigned process id.
pub const ENV_PROCESS_ID: &str = "SWITCHYARD_PROCESS_ID";
/// Environment variable carrying the role name.
pub const ENV_ROLE: &str = "SWITCHYARD_ROLE";
/// Environment variable carrying the host transport address.
pub const ENV_HOST_ADDR: &str = "SWITCHYARD_HOST_ADDR";

/// Everything a launcher needs to start one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub pid: ProcessId,
    pub role: ProcessRole,
    pub session: Option<SessionId>,
    pub profile: RoleProfile,
}

/// Starts and stops worker processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the process. The process must later connect and report ready.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Stop the process. Called once per terminated pid; must tolerate a
    /// process that already exited.
    async fn terminate(&self, pid: ProcessId) -> Result<()>;
}

/// Command line for one role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Launcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LauncherConfig {
    /// Address handed to workers in `SWITCHYARD_HOST_ADDR`. Empty means the
    /// server listen address.
    pub host_addr: String,

    /// Per-role commands. Roles without a command cannot be launched.
    pub commands: BTreeMap<ProcessRole, LaunchCommand>,

    /// How long a terminated child may take to exit after being killed.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub kill_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            host_addr: String::new(),
            commands: BTreeMap::new(),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

/// Launches OS processes from configured commands.
#[derive(Debug)]
pub struct CommandLauncher {
    config: LauncherConfig,
    host_addr: String,
    children: Mutex<HashMap<ProcessId, Child>>,
}

impl CommandLauncher {
    pub fn new(config: LauncherConfig, host_addr: impl Into<String>) -> Self {
        let host_addr = if config.host_addr.is_empty() {
            host_addr.into()
        } else {
            config.host_addr.clone()
        };
        Self {
            config,
            host_addr,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Build the command for a spec without spawning it.
    pub fn command_for(&self, spec: &LaunchSpec) -> Result<Command> {
        let launch = self.config.commands.get(&spec.role).ok_or_else(|| {
            Error::SpawnFailed(format!("no launch command configured for role {}", spec.role))
        })?;
        if launch.program.is_empty() {
            return Err(Error::SpawnFailed(format!(
                "empty launch program for role {}",
                spec.role
            )));
        }

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .env(ENV_PROCESS_ID, spec.pid.get().to_string())
            .env(ENV_ROLE, spec.role.as_str())
            .env(ENV_HOST_ADDR, &self.host_addr)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, Child>> {
        self.children
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of children still tracked.
    pub fn running(&self) -> usize {
        self.children().len()
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let mut command = self.command_for(spec)?;
        let child = command.spawn().map_err(|e| {
            Error::SpawnFailed(format!("cannot spawn {} process {}: {}", spec.role, spec.pid, e))
        })?;

        tracing::info!(
            pid = %spec.pid,
            role = %spec.role,
            os_pid = ?child.id(),
            "process_launched"
        );
        self.children().insert(spec.pid, child);
        Ok(())
    }

    async fn terminate(&self, pid: ProcessId) -> Result<()> {
        let child = self.children().remove(&pid);
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            tracing::debug!(pid = %pid, error = %e, "kill_failed_process_already_exited");
        }
        match tokio::time::timeout(self.config.kill_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = %pid, status = %status, "process_exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Io(format!("wait for pid {}: {}", pid, e))),
            Err(_) => Err(Error::timeout(format!(
                "pid {} did not exit within {:?}",
                pid, self.config.kill_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::RoleProfiles;

    fn spec(role: ProcessRole) -> LaunchSpec {
        LaunchSpec {
            pid: ProcessId::new(7),
            role,
            session: None,
            profile: RoleProfiles::default().get(role).clone(),
        }
    }

    #[test]
    fn test_missing_command_is_spawn_failed() {
        let launcher = CommandLauncher::new(LauncherConfig::default(), "127.0.0.1:1");
        let err = launcher.command_for(&spec(ProcessRole::Renderer)).unwrap_err();
        assert!(matches!(err, Error::SpawnFailed(_)));
    }

    #[test]
    fn test_command_carries_environment() {
        let mut config = LauncherConfig::default();
        config.commands.insert(
            ProcessRole::Utility,
            LaunchCommand {
                program: "worker".into(),
                args: vec!["--utility".into()],
                env: BTreeMap::from([("EXTRA".to_string(), "1".to_string())]),
            },
        );
        let launcher = CommandLauncher::new(config, "127.0.0.1:47100");
        let command = launcher.command_for(&spec(ProcessRole::Utility)).unwrap();

        let envs: HashMap<String, String> = command
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| {
                Some((k.to_str()?.to_string(), v?.to_str()?.to_string()))
            })
            .collect();
        assert_eq!(envs[ENV_PROCESS_ID], "7");
        assert_eq!(envs[ENV_ROLE], "utility");
        assert_eq!(envs[ENV_HOST_ADDR], "127.0.0.1:47100");
        assert_eq!(envs["EXTRA"], "1");
        assert_eq!(command.as_std().get_program(), "worker");
    }

    #[test]
    fn test_configured_host_addr_wins() {
        let config = LauncherConfig {
            host_addr: "10.0.0.1:9000".into(),
            ..LauncherConfig::default()
        };
        let launcher = CommandLauncher::new(config, "127.0.0.1:47100");
        assert_eq!(launcher.host_addr, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_binary() {
        let mut config = LauncherConfig::default();
        config.commands.insert(
            ProcessRole::Renderer,
            LaunchCommand {
                program: "/nonexistent/switchyard-worker".into(),
                ..LaunchCommand::default()
            },
        );
        let launcher = CommandLauncher::new(config, "127.0.0.1:1");
        let err = launcher.launch(&spec(ProcessRole::Renderer)).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed(_)));
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_terminate_unknown_pid_is_noop() {
        let launcher = CommandLauncher::new(LauncherConfig::default(), "127.0.0.1:1");
        launcher.terminate(ProcessId::new(42)).await.unwrap();
    }
}
