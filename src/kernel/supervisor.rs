//! Process supervisor.
//!
//! Owns the process table, launches processes through a [`ProcessLauncher`],
//! keeps warm pools, watches heartbeats and resource reports, and applies the
//! per-role crash recovery policy:
//!
//! - `Isolate` (renderers): terminate, notify the owning session only
//! - `Restart` (shared services): degraded mode until a replacement is ready
//! - `Fatal` (host): cancel the host shutdown token
//!
//! The table lock is never held across an await. Termination happens under
//! the lock, so when the health loop and a disconnect race for the same pid
//! exactly one of them runs recovery.

use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::launcher::{LaunchSpec, ProcessLauncher};
use super::lifecycle::ProcessTable;
use super::types::{
    HealthAssessment, ProcessRecord, ProcessRole, ProcessState, RecoveryPolicy, ResourceUsage,
    SupervisorConfig,
};
use crate::envelope::Envelope;
use crate::router::Router;
use crate::types::{Error, IdAllocator, ProcessId, Result, SessionId};

/// Prefix of the per-session crash topics; sessionless crashes use it bare.
pub const TOPIC_SESSION_CRASHED: &str = "session.crashed";
/// Topic carrying degraded-mode changes of shared services.
pub const TOPIC_SERVICE_DEGRADED: &str = "service.degraded";
/// Topic carrying "gave up restarting" notifications.
pub const TOPIC_SERVICE_UNAVAILABLE: &str = "service.unavailable";
/// Crash notification topic for processes of `session`.
pub fn session_crash_topic(session: Option<&SessionId>) -> String {
    match session {
        Some(session) => format!("{}.{}", TOPIC_SESSION_CRASHED, session),
        None => TOPIC_SESSION_CRASHED.to_string(),
    }
}

/// Notify sent to a process above its soft resource limit.
pub const MSG_RELEASE_RESOURCES: &str = "host.release_resources";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and recovery events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    ProcessStarted {
        pid: ProcessId,
        role: ProcessRole,
        session: Option<SessionId>,
        replaces: Option<ProcessId>,
    },
    ProcessReady {
        pid: ProcessId,
        role: ProcessRole,
    },
    ProcessTerminated {
        pid: ProcessId,
        role: ProcessRole,
        reason: String,
    },
    DegradationRequested {
        pid: ProcessId,
        role: ProcessRole,
        usage: ResourceUsage,
    },
    SessionCrashed {
        pid: ProcessId,
        session: Option<SessionId>,
        reason: String,
    },
    DegradedMode {
        role: ProcessRole,
        active: bool,
    },
    ServiceUnavailable {
        role: ProcessRole,
        reason: String,
    },
    FatalShutdown {
        reason: String,
    },
}

/// Per-creation options.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Owning session (renderers).
    pub session: Option<SessionId>,
    /// Take a Ready process from the warm pool when one is available.
    pub use_warm_pool: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            session: None,
            use_warm_pool: true,
        }
    }
}

impl ProcessConfig {
    pub fn for_session(session: SessionId) -> Self {
        Self {
            session: Some(session),
            ..Self::default()
        }
    }

    pub fn cold(mut self) -> Self {
        self.use_warm_pool = false;
        self
    }
}

#[derive(Debug, Default)]
struct SupervisorState {
    table: ProcessTable,
    /// Restart instants per role, pruned to the restart window.
    restarts: HashMap<ProcessRole, VecDeque<Instant>>,
    degraded: HashSet<ProcessRole>,
}

/// Process supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    router: Router,
    launcher: Arc<dyn ProcessLauncher>,
    state: Mutex<SupervisorState>,
    ids: IdAllocator,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: CancellationToken,
    monitor_stop: Mutex<Option<oneshot::Sender<()>>>,
    next_pick: AtomicUsize,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor. The host process is recorded as Active.
    pub fn new(
        config: SupervisorConfig,
        router: Router,
        launcher: Arc<dyn ProcessLauncher>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut state = SupervisorState::default();
        let mut host = ProcessRecord::new(ProcessId::HOST, ProcessRole::Host, None);
        host.state = ProcessState::Active;
        let _ = state.table.insert(host);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            router,
            launcher,
            state: Mutex::new(state),
            ids: IdAllocator::default(),
            events,
            shutdown,
            monitor_stop: Mutex::new(None),
            next_pick: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Subscribe to lifecycle and recovery events.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a process of `role`, from the warm pool when permitted.
    pub async fn create_process(&self, role: ProcessRole, config: ProcessConfig) -> Result<ProcessId> {
        if role == ProcessRole::Host {
            return Err(Error::validation("the host process cannot be created"));
        }

        if config.use_warm_pool {
            let warm = {
                let mut state = self.state();
                let pid = state.table.take_warm(role);
                if let Some(record) = pid.and_then(|p| state.table.get_mut(p)) {
                    record.session = config.session.clone();
                }
                pid
            };
            if let Some(pid) = warm {
                tracing::info!(pid = %pid, role = %role, "process_taken_from_warm_pool");
                self.emit(SupervisorEvent::ProcessStarted {
                    pid,
                    role,
                    session: config.session,
                    replaces: None,
                });
                return Ok(pid);
            }
        }

        self.spawn(role, config.session, None).await
    }

    async fn spawn(
        &self,
        role: ProcessRole,
        session: Option<SessionId>,
        replaces: Option<ProcessId>,
    ) -> Result<ProcessId> {
        let pid: ProcessId = self.ids.next();
        let mut record = ProcessRecord::new(pid, role, session.clone());
        record.replaces = replaces;
        self.state().table.insert(record)?;

        if let Err(e) = self.router.register_process(pid, role) {
            let _ = self.state().table.terminate(pid, Some(e.to_string()));
            return Err(e);
        }

        let spec = LaunchSpec {
            pid,
            role,
            session: session.clone(),
            profile: self.config.roles.get(role).clone(),
        };
        if let Err(e) = self.launcher.launch(&spec).await {
            let reason = e.to_string();
            let _ = self.state().table.terminate(pid, Some(reason.clone()));
            self.router.mark_gone(pid, &reason);
            tracing::error!(pid = %pid, role = %role, error = %e, "process_spawn_failed");
            return Err(match e {
                Error::SpawnFailed(_) => e,
                other => Error::SpawnFailed(other.to_string()),
            });
        }

        tracing::info!(pid = %pid, role = %role, replaces = ?replaces, "process_created");
        self.emit(SupervisorEvent::ProcessStarted {
            pid,
            role,
            session,
            replaces,
        });
        Ok(pid)
    }

    /// Fill each role's warm pool up to its configured size.
    pub async fn prewarm(&self) -> Result<usize> {
        let mut launched = 0;
        for (&role, &target) in &self.config.warm_pool {
            if role == ProcessRole::Host {
                continue;
            }
            let have = self.state().table.warm_count(role);
            for _ in have..target {
                let pid = self.spawn(role, None, None).await?;
                self.state().table.park_warm(pid)?;
                launched += 1;
            }
        }
        if launched > 0 {
            tracing::info!(launched = launched, "warm_pool_filled");
        }
        Ok(launched)
    }

    /// Launch the configured baseline of shared-service processes, counting
    /// the ones already running. Returns the number launched.
    pub async fn start_baseline(&self) -> Result<usize> {
        let mut launched = 0;
        for (&role, &target) in &self.config.baseline {
            if !role.is_shared_service() {
                tracing::warn!(role = %role, "baseline_ignored_for_role");
                continue;
            }
            let have = {
                let state = self.state();
                state
                    .table
                    .list()
                    .iter()
                    .filter(|r| r.role == role && !r.is_terminated() && !state.table.is_warm(r.pid))
                    .count()
            };
            for _ in have..target {
                self.spawn(role, None, None).await?;
                launched += 1;
            }
        }
        if launched > 0 {
            tracing::info!(launched = launched, "baseline_started");
        }
        Ok(launched)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// The process finished initializing. Ends degraded mode when it is the
    /// replacement of a crashed shared service.
    pub fn mark_ready(&self, pid: ProcessId) -> Result<()> {
        let (role, recovered) = {
            let mut state = self.state();
            let record = state.table.mark_ready(pid)?;
            let role = record.role;
            let replacement = record.replaces.is_some();
            let recovered = replacement && state.degraded.remove(&role);
            (role, recovered)
        };

        tracing::info!(pid = %pid, role = %role, "process_ready");
        self.emit(SupervisorEvent::ProcessReady { pid, role });
        if recovered {
            self.announce_degraded(role, false);
        }
        Ok(())
    }

    pub fn activate(&self, pid: ProcessId) -> Result<()> {
        self.state().table.activate(pid)?;
        tracing::debug!(pid = %pid, "process_activated");
        Ok(())
    }

    pub fn suspend(&self, pid: ProcessId) -> Result<()> {
        self.state().table.suspend(pid)?;
        tracing::debug!(pid = %pid, "process_suspended");
        Ok(())
    }

    pub fn resume(&self, pid: ProcessId) -> Result<()> {
        self.state().table.resume(pid)?;
        tracing::debug!(pid = %pid, "process_resumed");
        Ok(())
    }

    /// Clean shutdown of one process. Terminating twice is a no-op.
    pub async fn terminate(&self, pid: ProcessId) -> Result<()> {
        if pid.is_host() {
            return Err(Error::validation(
                "the host process is stopped through its shutdown token",
            ));
        }
        let Some(record) = self.state().table.terminate(pid, None)? else {
            return Ok(());
        };

        self.router.mark_gone(pid, "terminated");
        self.stop_process(pid).await;
        tracing::info!(pid = %pid, role = %record.role, "process_terminated");
        self.emit(SupervisorEvent::ProcessTerminated {
            pid,
            role: record.role,
            reason: "terminated".to_string(),
        });
        Ok(())
    }

    /// Terminate every live worker process. Returns how many were stopped.
    pub async fn terminate_all(&self) -> usize {
        let pids: Vec<ProcessId> = self
            .state()
            .table
            .list()
            .into_iter()
            .filter(|r| !r.is_terminated() && !r.pid.is_host())
            .map(|r| r.pid)
            .collect();
        let mut stopped = 0;
        for pid in pids {
            if self.terminate(pid).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }

    async fn stop_process(&self, pid: ProcessId) {
        if let Err(e) = self.launcher.terminate(pid).await {
            tracing::warn!(pid = %pid, error = %e, "process_stop_failed");
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Record a usage report and heartbeat, then enforce the role's limits.
    pub async fn report_health(&self, pid: ProcessId, usage: ResourceUsage) -> Result<HealthAssessment> {
        let (role, assessment, first_excursion) = {
            let mut state = self.state();
            let record = state.table.record_heartbeat(pid, usage)?;
            let assessment = self.config.roles.get(record.role).limits.assess(&usage);
            let first_excursion = match assessment {
                HealthAssessment::OverSoftLimit => {
                    let first = !record.degradation_requested;
                    record.degradation_requested = true;
                    first
                }
                HealthAssessment::Healthy => {
                    record.degradation_requested = false;
                    false
                }
                HealthAssessment::OverHardLimit(_) => false,
            };
            (record.role, assessment, first_excursion)
        };

        match &assessment {
            HealthAssessment::OverSoftLimit if first_excursion => {
                tracing::warn!(
                    pid = %pid,
                    role = %role,
                    memory_bytes = usage.memory_bytes,
                    cpu_percent = usage.cpu_percent,
                    "soft_limit_exceeded"
                );
                let notice = Envelope::notify(
                    ProcessId::HOST,
                    pid,
                    MSG_RELEASE_RESOURCES,
                    json!({
                        "memory_bytes": usage.memory_bytes,
                        "cpu_percent": usage.cpu_percent,
                    }),
                );
                if let Err(e) = self.router.send(notice) {
                    tracing::warn!(pid = %pid, error = %e, "release_resources_not_delivered");
                }
                self.emit(SupervisorEvent::DegradationRequested { pid, role, usage });
            }
            HealthAssessment::OverHardLimit(reason) => {
                self.handle_crash(pid, &format!("hard resource limit exceeded: {}", reason))
                    .await?;
            }
            _ => {}
        }
        Ok(assessment)
    }

    /// Treat every process silent for longer than `health_timeout` as crashed.
    /// Returns the pids this call recovered.
    pub async fn check_health(&self) -> Vec<ProcessId> {
        let stale = self
            .state()
            .table
            .stale(Instant::now(), self.config.health_timeout);

        let mut crashed = Vec::new();
        for pid in stale {
            match self.handle_crash(pid, "heartbeat timeout").await {
                Ok(true) => crashed.push(pid),
                Ok(false) => {}
                Err(e) => tracing::warn!(pid = %pid, error = %e, "health_check_failed"),
            }
        }
        crashed
    }

    /// Run [`Supervisor::check_health`] every `health_check_interval` until
    /// stopped or the host shuts down.
    pub fn start_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let (stop_tx, mut stop_rx) = oneshot::channel();
        if let Some(previous) = self.monitor_stop().replace(stop_tx) {
            let _ = previous.send(());
        }
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(supervisor.config.health_check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let crashed = supervisor.check_health().await;
                        if !crashed.is_empty() {
                            tracing::warn!(crashed = crashed.len(), "unresponsive_processes_recovered");
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("health_monitor_stopped_on_shutdown");
                        break;
                    }
                }
            }
        })
    }

    pub fn stop_health_monitor(&self) {
        if let Some(tx) = self.monitor_stop().take() {
            let _ = tx.send(());
        }
    }

    fn monitor_stop(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.monitor_stop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Handle a crashed or unresponsive process.
    ///
    /// Returns `Ok(true)` for the caller that performed recovery and
    /// `Ok(false)` when the process was already terminated.
    pub async fn handle_crash(&self, pid: ProcessId, reason: &str) -> Result<bool> {
        let Some(record) = self.state().table.terminate(pid, Some(reason.to_string()))? else {
            tracing::debug!(pid = %pid, reason = reason, "crash_already_handled");
            return Ok(false);
        };

        tracing::warn!(pid = %pid, role = %record.role, reason = reason, "process_crashed");
        if !pid.is_host() {
            self.router.mark_gone(pid, reason);
            self.stop_process(pid).await;
        }
        self.emit(SupervisorEvent::ProcessTerminated {
            pid,
            role: record.role,
            reason: reason.to_string(),
        });

        match self.config.roles.get(record.role).recovery {
            RecoveryPolicy::Isolate => self.isolate(&record, reason),
            RecoveryPolicy::Restart => self.restart(&record).await,
            RecoveryPolicy::Fatal => self.fatal(&record, reason),
        }
        Ok(true)
    }

    fn isolate(&self, record: &ProcessRecord, reason: &str) {
        self.emit(SupervisorEvent::SessionCrashed {
            pid: record.pid,
            session: record.session.clone(),
            reason: reason.to_string(),
        });
        let payload = json!({
            "pid": record.pid,
            "session": record.session,
            "reason": reason,
        });
        let topic = session_crash_topic(record.session.as_ref());
        if let Err(e) = self.router.publish(ProcessId::HOST, &topic, payload) {
            tracing::warn!(pid = %record.pid, error = %e, "session_crash_notice_failed");
        }
    }

    async fn restart(&self, crashed: &ProcessRecord) {
        let role = crashed.role;
        let now = Instant::now();
        let window = self.config.restart_window;

        let (allowed, entered) = {
            let mut state = self.state();
            let history = state.restarts.entry(role).or_default();
            while history
                .front()
                .map_or(false, |t| now.saturating_duration_since(*t) > window)
            {
                history.pop_front();
            }
            let allowed = history.len() < self.config.max_restarts as usize;
            if allowed {
                history.push_back(now);
            }
            let entered = state.degraded.insert(role);
            (allowed, entered)
        };

        if entered {
            self.announce_degraded(role, true);
        }
        if !allowed {
            self.service_unavailable(
                role,
                format!(
                    "restart limit of {} within {:?} reached",
                    self.config.max_restarts, window
                ),
            );
            return;
        }

        match self.spawn(role, None, Some(crashed.pid)).await {
            Ok(pid) => {
                tracing::info!(role = %role, crashed = %crashed.pid, replacement = %pid, "replacement_launched");
            }
            Err(e) => self.service_unavailable(role, format!("replacement failed to spawn: {}", e)),
        }
    }

    fn fatal(&self, record: &ProcessRecord, reason: &str) {
        tracing::error!(pid = %record.pid, reason = reason, "fatal_host_failure");
        self.emit(SupervisorEvent::FatalShutdown {
            reason: reason.to_string(),
        });
        self.shutdown.cancel();
    }

    fn announce_degraded(&self, role: ProcessRole, active: bool) {
        if active {
            tracing::warn!(role = %role, "degraded_mode_entered");
        } else {
            tracing::info!(role = %role, "degraded_mode_ended");
        }
        self.emit(SupervisorEvent::DegradedMode { role, active });
        let payload = json!({ "role": role, "active": active });
        if let Err(e) = self.router.publish(ProcessId::HOST, TOPIC_SERVICE_DEGRADED, payload) {
            tracing::warn!(role = %role, error = %e, "degraded_notice_failed");
        }
    }

    fn service_unavailable(&self, role: ProcessRole, reason: String) {
        tracing::error!(role = %role, reason = %reason, "service_unavailable");
        let payload = json!({ "role": role, "reason": reason });
        self.emit(SupervisorEvent::ServiceUnavailable { role, reason });
        if let Err(e) = self.router.publish(ProcessId::HOST, TOPIC_SERVICE_UNAVAILABLE, payload) {
            tracing::warn!(role = %role, error = %e, "unavailable_notice_failed");
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// A live process of `role` outside the warm pool, rotating between
    /// candidates.
    pub fn pick(&self, role: ProcessRole) -> Option<ProcessId> {
        let candidates: Vec<ProcessId> = {
            let state = self.state();
            state
                .table
                .live_of_role(role)
                .into_iter()
                .filter(|pid| !state.table.is_warm(*pid))
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }
        let turn = self.next_pick.fetch_add(1, Ordering::Relaxed);
        Some(candidates[turn % candidates.len()])
    }

    pub fn is_degraded(&self, role: ProcessRole) -> bool {
        self.state().degraded.contains(&role)
    }

    pub fn process(&self, pid: ProcessId) -> Option<ProcessRecord> {
        self.state().table.get(pid).cloned()
    }

    pub fn processes(&self) -> Vec<ProcessRecord> {
        self.state().table.list()
    }

    pub fn count_by_state(&self, state: ProcessState) -> usize {
        self.state().table.count_by_state(state)
    }

    /// Drop terminated records older than `retention`, here and in the router.
    pub fn purge_terminated(&self, retention: Duration) -> usize {
        let purged = self.state().table.purge_terminated(retention);
        for pid in &purged {
            self.router.forget_process(*pid);
        }
        purged.len()
    }
}
