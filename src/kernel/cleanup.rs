//! Background cleanup for resource management.
//!
//! CleanupService provides periodic garbage collection of:
//! - Terminated process records past their retention, with their router entries
//! - Expired orchestrator results
//! - Idle rate limit windows
//!
//! This keeps a long-running host from accumulating dead state.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::kernel::supervisor::Supervisor;
use crate::orchestrator::Orchestrator;

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often to run cleanup (default: 1 minute)
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,
    /// How long to keep terminated process records (default: 10 minutes)
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub process_retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            process_retention: Duration::from_secs(600),
        }
    }
}

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Number of terminated process records removed
    pub processes_removed: usize,
    /// Number of expired results dropped
    pub results_expired: usize,
    /// Number of rate limit windows cleaned
    pub rate_windows_cleaned: usize,
    /// When cleanup cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// CleanupService handles background garbage collection.
#[derive(Debug)]
pub struct CleanupService {
    supervisor: Arc<Supervisor>,
    orchestrator: Arc<Orchestrator>,
    config: CleanupConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl CleanupService {
    /// Create a new cleanup service.
    pub fn new(
        supervisor: Arc<Supervisor>,
        orchestrator: Arc<Orchestrator>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            supervisor,
            orchestrator,
            config,
            stop_tx: None,
        }
    }

    /// Start the cleanup loop in the background.
    /// Returns immediately; cleanup runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(&self.supervisor);
        let orchestrator = Arc::clone(&self.orchestrator);
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_cleanup_cycle(&supervisor, &orchestrator, &config);
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("cleanup_service_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the cleanup loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cleanup cycle.
    pub fn run_cleanup_cycle(
        supervisor: &Supervisor,
        orchestrator: &Orchestrator,
        config: &CleanupConfig,
    ) -> CleanupStats {
        let processes_removed = supervisor.purge_terminated(config.process_retention);
        let results_expired = orchestrator.purge_expired();
        let rate_windows_cleaned = supervisor.router().cleanup_rate_limits();

        tracing::debug!(
            processes = processes_removed,
            results = results_expired,
            rate_windows = rate_windows_cleaned,
            "cleanup_cycle_completed"
        );

        CleanupStats {
            processes_removed,
            results_expired,
            rate_windows_cleaned,
            completed_at: Some(Utc::now()),
        }
    }
}
