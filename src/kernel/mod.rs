//! Kernel - process supervision and the host context.
//!
//! `Host` wires the subsystems together: one router, one supervisor, one model
//! cache, one orchestrator and the shared attachment buffers. Every subsystem
//! is shared through `Arc` and synchronizes internally; there is no global
//! host lock.

pub mod cleanup;
pub mod control;
pub mod launcher;
pub mod lifecycle;
pub mod rate_limiter;
pub mod recovery;
pub mod supervisor;
pub mod types;

pub use cleanup::{CleanupConfig, CleanupService, CleanupStats};
pub use control::HostControl;
pub use launcher::{CommandLauncher, LaunchSpec, LauncherConfig, ProcessLauncher};
pub use lifecycle::ProcessTable;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use recovery::{recover_async, with_recovery};
pub use supervisor::{ProcessConfig, Supervisor, SupervisorEvent};
pub use types::{
    HealthAssessment, ProcessRecord, ProcessRole, ProcessState, RecoveryPolicy, ResourceLimits,
    ResourceUsage, RoleProfile, RoleProfiles, SupervisorConfig,
};

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::envelope::SharedBuffers;
use crate::models::{ModelCache, ModelLoader, RoutedModelLoader};
use crate::orchestrator::Orchestrator;
use crate::router::Router;
use crate::types::{HostConfig, Result};

#[derive(Debug, Default)]
struct Background {
    cleanup: Option<CleanupService>,
    tasks: Vec<JoinHandle<()>>,
}

/// The host context.
#[derive(Debug)]
pub struct Host {
    config: HostConfig,
    router: Router,
    supervisor: Arc<Supervisor>,
    models: Arc<ModelCache>,
    orchestrator: Arc<Orchestrator>,
    buffers: Arc<SharedBuffers>,
    /// Loads go through a model-execution process.
    routed_models: bool,
    shutdown: CancellationToken,
    background: Mutex<Background>,
}

impl Host {
    /// Build a host whose models are loaded by model-execution processes.
    pub fn new(config: HostConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        Self::build(config, launcher, None)
    }

    /// Build a host with an explicit model loader.
    pub fn with_model_loader(
        config: HostConfig,
        launcher: Arc<dyn ProcessLauncher>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        Self::build(config, launcher, Some(loader))
    }

    fn build(
        config: HostConfig,
        launcher: Arc<dyn ProcessLauncher>,
        loader: Option<Arc<dyn ModelLoader>>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Router::new(
            config.router.clone(),
            config.rate_limit.clone(),
            config.supervisor.roles.clone(),
        )?;
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            router.clone(),
            launcher,
            shutdown.clone(),
        ));

        let routed_models = loader.is_none();
        let loader = loader.unwrap_or_else(|| {
            Arc::new(RoutedModelLoader::new(Arc::clone(&supervisor))) as Arc<dyn ModelLoader>
        });
        let models = Arc::new(ModelCache::new(config.models.clone(), loader));
        let buffers = Arc::new(SharedBuffers::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator.clone(),
            router.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&models),
            Arc::clone(&buffers),
        ));

        let control = Arc::new(HostControl::new(&supervisor, &orchestrator, &buffers));
        for message_type in control::CONTROL_MESSAGES {
            router.register_handler(message_type, control.clone())?;
        }

        tracing::info!(
            kinds = config.orchestrator.kinds.len(),
            models = config.models.registry.len(),
            "host_initialized"
        );

        Ok(Self {
            config,
            router,
            supervisor,
            models,
            orchestrator,
            buffers,
            routed_models,
            shutdown,
            background: Mutex::new(Background::default()),
        })
    }

    fn background(&self) -> MutexGuard<'_, Background> {
        self.background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Launch the shared-service baseline, fill warm pools, warm up flagged
    /// models, then start the health monitor and the cleanup service.
    ///
    /// With the routed loader, warm-up runs in the background once a
    /// model-execution process is ready; the worker transport must be
    /// accepting connections by then.
    pub async fn start(&self) -> Result<()> {
        let baseline = self.supervisor.start_baseline().await?;
        let prewarmed = self.supervisor.prewarm().await?;

        let mut tasks = Vec::new();
        if self.routed_models && self.models.has_warmup() {
            tasks.push(tokio::spawn(warm_up_when_executor_ready(
                Arc::clone(&self.supervisor),
                Arc::clone(&self.models),
                self.shutdown.clone(),
            )));
        } else {
            let warmed = self.models.warm_up().await;
            tracing::info!(models_warmed = warmed, "model_warm_up_completed");
        }

        let monitor = self.supervisor.start_health_monitor();
        let mut cleanup = CleanupService::new(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.orchestrator),
            self.config.cleanup.clone(),
        );
        let cleanup_task = cleanup.start();

        let mut background = self.background();
        background.tasks.extend(tasks);
        background.tasks.push(monitor);
        background.tasks.push(cleanup_task);
        background.cleanup = Some(cleanup);
        drop(background);

        tracing::info!(baseline = baseline, prewarmed = prewarmed, "host_started");
        Ok(())
    }

    /// Stop background tasks and terminate every worker process.
    /// Returns the number of processes terminated.
    pub async fn shutdown(&self) -> usize {
        self.supervisor.stop_health_monitor();
        let tasks = {
            let mut background = self.background();
            if let Some(mut cleanup) = background.cleanup.take() {
                cleanup.stop();
            }
            std::mem::take(&mut background.tasks)
        };

        let terminated = self.supervisor.terminate_all().await;
        self.shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background_task_failed");
            }
        }
        tracing::info!(terminated = terminated, "host_stopped");
        terminated
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn models(&self) -> &Arc<ModelCache> {
        &self.models
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn buffers(&self) -> &Arc<SharedBuffers> {
        &self.buffers
    }

    /// Cancelled on shutdown and on a fatal crash.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Wait for a routable model-execution process, then warm up models.
async fn warm_up_when_executor_ready(
    supervisor: Arc<Supervisor>,
    models: Arc<ModelCache>,
    shutdown: CancellationToken,
) {
    let mut events = supervisor.events();
    while supervisor.pick(ProcessRole::ModelExec).is_none() {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => {
                if matches!(event, Err(broadcast::error::RecvError::Closed)) {
                    return;
                }
            }
        }
    }
    let warmed = models.warm_up().await;
    tracing::info!(models_warmed = warmed, "model_warm_up_completed");
}
