//! Model loader that asks a model-execution process to do the work.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{LoadedModel, ModelLoader, ModelSpec};
use crate::envelope::Envelope;
use crate::kernel::supervisor::Supervisor;
use crate::kernel::types::ProcessRole;
use crate::types::{Error, ModelId, ProcessId, Result};

pub const MSG_MODEL_LOAD: &str = "model.load";
pub const MSG_MODEL_UNLOAD: &str = "model.unload";

/// Loads models by sending `model.load` requests to a live model-execution
/// process; unloads with a `model.unload` notify.
#[derive(Debug, Clone)]
pub struct RoutedModelLoader {
    supervisor: Arc<Supervisor>,
    timeout: Option<Duration>,
}

impl RoutedModelLoader {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            timeout: None,
        }
    }

    /// Request timeout for loads; the router default otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn executor(&self) -> Result<ProcessId> {
        self.supervisor
            .pick(ProcessRole::ModelExec)
            .ok_or_else(|| Error::ProcessCrashed("no live model_exec process".to_string()))
    }
}

#[async_trait]
impl ModelLoader for RoutedModelLoader {
    async fn load(&self, id: &ModelId, spec: &ModelSpec) -> Result<LoadedModel> {
        let pid = self.executor()?;
        let request = Envelope::request(
            ProcessId::HOST,
            pid,
            MSG_MODEL_LOAD,
            json!({
                "model": id,
                "size_bytes": spec.size_bytes,
                "backend": spec.backend,
            }),
        );
        self.supervisor.router().request(request, self.timeout).await?;
        Ok(LoadedModel::new(id.clone(), spec))
    }

    async fn unload(&self, model: &LoadedModel) {
        let pid = match self.executor() {
            Ok(pid) => pid,
            Err(e) => {
                tracing::debug!(model = %model.id, error = %e, "model unload skipped");
                return;
            }
        };
        let notice = Envelope::notify(ProcessId::HOST, pid, MSG_MODEL_UNLOAD, json!({ "model": model.id }));
        if let Err(e) = self.supervisor.router().send(notice) {
            tracing::warn!(model = %model.id, pid = %pid, error = %e, "model unload not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use crate::kernel::launcher::MockProcessLauncher;
    use crate::kernel::rate_limiter::RateLimitConfig;
    use crate::kernel::supervisor::ProcessConfig;
    use crate::kernel::types::SupervisorConfig;
    use crate::models::ExecutionBackend;
    use crate::router::Router;
    use crate::types::RouterConfig;
    use tokio_util::sync::CancellationToken;

    fn supervisor() -> Arc<Supervisor> {
        let mut launcher = MockProcessLauncher::new();
        launcher.expect_launch().returning(|_| Ok(()));
        launcher.expect_terminate().returning(|_| Ok(()));
        let config = SupervisorConfig::default();
        let router = Router::new(
            RouterConfig::default(),
            RateLimitConfig::default(),
            config.roles.clone(),
        )
        .unwrap();
        Arc::new(Supervisor::new(
            config,
            router,
            Arc::new(launcher),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_load_and_unload_round_trip_through_router() {
        let supervisor = supervisor();
        let pid = supervisor
            .create_process(ProcessRole::ModelExec, ProcessConfig::default())
            .await
            .unwrap();
        supervisor.mark_ready(pid).unwrap();

        let router = supervisor.router().clone();
        let mut mailbox = router.take_mailbox(pid).unwrap();
        let worker = tokio::spawn(async move {
            let load = mailbox.recv().await.unwrap();
            assert_eq!(load.message_type, MSG_MODEL_LOAD);
            assert_eq!(load.payload["backend"], "gpu");
            router.send(load.reply(json!({ "loaded": true }))).unwrap();
            mailbox.recv().await.unwrap()
        });

        let loader = RoutedModelLoader::new(Arc::clone(&supervisor));
        let spec = ModelSpec {
            backend: ExecutionBackend::Gpu,
            ..ModelSpec::new(512)
        };
        let model = loader.load(&ModelId::must("ner"), &spec).await.unwrap();
        assert_eq!(model.size_bytes, 512);

        loader.unload(&model).await;
        let unload = worker.await.unwrap();
        assert_eq!(unload.kind, MessageKind::Notify);
        assert_eq!(unload.message_type, MSG_MODEL_UNLOAD);
        assert_eq!(unload.payload["model"], "ner");
    }

    #[tokio::test]
    async fn test_load_without_executor_fails() {
        let loader = RoutedModelLoader::new(supervisor());
        let err = loader
            .load(&ModelId::must("ner"), &ModelSpec::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessCrashed(_)));
    }
}
