//! End-to-end host scenarios with in-process workers.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard::envelope::MessageKind;
use switchyard::kernel::launcher::{LaunchSpec, ProcessLauncher};
use switchyard::kernel::supervisor::session_crash_topic;
use switchyard::kernel::{Host, ProcessConfig, ProcessRole, ProcessState};
use switchyard::models::{LoadedModel, ModelLoader, ModelSpec};
use switchyard::orchestrator::ContentInput;
use switchyard::types::{ModelId, ProcessId, SessionId};
use switchyard::{HostConfig, Result};

const MB: u64 = 1024 * 1024;

#[derive(Debug)]
struct InProcessLauncher;

#[async_trait]
impl ProcessLauncher for InProcessLauncher {
    async fn launch(&self, _spec: &LaunchSpec) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _pid: ProcessId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingLoader {
    loads: Mutex<Vec<ModelId>>,
    unloads: Mutex<Vec<ModelId>>,
}

#[async_trait]
impl ModelLoader for RecordingLoader {
    async fn load(&self, id: &ModelId, spec: &ModelSpec) -> Result<LoadedModel> {
        self.loads.lock().unwrap().push(id.clone());
        Ok(LoadedModel::new(id.clone(), spec))
    }

    async fn unload(&self, model: &LoadedModel) {
        self.unloads.lock().unwrap().push(model.id.clone());
    }
}

fn host_with(config: HostConfig, loader: Arc<RecordingLoader>) -> Host {
    Host::with_model_loader(config, Arc::new(InProcessLauncher), loader).unwrap()
}

#[tokio::test]
async fn test_repeated_classification_is_served_from_cache() {
    let mut config = HostConfig::default();
    config.models.registry.insert(ModelId::must("classifier"), ModelSpec::new(300 * MB));
    let loader = Arc::new(RecordingLoader::default());
    let host = host_with(config, Arc::clone(&loader));

    let worker = host
        .supervisor()
        .create_process(ProcessRole::ModelExec, ProcessConfig::default())
        .await
        .unwrap();
    host.supervisor().mark_ready(worker).unwrap();

    let classified = Arc::new(AtomicUsize::new(0));
    let mut mailbox = host.router().take_mailbox(worker).unwrap();
    let router = host.router().clone();
    let seen = Arc::clone(&classified);
    tokio::spawn(async move {
        while let Some(request) = mailbox.recv().await {
            if request.kind == MessageKind::Request && request.message_type == "model.classify" {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = router.send(request.reply(json!({ "label": "positive", "score": 0.98 })));
            }
        }
    });

    let orchestrator = host.orchestrator();
    let first = orchestrator
        .submit("classify", ContentInput::text("great product!"))
        .await
        .unwrap();
    let second = orchestrator
        .submit("classify", ContentInput::text("great   product!"))
        .await
        .unwrap();

    assert_eq!(first.facets["classification"]["label"], "positive");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(classified.load(Ordering::SeqCst), 1);

    let stats = orchestrator.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(*loader.loads.lock().unwrap(), vec![ModelId::must("classifier")]);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_renderer_notifies_its_session() {
    let host = host_with(HostConfig::default(), Arc::new(RecordingLoader::default()));
    let session = SessionId::new();
    let other_session = SessionId::new();
    let (_subscription, mut notices) = host
        .router()
        .subscribe_channel(&session_crash_topic(Some(&session)), ProcessId::HOST)
        .unwrap();
    let (_other, mut other_notices) = host
        .router()
        .subscribe_channel(&session_crash_topic(Some(&other_session)), ProcessId::HOST)
        .unwrap();

    let renderer = host
        .supervisor()
        .create_process(ProcessRole::Renderer, ProcessConfig::for_session(session.clone()))
        .await
        .unwrap();
    let bystander = host
        .supervisor()
        .create_process(ProcessRole::Renderer, ProcessConfig::for_session(other_session.clone()))
        .await
        .unwrap();

    let timeout = host.config().supervisor.health_timeout;
    tokio::time::advance(timeout / 2).await;
    host.supervisor()
        .report_health(bystander, Default::default())
        .await
        .unwrap();
    tokio::time::advance(timeout / 2 + Duration::from_secs(1)).await;

    let crashed = host.supervisor().check_health().await;
    assert_eq!(crashed, vec![renderer]);

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, MessageKind::Event);
    assert_eq!(notice.payload["session"], json!(session));
    assert_eq!(notice.payload["pid"], json!(renderer));

    assert_eq!(
        host.supervisor().process(renderer).unwrap().state,
        ProcessState::Terminated
    );
    assert!(host.router().is_live(bystander));
    assert!(notices.try_recv().is_err());
    assert!(other_notices.try_recv().is_err());
}

#[tokio::test]
async fn test_loading_model_b_evicts_model_a_at_capacity() {
    let mut config = HostConfig::default();
    config.models.capacity_bytes = 2000 * MB;
    config.models.registry.insert(ModelId::must("model-a"), ModelSpec::new(1200 * MB));
    config.models.registry.insert(ModelId::must("model-b"), ModelSpec::new(1000 * MB));
    let loader = Arc::new(RecordingLoader::default());
    let host = host_with(config, Arc::clone(&loader));

    let models = host.models();
    let a = ModelId::must("model-a");
    let b = ModelId::must("model-b");

    models.acquire(&a).await.unwrap();
    models.release(&a).await.unwrap();
    models.acquire(&b).await.unwrap();

    assert!(!models.is_resident(&a).await);
    assert!(models.is_resident(&b).await);
    assert_eq!(*loader.unloads.lock().unwrap(), vec![a]);

    let stats = models.stats().await;
    assert_eq!(stats.resident_bytes, 1000 * MB);
    assert_eq!(stats.evictions, 1);
    assert!(stats.resident_bytes <= stats.capacity_bytes);
}

#[tokio::test]
async fn test_acquiring_large_model_evicts_idle_one() {
    let mut config = HostConfig::default();
    config.models.capacity_bytes = 2000 * MB;
    config.models.registry.insert(ModelId::must("A"), ModelSpec::new(500 * MB));
    config.models.registry.insert(ModelId::must("B"), ModelSpec::new(1700 * MB));
    let loader = Arc::new(RecordingLoader::default());
    let host = host_with(config, Arc::clone(&loader));

    let models = host.models();
    let a = ModelId::must("A");
    let b = ModelId::must("B");

    models.acquire(&a).await.unwrap();
    models.release(&a).await.unwrap();
    models.acquire(&b).await.unwrap();

    assert!(!models.is_resident(&a).await);
    assert!(models.is_resident(&b).await);
    assert_eq!(*loader.loads.lock().unwrap(), vec![a.clone(), b]);
    assert_eq!(*loader.unloads.lock().unwrap(), vec![a]);

    let stats = models.stats().await;
    assert_eq!(stats.resident_bytes, 1700 * MB);
    assert_eq!(stats.evictions, 1);
}
