//! Bounded model cache with LRU-with-pinning eviction.
//!
//! Resident models are accounted by size. Eviction picks the least recently
//! accessed non-pinned entry, larger first on a tie. An evicted entry that is
//! still referenced leaves the accounting at once; its unload waits for the
//! last `release`, and acquiring it again before then revives it in place.
//!
//! Loads run without the state lock. Room for a loading model is reserved up
//! front, and concurrent acquires of the same id wait on that one load.

pub mod loader;
pub mod registry;

pub use loader::RoutedModelLoader;
pub use registry::{ExecutionBackend, ModelCacheConfig, ModelPriority, ModelSpec};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::types::{Error, ModelId, Result};

/// A model as loaded by a [`ModelLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModel {
    pub id: ModelId,
    pub size_bytes: u64,
    pub backend: ExecutionBackend,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn new(id: ModelId, spec: &ModelSpec) -> Self {
        Self {
            id,
            size_bytes: spec.size_bytes,
            backend: spec.backend,
            loaded_at: Utc::now(),
        }
    }
}

/// Loads and unloads models on behalf of the cache.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, id: &ModelId, spec: &ModelSpec) -> Result<LoadedModel>;

    async fn unload(&self, model: &LoadedModel);
}

/// Reference to a resident model returned by [`ModelCache::acquire`].
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub id: ModelId,
    pub model: Arc<LoadedModel>,
}

#[derive(Debug)]
struct CacheEntry {
    model: Arc<LoadedModel>,
    size_bytes: u64,
    last_access: Instant,
    pinned: bool,
    refs: usize,
}

/// Evicted but still referenced. At most one per id.
#[derive(Debug)]
struct DeferredUnload {
    model: Arc<LoadedModel>,
    refs: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ModelId, CacheEntry>,
    deferred: HashMap<ModelId, DeferredUnload>,
    /// In-flight loads. Dropping the sender wakes the waiters.
    loading: HashMap<ModelId, watch::Sender<()>>,
    /// Includes the reservations of in-flight loads.
    resident_bytes: u64,
    pinned_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    /// Least recently accessed non-pinned entry, larger first on a tie.
    fn pick_victim(&self) -> Option<ModelId> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.pinned)
            .min_by_key(|(_, e)| (e.last_access, Reverse(e.size_bytes)))
            .map(|(id, _)| id.clone())
    }

    /// Remove from accounting. Returns the model if it can be unloaded now.
    fn remove(&mut self, id: &ModelId) -> Option<Option<Arc<LoadedModel>>> {
        let entry = self.entries.remove(id)?;
        self.resident_bytes -= entry.size_bytes;
        if entry.pinned {
            self.pinned_bytes -= entry.size_bytes;
        }
        if entry.refs == 0 {
            Some(Some(entry.model))
        } else {
            self.deferred.insert(
                id.clone(),
                DeferredUnload {
                    model: entry.model,
                    refs: entry.refs,
                },
            );
            Some(None)
        }
    }

    /// Check that `size` can become resident and evict until it fits.
    /// Returns the evicted models that must be unloaded now.
    fn make_room(
        &mut self,
        id: &ModelId,
        size: u64,
        capacity: u64,
    ) -> Result<Vec<Arc<LoadedModel>>> {
        if size > capacity {
            return Err(Error::InsufficientCapacity(format!(
                "model {} needs {} bytes, cache capacity is {}",
                id, size, capacity
            )));
        }
        if size > capacity - self.pinned_bytes {
            return Err(Error::InsufficientCapacity(format!(
                "model {} needs {} bytes, {} of {} are pinned",
                id, size, self.pinned_bytes, capacity
            )));
        }

        let mut unload = Vec::new();
        while self.resident_bytes + size > capacity {
            let Some(victim) = self.pick_victim() else {
                return Err(Error::InsufficientCapacity(format!(
                    "no evictable model frees room for {}",
                    id
                )));
            };
            let unload_now = self.remove(&victim).flatten();
            self.evictions += 1;
            tracing::info!(
                model = %victim,
                deferred = unload_now.is_none(),
                for_model = %id,
                "model evicted"
            );
            unload.extend(unload_now);
        }
        Ok(unload)
    }
}

/// Gives back the reservation of a load whose `acquire` was dropped midway.
struct LoadReservation {
    state: Arc<RwLock<CacheState>>,
    id: ModelId,
    size_bytes: u64,
    armed: bool,
}

impl LoadReservation {
    fn settle(state: &mut CacheState, id: &ModelId, size_bytes: u64) {
        state.loading.remove(id);
        state.resident_bytes -= size_bytes;
    }
}

impl Drop for LoadReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.state.try_write() {
            Self::settle(&mut state, &self.id, self.size_bytes);
            return;
        }
        let (state, id, size_bytes) = (Arc::clone(&self.state), self.id.clone(), self.size_bytes);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                Self::settle(&mut *state.write().await, &id, size_bytes);
            });
        }
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ModelCacheStats {
    pub capacity_bytes: u64,
    pub resident_bytes: u64,
    pub pinned_bytes: u64,
    pub resident_models: usize,
    pub loading_models: usize,
    pub deferred_unloads: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Model cache. Mutations take the write lock, never across a load; stats
/// take the read lock.
pub struct ModelCache {
    config: ModelCacheConfig,
    loader: Arc<dyn ModelLoader>,
    state: Arc<RwLock<CacheState>>,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("capacity_bytes", &self.config.capacity_bytes)
            .field("registry", &self.config.registry.len())
            .finish_non_exhaustive()
    }
}

impl ModelCache {
    pub fn new(config: ModelCacheConfig, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            config,
            loader,
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.config.capacity_bytes
    }

    /// Get a resident model, loading (and evicting) on a miss.
    pub async fn acquire(&self, id: &ModelId) -> Result<ModelHandle> {
        let capacity = self.config.capacity_bytes;
        let mut counted = false;

        let (spec, evicted, loaded_tx) = loop {
            let mut state = self.state.write().await;

            if let Some(entry) = state.entries.get_mut(id) {
                entry.last_access = Instant::now();
                entry.refs += 1;
                let model = Arc::clone(&entry.model);
                if !counted {
                    state.hits += 1;
                }
                tracing::trace!(model = %id, "model cache hit");
                return Ok(ModelHandle {
                    id: id.clone(),
                    model,
                });
            }
            if !counted {
                state.misses += 1;
                counted = true;
            }

            let waiting = state.loading.get(id).map(watch::Sender::subscribe);
            if let Some(mut waiting) = waiting {
                drop(state);
                // Err once the loader settles, success or not.
                let _ = waiting.changed().await;
                continue;
            }

            if let Some(size) = state.deferred.get(id).map(|d| d.model.size_bytes) {
                let evicted = state.make_room(id, size, capacity)?;
                let revived = state.deferred.remove(id);
                if let Some(revived) = revived {
                    let model = Arc::clone(&revived.model);
                    state.resident_bytes += size;
                    state.entries.insert(
                        id.clone(),
                        CacheEntry {
                            model: Arc::clone(&model),
                            size_bytes: size,
                            last_access: Instant::now(),
                            pinned: false,
                            refs: revived.refs + 1,
                        },
                    );
                    tracing::info!(model = %id, refs = revived.refs + 1, "evicted model revived");
                    drop(state);
                    self.unload_all(evicted).await;
                    return Ok(ModelHandle {
                        id: id.clone(),
                        model,
                    });
                }
            }

            let spec = self
                .config
                .registry
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("model {} is not in the registry", id)))?;
            let evicted = state.make_room(id, spec.size_bytes, capacity)?;
            state.resident_bytes += spec.size_bytes;
            let (loaded_tx, _) = watch::channel(());
            state.loading.insert(id.clone(), loaded_tx.clone());
            break (spec, evicted, loaded_tx);
        };

        let mut reservation = LoadReservation {
            state: Arc::clone(&self.state),
            id: id.clone(),
            size_bytes: spec.size_bytes,
            armed: true,
        };
        self.unload_all(evicted).await;
        let loaded = self.loader.load(id, &spec).await;

        let mut state = self.state.write().await;
        reservation.armed = false;
        state.loading.remove(id);
        drop(loaded_tx);
        let model = match loaded {
            Ok(model) => Arc::new(model),
            Err(e) => {
                state.resident_bytes -= spec.size_bytes;
                tracing::warn!(model = %id, error = %e, "model load failed");
                return Err(e);
            }
        };
        state.entries.insert(
            id.clone(),
            CacheEntry {
                model: Arc::clone(&model),
                size_bytes: spec.size_bytes,
                last_access: Instant::now(),
                pinned: false,
                refs: 1,
            },
        );
        tracing::info!(
            model = %id,
            size_bytes = spec.size_bytes,
            resident_bytes = state.resident_bytes,
            "model loaded"
        );
        Ok(ModelHandle {
            id: id.clone(),
            model,
        })
    }

    async fn unload_all(&self, models: Vec<Arc<LoadedModel>>) {
        for model in models {
            self.loader.unload(&model).await;
        }
    }

    /// Exclude a resident model from eviction.
    pub async fn pin(&self, id: &ModelId) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("model {} is not resident", id)))?;
        if !entry.pinned {
            entry.pinned = true;
            let size = entry.size_bytes;
            state.pinned_bytes += size;
        }
        Ok(())
    }

    pub async fn unpin(&self, id: &ModelId) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("model {} is not resident", id)))?;
        if entry.pinned {
            entry.pinned = false;
            let size = entry.size_bytes;
            state.pinned_bytes -= size;
        }
        Ok(())
    }

    /// Drop one reference. Never unloads a resident model by itself.
    pub async fn release(&self, id: &ModelId) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(entry) = state.entries.get_mut(id) {
            if entry.refs == 0 {
                return Err(Error::validation(format!(
                    "model {} released more often than acquired",
                    id
                )));
            }
            entry.refs -= 1;
            return Ok(());
        }

        let deferred = state
            .deferred
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("model {} is not resident", id)))?;
        deferred.refs -= 1;
        let done = if deferred.refs == 0 {
            state.deferred.remove(id)
        } else {
            None
        };
        drop(state);
        if let Some(done) = done {
            tracing::debug!(model = %id, "deferred unload after last release");
            self.loader.unload(&done.model).await;
        }
        Ok(())
    }

    /// Remove a model explicitly, pinned or not.
    pub async fn unload(&self, id: &ModelId) -> Result<()> {
        let mut state = self.state.write().await;
        let unload_now = state
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("model {} is not resident", id)))?;
        drop(state);
        tracing::info!(model = %id, deferred = unload_now.is_none(), "model unloaded");
        if let Some(model) = unload_now {
            self.loader.unload(&model).await;
        }
        Ok(())
    }

    /// Load registry entries flagged `warmup`, pinning high-priority ones.
    /// Returns the number of models made resident.
    pub async fn warm_up(&self) -> usize {
        let mut warm: Vec<(&ModelId, &ModelSpec)> = self
            .config
            .registry
            .iter()
            .filter(|(_, spec)| spec.warmup)
            .collect();
        warm.sort_by_key(|(_, spec)| Reverse(spec.priority));

        let mut loaded = 0;
        for (id, spec) in warm {
            let result = async {
                self.acquire(id).await?;
                if spec.priority == ModelPriority::High {
                    self.pin(id).await?;
                }
                self.release(id).await
            }
            .await;
            match result {
                Ok(()) => loaded += 1,
                Err(e) => tracing::warn!(model = %id, error = %e, "model warm-up failed"),
            }
        }
        loaded
    }

    /// Whether any registry entry asks to be loaded at startup.
    pub fn has_warmup(&self) -> bool {
        self.config.registry.values().any(|spec| spec.warmup)
    }

    pub async fn is_resident(&self, id: &ModelId) -> bool {
        self.state.read().await.entries.contains_key(id)
    }

    pub async fn stats(&self) -> ModelCacheStats {
        let state = self.state.read().await;
        ModelCacheStats {
            capacity_bytes: self.config.capacity_bytes,
            resident_bytes: state.resident_bytes,
            pinned_bytes: state.pinned_bytes,
            resident_models: state.entries.len(),
            loading_models: state.loading.len(),
            deferred_unloads: state.deferred.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::time::Duration;

    const MB: u64 = 1024 * 1024;

    /// Loader recording load/unload calls.
    #[derive(Debug, Default)]
    struct RecordingLoader {
        events: Mutex<Vec<String>>,
    }

    impl RecordingLoader {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelLoader for RecordingLoader {
        async fn load(&self, id: &ModelId, spec: &ModelSpec) -> Result<LoadedModel> {
            self.events.lock().unwrap().push(format!("load {}", id));
            Ok(LoadedModel::new(id.clone(), spec))
        }

        async fn unload(&self, model: &LoadedModel) {
            self.events.lock().unwrap().push(format!("unload {}", model.id));
        }
    }

    fn id(name: &str) -> ModelId {
        ModelId::must(name)
    }

    fn cache(capacity: u64, models: &[(&str, u64)]) -> (ModelCache, Arc<RecordingLoader>) {
        let mut config = ModelCacheConfig {
            capacity_bytes: capacity,
            ..ModelCacheConfig::default()
        };
        for (name, size) in models {
            config = config.with_model(name, ModelSpec::new(*size));
        }
        let loader = Arc::new(RecordingLoader::default());
        (ModelCache::new(config, loader.clone()), loader)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_does_not_reload() {
        let (cache, loader) = cache(100, &[("a", 10)]);
        cache.acquire(&id("a")).await.unwrap();
        cache.acquire(&id("a")).await.unwrap();

        assert_eq!(loader.events(), vec!["load a"]);
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_not_found() {
        let (cache, _) = cache(100, &[]);
        assert!(matches!(
            cache.acquire(&id("missing")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_larger_than_capacity_rejected() {
        let (cache, loader) = cache(100, &[("huge", 101)]);
        assert!(matches!(
            cache.acquire(&id("huge")).await,
            Err(Error::InsufficientCapacity(_))
        ));
        assert!(loader.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recent() {
        let (cache, loader) = cache(100, &[("a", 40), ("b", 40), ("c", 40)]);
        cache.acquire(&id("a")).await.unwrap();
        cache.release(&id("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.acquire(&id("b")).await.unwrap();
        cache.release(&id("b")).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        // Touch a so b becomes least recent.
        cache.acquire(&id("a")).await.unwrap();
        cache.release(&id("a")).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;

        cache.acquire(&id("c")).await.unwrap();
        assert!(cache.is_resident(&id("a")).await);
        assert!(!cache.is_resident(&id("b")).await);
        assert!(loader.events().contains(&"unload b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_evicts_larger_first() {
        let (cache, _) = cache(100, &[("small", 30), ("large", 50), ("next", 40)]);
        // Same instant: paused clock, no advance.
        cache.acquire(&id("small")).await.unwrap();
        cache.acquire(&id("large")).await.unwrap();
        cache.release(&id("small")).await.unwrap();
        cache.release(&id("large")).await.unwrap();

        cache.acquire(&id("next")).await.unwrap();
        assert!(cache.is_resident(&id("small")).await);
        assert!(!cache.is_resident(&id("large")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_never_evicted() {
        let (cache, _) = cache(100, &[("pinned", 60), ("b", 30), ("c", 30)]);
        cache.acquire(&id("pinned")).await.unwrap();
        cache.pin(&id("pinned")).await.unwrap();
        cache.release(&id("pinned")).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;

        cache.acquire(&id("b")).await.unwrap();
        cache.release(&id("b")).await.unwrap();
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.acquire(&id("c")).await.unwrap();

        assert!(cache.is_resident(&id("pinned")).await);
        assert!(!cache.is_resident(&id("b")).await);
        let stats = cache.stats().await;
        assert_eq!(stats.pinned_bytes, 60);
        assert!(stats.resident_bytes <= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_bytes_reduce_usable_capacity() {
        let (cache, _) = cache(100, &[("pinned", 60), ("big", 50)]);
        cache.acquire(&id("pinned")).await.unwrap();
        cache.pin(&id("pinned")).await.unwrap();
        assert!(matches!(
            cache.acquire(&id("big")).await,
            Err(Error::InsufficientCapacity(_))
        ));

        cache.unpin(&id("pinned")).await.unwrap();
        cache.release(&id("pinned")).await.unwrap();
        cache.acquire(&id("big")).await.unwrap();
        assert!(!cache.is_resident(&id("pinned")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicting_referenced_model_defers_unload() {
        let (cache, loader) = cache(2000 * MB, &[("model-a", 1200 * MB), ("model-b", 1000 * MB)]);
        cache.acquire(&id("model-a")).await.unwrap();
        cache.acquire(&id("model-b")).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.resident_bytes, 1000 * MB);
        assert_eq!(stats.deferred_unloads, 1);
        assert!(!loader.events().contains(&"unload model-a".to_string()));

        cache.release(&id("model-a")).await.unwrap();
        assert!(loader.events().contains(&"unload model-a".to_string()));
        assert_eq!(cache.stats().await.deferred_unloads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_revives_evicted_model_without_unload() {
        let (cache, loader) = cache(100, &[("a", 60), ("b", 60)]);
        cache.acquire(&id("a")).await.unwrap();
        cache.acquire(&id("b")).await.unwrap();
        assert_eq!(cache.stats().await.deferred_unloads, 1);
        cache.release(&id("b")).await.unwrap();

        cache.acquire(&id("a")).await.unwrap();
        cache.release(&id("a")).await.unwrap();

        assert!(cache.is_resident(&id("a")).await);
        assert_eq!(loader.events(), vec!["load a", "load b", "unload b"]);
        let stats = cache.stats().await;
        assert_eq!(stats.deferred_unloads, 0);
        assert_eq!(stats.resident_bytes, 60);

        // Both references are accounted on the live entry.
        cache.release(&id("a")).await.unwrap();
        assert!(cache.release(&id("a")).await.is_err());
        assert!(!loader.events().contains(&"unload a".to_string()));
    }

    /// Loader whose loads of `slow` wait for a gate.
    #[derive(Debug, Default)]
    struct GatedLoader {
        gate: tokio::sync::Notify,
        loads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelLoader for GatedLoader {
        async fn load(&self, id: &ModelId, spec: &ModelSpec) -> Result<LoadedModel> {
            self.loads.lock().unwrap().push(id.to_string());
            if id.as_str() == "slow" {
                self.gate.notified().await;
            }
            Ok(LoadedModel::new(id.clone(), spec))
        }

        async fn unload(&self, _model: &LoadedModel) {}
    }

    #[tokio::test]
    async fn test_slow_load_does_not_block_other_models() {
        let config = ModelCacheConfig {
            capacity_bytes: 100,
            ..ModelCacheConfig::default()
        }
        .with_model("fast", ModelSpec::new(10))
        .with_model("slow", ModelSpec::new(10));
        let loader = Arc::new(GatedLoader::default());
        let cache = Arc::new(ModelCache::new(config, loader.clone()));
        cache.acquire(&id("fast")).await.unwrap();

        let first = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.acquire(&id("slow")).await }
        });
        while cache.stats().await.loading_models == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.acquire(&id("slow")).await }
        });

        tokio::time::timeout(Duration::from_secs(1), cache.acquire(&id("fast")))
            .await
            .expect("hit served during a load")
            .unwrap();
        assert!(!cache.is_resident(&id("slow")).await);
        assert_eq!(cache.stats().await.resident_bytes, 20);

        loader.gate.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(*loader.loads.lock().unwrap(), vec!["fast", "slow"]);
        let stats = cache.stats().await;
        assert_eq!(stats.loading_models, 0);
        assert_eq!(stats.resident_models, 2);
    }

    #[tokio::test]
    async fn test_failed_load_returns_reservation() {
        let mut loader = MockModelLoader::new();
        loader
            .expect_load()
            .returning(|id, _| Err(Error::SpawnFailed(format!("no executor for {}", id))));
        let config = ModelCacheConfig {
            capacity_bytes: 100,
            ..ModelCacheConfig::default()
        }
        .with_model("a", ModelSpec::new(80));
        let cache = ModelCache::new(config, Arc::new(loader));

        assert!(cache.acquire(&id("a")).await.is_err());
        assert!(cache.acquire(&id("a")).await.is_err());
        let stats = cache.stats().await;
        assert_eq!((stats.resident_bytes, stats.loading_models), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_never_unloads_resident() {
        let (cache, loader) = cache(100, &[("a", 10)]);
        cache.acquire(&id("a")).await.unwrap();
        cache.release(&id("a")).await.unwrap();
        assert!(cache.is_resident(&id("a")).await);
        assert_eq!(loader.events(), vec!["load a"]);
        assert!(cache.release(&id("a")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_unload_removes_pinned() {
        let (cache, loader) = cache(100, &[("a", 10)]);
        cache.acquire(&id("a")).await.unwrap();
        cache.pin(&id("a")).await.unwrap();
        cache.release(&id("a")).await.unwrap();

        cache.unload(&id("a")).await.unwrap();
        assert!(!cache.is_resident(&id("a")).await);
        assert_eq!(cache.stats().await.pinned_bytes, 0);
        assert_eq!(loader.events(), vec!["load a", "unload a"]);
        assert!(matches!(cache.unload(&id("a")).await, Err(Error::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_pins_high_priority() {
        let config = ModelCacheConfig {
            capacity_bytes: 100,
            ..ModelCacheConfig::default()
        }
        .with_model(
            "hot",
            ModelSpec::new(20).with_priority(ModelPriority::High).with_warmup(),
        )
        .with_model("warm", ModelSpec::new(20).with_warmup())
        .with_model("cold", ModelSpec::new(20));
        let cache = ModelCache::new(config, Arc::new(RecordingLoader::default()));

        assert_eq!(cache.warm_up().await, 2);
        let stats = cache.stats().await;
        assert_eq!(stats.resident_models, 2);
        assert_eq!(stats.pinned_bytes, 20);
        assert!(!cache.is_resident(&id("cold")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_propagates() {
        let mut loader = MockModelLoader::new();
        loader
            .expect_load()
            .times(1)
            .returning(|id, _| Err(Error::SpawnFailed(format!("no executor for {}", id))));
        loader.expect_unload().never();

        let config = ModelCacheConfig::default().with_model("a", ModelSpec::new(10));
        let cache = ModelCache::new(config, Arc::new(loader));
        assert!(matches!(
            cache.acquire(&id("a")).await,
            Err(Error::SpawnFailed(_))
        ));
        assert_eq!(cache.stats().await.resident_bytes, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(usize),
        Release(usize),
        Pin(usize),
        Unpin(usize),
        Tick,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6).prop_map(Op::Acquire),
            (0usize..6).prop_map(Op::Release),
            (0usize..6).prop_map(Op::Pin),
            (0usize..6).prop_map(Op::Unpin),
            Just(Op::Tick),
        ]
    }

    proptest! {
        #[test]
        fn prop_resident_within_capacity_and_pins_survive(
            sizes in proptest::collection::vec(1u64..60, 6),
            ops in proptest::collection::vec(op(), 1..80),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            runtime.block_on(async {
                let models: Vec<(String, u64)> = sizes
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (format!("m{}", i), *s))
                    .collect();
                let refs: Vec<(&str, u64)> = models.iter().map(|(n, s)| (n.as_str(), *s)).collect();
                let (cache, _) = cache(100, &refs);

                for op in ops {
                    let pinned_before: Vec<ModelId> = {
                        let state = cache.state.read().await;
                        state.entries.iter().filter(|(_, e)| e.pinned).map(|(id, _)| id.clone()).collect()
                    };
                    match op {
                        Op::Acquire(i) => { let _ = cache.acquire(&id(&models[i].0)).await; }
                        Op::Release(i) => { let _ = cache.release(&id(&models[i].0)).await; }
                        Op::Pin(i) => { let _ = cache.pin(&id(&models[i].0)).await; }
                        Op::Unpin(i) => { let _ = cache.unpin(&id(&models[i].0)).await; }
                        Op::Tick => tokio::time::advance(Duration::from_millis(1)).await,
                    }
                    let stats = cache.stats().await;
                    assert!(stats.resident_bytes <= stats.capacity_bytes);
                    assert!(stats.pinned_bytes <= stats.resident_bytes);
                    if !matches!(op, Op::Unpin(_)) {
                        for pinned in &pinned_before {
                            assert!(cache.is_resident(pinned).await);
                        }
                    }
                }
            });
        }
    }
}
