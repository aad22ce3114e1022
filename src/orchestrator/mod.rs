//! Orchestrator: domain requests on top of the router and the model cache.
//!
//! A submission is fingerprinted, answered from the result cache when an
//! unexpired entry exists, attached to an identical in-flight computation when
//! one is running, and otherwise computed once in a detached task: every facet
//! of the request kind is routed to a live process of its role (holding the
//! facet's model resident meanwhile) and the replies are aggregated.
//!
//! The detached task outlives any caller that stops waiting, so the remaining
//! waiters and the cache still get the result.

pub mod fingerprint;
pub mod kinds;

pub use fingerprint::{ContentInput, Fingerprint};
pub use kinds::{FacetSpec, OrchestratorConfig, RequestKindSpec};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::envelope::{AttachmentRef, Envelope, SharedBuffers};
use crate::kernel::recovery::recover_async;
use crate::kernel::supervisor::Supervisor;
use crate::models::ModelCache;
use crate::router::Router;
use crate::types::{Error, ProcessId, Result};

/// Aggregated outcome of one request kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub kind: String,
    pub fingerprint: Fingerprint,
    /// Reply payload per successful facet.
    pub facets: BTreeMap<String, Value>,
    /// Failure reason per failed non-mandatory facet.
    pub failed: BTreeMap<String, String>,
    pub computed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Every facet succeeded. Only complete results are cached.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct CachedResult {
    result: Arc<AnalysisResult>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CachedResult {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// `None` until the computation finishes.
type Outcome = Option<Result<Arc<AnalysisResult>>>;

/// Orchestrator statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub cached_results: usize,
    pub in_flight: usize,
    pub computations: u64,
    pub cache_hits: u64,
    /// Submissions attached to an already running computation.
    pub joined: u64,
}

/// Orchestrator. Shared as `Arc<Orchestrator>`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    kinds: HashMap<String, RequestKindSpec>,
    router: Router,
    supervisor: Arc<Supervisor>,
    models: Arc<ModelCache>,
    buffers: Arc<SharedBuffers>,
    results: DashMap<Fingerprint, CachedResult>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<Outcome>>>,
    computations: AtomicU64,
    cache_hits: AtomicU64,
    joined: AtomicU64,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("cached_results", &self.results.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        router: Router,
        supervisor: Arc<Supervisor>,
        models: Arc<ModelCache>,
        buffers: Arc<SharedBuffers>,
    ) -> Self {
        let kinds = config
            .kinds
            .iter()
            .map(|k| (k.name.clone(), k.clone()))
            .collect();
        Self {
            config,
            kinds,
            router,
            supervisor,
            models,
            buffers,
            results: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            computations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }

    pub fn kind(&self, name: &str) -> Option<&RequestKindSpec> {
        self.kinds.get(name)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Fingerprint, watch::Receiver<Outcome>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Submit a request of `kind`. Identical submissions share one
    /// computation and, once cached, the same `Arc`.
    pub async fn submit(
        self: &Arc<Self>,
        kind: &str,
        input: ContentInput,
    ) -> Result<Arc<AnalysisResult>> {
        let spec = self
            .kinds
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown request kind: {}", kind)))?;
        let fingerprint = Fingerprint::of(kind, &input);

        if let Some(hit) = self.cached(&fingerprint) {
            return Ok(hit);
        }

        let mut rx = {
            let mut in_flight = self.in_flight();
            // A computation may have finished since the first lookup.
            if let Some(hit) = self.cached(&fingerprint) {
                return Ok(hit);
            }
            match in_flight.get(&fingerprint) {
                Some(rx) => {
                    self.joined.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(kind = kind, fingerprint = %fingerprint, "joined in-flight computation");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(fingerprint.clone(), rx.clone());
                    self.spawn_computation(spec, fingerprint, input, tx);
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::internal("computation ended without a result"))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(Error::internal("computation ended without a result")),
        }
    }

    fn cached(&self, fingerprint: &Fingerprint) -> Option<Arc<AnalysisResult>> {
        let now = Instant::now();
        let hit = self
            .results
            .get(fingerprint)
            .and_then(|entry| (!entry.is_expired(now)).then(|| Arc::clone(&entry.result)));
        match hit {
            Some(result) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(fingerprint = %fingerprint, "result cache hit");
                Some(result)
            }
            None => {
                self.results
                    .remove_if(fingerprint, |_, entry| entry.is_expired(now));
                None
            }
        }
    }

    fn spawn_computation(
        self: &Arc<Self>,
        spec: RequestKindSpec,
        fingerprint: Fingerprint,
        input: ContentInput,
        tx: watch::Sender<Outcome>,
    ) {
        self.computations.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = recover_async(
                this.compute(&spec, &fingerprint, &input),
                "orchestrated computation",
            )
            .await
            .map(Arc::new);

            if let Ok(result) = &outcome {
                if result.is_complete() {
                    this.results.insert(
                        fingerprint.clone(),
                        CachedResult {
                            result: Arc::clone(result),
                            inserted_at: Instant::now(),
                            ttl: spec.ttl.unwrap_or(this.config.default_ttl),
                        },
                    );
                }
            }
            this.in_flight().remove(&fingerprint);

            match &outcome {
                Ok(result) => tracing::info!(
                    kind = %spec.name,
                    fingerprint = %fingerprint,
                    failed_facets = result.failed.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "computation completed"
                ),
                Err(e) => tracing::warn!(
                    kind = %spec.name,
                    fingerprint = %fingerprint,
                    error = %e,
                    "computation failed"
                ),
            }
            tx.send_replace(Some(outcome));
        });
    }

    async fn compute(
        &self,
        spec: &RequestKindSpec,
        fingerprint: &Fingerprint,
        input: &ContentInput,
    ) -> Result<AnalysisResult> {
        let attachment = (input.text.len() > self.config.inline_text_limit)
            .then(|| self.buffers.put(input.text.clone().into_bytes()));
        let payload = json!({
            "kind": spec.name,
            "url": input.url,
            "metadata": input.metadata,
            "text": if attachment.is_some() { None } else { Some(&input.text) },
        });

        let outcomes = join_all(
            spec.facets
                .iter()
                .map(|facet| self.run_facet(facet, &payload, attachment)),
        )
        .await;
        if let Some(attachment) = &attachment {
            self.buffers.release(attachment);
        }

        let mut facets = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for (facet, outcome) in spec.facets.iter().zip(outcomes) {
            match outcome {
                Ok(value) => {
                    facets.insert(facet.name.clone(), value);
                }
                Err(e) if facet.mandatory => {
                    tracing::warn!(kind = %spec.name, facet = %facet.name, error = %e, "mandatory facet failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(kind = %spec.name, facet = %facet.name, error = %e, "optional facet failed");
                    failed.insert(facet.name.clone(), e.to_string());
                }
            }
        }

        Ok(AnalysisResult {
            kind: spec.name.clone(),
            fingerprint: fingerprint.clone(),
            facets,
            failed,
            computed_at: Utc::now(),
        })
    }

    async fn run_facet(
        &self,
        facet: &FacetSpec,
        payload: &Value,
        attachment: Option<AttachmentRef>,
    ) -> Result<Value> {
        let pid = self.supervisor.pick(facet.role).ok_or_else(|| {
            if self.supervisor.is_degraded(facet.role) {
                Error::ProcessCrashed(format!("{} service is degraded", facet.role))
            } else {
                Error::RecipientGone(format!("no live {} process", facet.role))
            }
        })?;

        let model = match &facet.model {
            Some(id) => Some(self.models.acquire(id).await?),
            None => None,
        };

        let mut request = Envelope::request(ProcessId::HOST, pid, &facet.message_type, payload.clone());
        if let (Some(model), Some(body)) = (&model, request.payload.as_object_mut()) {
            body.insert("model".to_string(), json!(model.id));
        }
        if let Some(attachment) = attachment {
            request = request.with_attachment(attachment);
        }

        let outcome = self
            .router
            .request(request, facet.timeout)
            .await
            .map(|reply| reply.payload);

        if let Some(model) = model {
            if let Err(e) = self.models.release(&model.id).await {
                tracing::warn!(model = %model.id, error = %e, "model release failed");
            }
        }
        outcome
    }

    /// Administrative flush of the result cache.
    pub fn clear(&self) -> usize {
        let cleared = self.results.len();
        self.results.clear();
        tracing::info!(cleared = cleared, "result cache cleared");
        cleared
    }

    /// Drop expired results.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.results.len();
        self.results.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.results.len())
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            cached_results: self.results.len(),
            in_flight: self.in_flight().len(),
            computations: self.computations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            joined: self.joined.load(Ordering::Relaxed),
        }
    }
}
