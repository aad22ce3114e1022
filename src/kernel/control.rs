//! Host control messages sent by worker processes.
//!
//! Workers announce readiness, report resource usage, submit content for
//! analysis and read shared-buffer attachments by addressing `host.*`
//! envelopes to the host process.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use crate::envelope::{Envelope, SharedBuffers};
use crate::kernel::supervisor::Supervisor;
use crate::kernel::types::{HealthAssessment, ResourceUsage};
use crate::orchestrator::{ContentInput, Orchestrator};
use crate::router::HostHandler;
use crate::types::{BufferId, Error, Result};

/// Worker finished initializing.
pub const MSG_HOST_READY: &str = "host.ready";
/// Worker heartbeat with a resource usage snapshot.
pub const MSG_HOST_HEARTBEAT: &str = "host.heartbeat";
/// Submit `{kind, input}` to the orchestrator.
pub const MSG_HOST_ANALYZE: &str = "host.analyze";

/// Read `{bufferId, offset?}` from a shared-buffer attachment, one chunk at a time.
pub const MSG_HOST_BUFFER_READ: &str = "host.buffer.read";

pub const CONTROL_MESSAGES: [&str; 4] = [
    MSG_HOST_READY,
    MSG_HOST_HEARTBEAT,
    MSG_HOST_ANALYZE,
    MSG_HOST_BUFFER_READ,
];

/// Raw bytes per `host.buffer.read` reply. Hex-encoded, this stays well under
/// the default envelope limit.
pub const BUFFER_READ_CHUNK: usize = 256 * 1024;

/// Handler for every control message type.
///
/// Holds weak references: the router that invokes it is owned by the supervisor.
#[derive(Debug, Clone)]
pub struct HostControl {
    supervisor: Weak<Supervisor>,
    orchestrator: Weak<Orchestrator>,
    buffers: Weak<SharedBuffers>,
}

impl HostControl {
    pub fn new(
        supervisor: &Arc<Supervisor>,
        orchestrator: &Arc<Orchestrator>,
        buffers: &Arc<SharedBuffers>,
    ) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
            orchestrator: Arc::downgrade(orchestrator),
            buffers: Arc::downgrade(buffers),
        }
    }

    fn supervisor(&self) -> Result<Arc<Supervisor>> {
        self.supervisor
            .upgrade()
            .ok_or_else(|| Error::cancelled("host is shutting down"))
    }

    fn orchestrator(&self) -> Result<Arc<Orchestrator>> {
        self.orchestrator
            .upgrade()
            .ok_or_else(|| Error::cancelled("host is shutting down"))
    }

    fn buffers(&self) -> Result<Arc<SharedBuffers>> {
        self.buffers
            .upgrade()
            .ok_or_else(|| Error::cancelled("host is shutting down"))
    }
}

#[async_trait]
impl HostHandler for HostControl {
    async fn handle(&self, envelope: &Envelope) -> Result<Value> {
        let sender = envelope.sender_id;
        match envelope.message_type.as_str() {
            MSG_HOST_READY => {
                self.supervisor()?.mark_ready(sender)?;
                Ok(json!({ "pid": sender, "state": "ready" }))
            }

            MSG_HOST_HEARTBEAT => {
                let usage = parse_usage(&envelope.payload)?;
                let assessment = self.supervisor()?.report_health(sender, usage).await?;
                let status = match assessment {
                    HealthAssessment::Healthy => "healthy",
                    HealthAssessment::OverSoftLimit => "over_soft_limit",
                    HealthAssessment::OverHardLimit(_) => "over_hard_limit",
                };
                Ok(json!({ "status": status }))
            }

            MSG_HOST_ANALYZE => {
                let kind = str_field(&envelope.payload, "kind")?;
                let input: ContentInput = match envelope.payload.get("input") {
                    Some(raw) => serde_json::from_value(raw.clone())
                        .map_err(|e| Error::malformed(format!("invalid input: {}", e)))?,
                    None => return Err(Error::malformed("missing field: input")),
                };
                let result = self.orchestrator()?.submit(&kind, input).await?;
                Ok(serde_json::to_value(result.as_ref())?)
            }

            MSG_HOST_BUFFER_READ => {
                let buffer_id = envelope
                    .payload
                    .get("bufferId")
                    .and_then(Value::as_u64)
                    .map(BufferId::new)
                    .ok_or_else(|| Error::malformed("missing field: bufferId"))?;
                let offset = envelope.payload.get("offset").and_then(Value::as_u64).unwrap_or(0);
                let (chunk, total) = self.buffers()?.read(buffer_id, offset, BUFFER_READ_CHUNK)?;
                let next = offset + chunk.len() as u64;
                Ok(json!({
                    "bufferId": buffer_id,
                    "offset": offset,
                    "len": total,
                    "data": hex::encode(&chunk),
                    "eof": next >= total,
                }))
            }

            other => Err(Error::not_found(format!("unknown control message: {}", other))),
        }
    }
}

fn str_field(body: &Value, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::malformed(format!("missing field: {}", field)))
}

fn parse_usage(body: &Value) -> Result<ResourceUsage> {
    let memory_bytes = body.get("memory_bytes").and_then(Value::as_u64).unwrap_or(0);
    let cpu_percent = body.get("cpu_percent").and_then(Value::as_f64).unwrap_or(0.0);
    if !cpu_percent.is_finite() || cpu_percent < 0.0 {
        return Err(Error::malformed(format!("invalid cpu_percent: {}", cpu_percent)));
    }
    Ok(ResourceUsage {
        memory_bytes,
        cpu_percent,
    })
}
