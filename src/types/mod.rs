//! Core types for the switchyard host.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, RequestId, ModelId, etc.)
//! - **Errors**: Application error taxonomy with thiserror derives
//! - **Config**: Configuration structures for router, supervisor, models and orchestrator

mod config;
mod errors;
mod ids;

pub use config::{
    BatchConfig, HostConfig, LateReplyPolicy, ObservabilityConfig, RouterConfig, ServerConfig,
};
pub use errors::{Error, Result};
pub use ids::{
    BufferId, IdAllocator, ModelId, ProcessId, RequestId, SessionId, StreamId, SubscriptionId,
};
