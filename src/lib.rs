//! # Switchyard - Multi-Process Host Core
//!
//! Host-side core of a multi-process application runtime:
//! - Message router with request/response correlation, pub/sub, streams and
//!   per-role admission (validation, allow-lists, rate limiting)
//! - Process supervisor with role-specific crash recovery, health checks and
//!   warm pools
//! - Bounded model cache with LRU-with-pinning eviction
//! - Request orchestrator with fingerprint deduplication and TTL result cache
//! - TCP+msgpack transport for out-of-process workers
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!   workers  ←→   │  IpcServer ─→ Router ←─ Supervisor        │
//!  (TCP frames)   │                 ↑            ↑            │
//!                 │            Orchestrator ─→ ModelCache     │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! Every subsystem is shared through `Arc` and synchronizes internally;
//! [`kernel::Host`] wires them together.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod envelope;
pub mod ipc;
pub mod kernel;
pub mod models;
pub mod orchestrator;
pub mod router;
pub mod types;
pub mod validation;

// Internal utilities
pub mod observability;

pub use kernel::Host;
pub use types::{Error, HostConfig, Result};
