//! Core enumerations for envelopes.
//!
//! Canonical definitions for the switchyard wire protocol.

use serde::{Deserialize, Serialize};

/// Routing kind of an envelope.
///
/// The router matches on this exhaustively; adding a kind is a compile error
/// everywhere routing decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// One-way message to a process.
    Notify,
    /// Expects exactly one `Response` or `Error` with the same request id.
    Request,
    /// Successful reply to a `Request`.
    Response,
    /// Terminal error reply to a `Request`.
    Error,
    /// Published on a topic, fanned out to subscribers.
    Event,
    /// Announces a new stream to the peer.
    StreamOpen,
    /// One ordered item on a stream.
    StreamData,
    /// End of a stream (payload carries the close reason).
    StreamClose,
}

impl MessageKind {
    /// Kinds that must carry a request id.
    pub fn requires_request_id(self) -> bool {
        matches!(
            self,
            MessageKind::Request | MessageKind::Response | MessageKind::Error
        )
    }

    /// Replies correlate with a pending request instead of being routed by type.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            MessageKind::StreamOpen | MessageKind::StreamData | MessageKind::StreamClose
        )
    }
}

/// Why a stream ended, as seen by its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "end", content = "reason", rename_all = "snake_case")]
pub enum StreamEnd {
    /// One side closed it deliberately.
    Clean,
    /// The stream was torn down (process terminated, sequence gap, ...).
    Abnormal(String),
}

impl StreamEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, StreamEnd::Clean)
    }
}
