//! Envelope - the unit exchanged between processes.
//!
//! Wire shape (camelCase JSON or msgpack map):
//! ```text
//! { type, kind, senderId, recipientId | {topic}, requestId?, payload,
//!   timestamp, attachment?, streamId?, seq? }
//! ```
//! Large binary data travels out of band through [`SharedBuffers`]; the
//! envelope only carries an [`AttachmentRef`].

pub mod buffers;
pub mod enums;

pub use buffers::{AttachmentRef, SharedBuffers};
pub use enums::{MessageKind, StreamEnd};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{Error, ProcessId, RequestId, Result, StreamId};

/// Where an envelope is going.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipient {
    /// A specific registered process.
    Process(ProcessId),
    /// Every subscriber of a topic.
    Topic { topic: String },
}

impl Recipient {
    pub fn topic(name: impl Into<String>) -> Self {
        Recipient::Topic { topic: name.into() }
    }

    pub fn process(&self) -> Option<ProcessId> {
        match self {
            Recipient::Process(pid) => Some(*pid),
            Recipient::Topic { .. } => None,
        }
    }
}

impl From<ProcessId> for Recipient {
    fn from(pid: ProcessId) -> Self {
        Recipient::Process(pid)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Process(pid) => write!(f, "process:{}", pid),
            Recipient::Topic { topic } => write!(f, "topic:{}", topic),
        }
    }
}

/// A message between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,

    pub kind: MessageKind,

    pub sender_id: ProcessId,

    #[serde(rename = "recipientId")]
    pub recipient: Recipient,

    /// Present on requests, replies and stream envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,

    #[serde(default)]
    pub payload: Value,

    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,

    /// Position within a stream, starting at 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Envelope {
    fn base(
        kind: MessageKind,
        message_type: impl Into<String>,
        sender: ProcessId,
        recipient: Recipient,
        payload: Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            kind,
            sender_id: sender,
            recipient,
            request_id: None,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            attachment: None,
            stream_id: None,
            seq: None,
        }
    }

    /// One-way message to a process.
    pub fn notify(
        sender: ProcessId,
        recipient: ProcessId,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::base(MessageKind::Notify, message_type, sender, recipient.into(), payload)
    }

    /// Request to a process. The router assigns the request id on send.
    pub fn request(
        sender: ProcessId,
        recipient: ProcessId,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::base(MessageKind::Request, message_type, sender, recipient.into(), payload)
    }

    /// Event published on a topic. The topic doubles as the message type.
    pub fn event(sender: ProcessId, topic: impl Into<String>, payload: Value) -> Self {
        let topic = topic.into();
        Self::base(
            MessageKind::Event,
            topic.clone(),
            sender,
            Recipient::Topic { topic },
            payload,
        )
    }

    /// Item on a stream.
    pub fn stream_data(
        sender: ProcessId,
        recipient: ProcessId,
        message_type: impl Into<String>,
        stream_id: StreamId,
        seq: u64,
        payload: Value,
    ) -> Self {
        let mut envelope =
            Self::base(MessageKind::StreamData, message_type, sender, recipient.into(), payload);
        envelope.stream_id = Some(stream_id);
        envelope.seq = Some(seq);
        envelope
    }

    /// Stream control envelope (`StreamOpen` / `StreamClose`).
    pub fn stream_control(
        kind: MessageKind,
        sender: ProcessId,
        recipient: ProcessId,
        message_type: impl Into<String>,
        stream_id: StreamId,
        payload: Value,
    ) -> Self {
        let mut envelope = Self::base(kind, message_type, sender, recipient.into(), payload);
        envelope.stream_id = Some(stream_id);
        envelope
    }

    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Successful reply to this request.
    pub fn reply(&self, payload: Value) -> Self {
        self.reply_with(MessageKind::Response, payload)
    }

    /// Error reply to this request.
    pub fn error_reply(&self, error: &Error) -> Self {
        self.reply_with(
            MessageKind::Error,
            serde_json::json!({
                "code": error.to_ipc_error_code(),
                "message": error.to_string(),
            }),
        )
    }

    fn reply_with(&self, kind: MessageKind, payload: Value) -> Self {
        let from = self.recipient.process().unwrap_or(ProcessId::HOST);
        let mut envelope = Self::base(
            kind,
            self.message_type.clone(),
            from,
            self.sender_id.into(),
            payload,
        );
        envelope.request_id = self.request_id;
        envelope
    }

    /// Turn a reply into the caller's outcome.
    pub fn into_result(self) -> Result<Value> {
        self.into_response().map(|reply| reply.payload)
    }

    /// Keep a `Response` whole; convert an `Error` reply into its error.
    pub fn into_response(self) -> Result<Envelope> {
        match self.kind {
            MessageKind::Response => Ok(self),
            MessageKind::Error => {
                let code = self
                    .payload
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("REMOTE")
                    .to_string();
                let message = self
                    .payload
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Err(Error::from_ipc_error_code(&code, message))
            }
            other => Err(Error::malformed(format!(
                "expected a reply, got {:?}",
                other
            ))),
        }
    }

    /// Size of the inline encoding; attachments are not counted.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    pub fn recipient_process(&self) -> Option<ProcessId> {
        self.recipient.process()
    }
}
