//! Envelope validation.
//!
//! Runs before an envelope enters the router's dispatch path and rejects:
//! - structurally invalid envelopes (`MalformedMessage`)
//! - message types outside the sender role's allow-list (`Unauthorized`)
//! - payloads failing a registered JSON Schema (`MalformedMessage`)
//! - envelopes whose inline encoding exceeds the ceiling (`PayloadTooLarge`)

use std::collections::HashMap;
use std::fmt;

use crate::envelope::{Envelope, MessageKind, Recipient};
use crate::kernel::types::{ProcessRole, RoleProfiles};
use crate::types::{Error, Result, RouterConfig};

const MAX_MESSAGE_TYPE_LEN: usize = 256;

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Envelope validator, built once from router config and role profiles.
pub struct Validator {
    max_envelope_bytes: usize,
    roles: RoleProfiles,
    schemas: HashMap<String, jsonschema::Validator>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schema_types: Vec<&String> = self.schemas.keys().collect();
        schema_types.sort();
        f.debug_struct("Validator")
            .field("max_envelope_bytes", &self.max_envelope_bytes)
            .field("schema_types", &schema_types)
            .finish()
    }
}

impl Validator {
    /// Compile payload schemas. Fails with `Config` on an invalid schema.
    pub fn new(config: &RouterConfig, roles: RoleProfiles) -> Result<Self> {
        let mut schemas = HashMap::new();
        for (message_type, schema) in &config.message_schemas {
            let compiled = jsonschema::validator_for(schema).map_err(|e| {
                Error::config(format!("invalid schema for {}: {}", message_type, e))
            })?;
            schemas.insert(message_type.clone(), compiled);
        }
        Ok(Self {
            max_envelope_bytes: config.max_envelope_bytes,
            roles,
            schemas,
        })
    }

    /// Run every check against an envelope from a sender of `sender_role`.
    pub fn validate(&self, envelope: &Envelope, sender_role: ProcessRole) -> Result<()> {
        self.check_structure(envelope)?;
        self.check_authorized(envelope, sender_role)?;
        self.check_schema(envelope)?;
        self.check_size(envelope)
    }

    fn check_structure(&self, envelope: &Envelope) -> Result<()> {
        let message_type = &envelope.message_type;
        if message_type.is_empty() {
            return Err(Error::malformed("message type cannot be empty"));
        }
        if message_type.len() > MAX_MESSAGE_TYPE_LEN
            || message_type.chars().any(char::is_whitespace)
        {
            return Err(Error::malformed(format!(
                "invalid message type: {:?}",
                message_type
            )));
        }

        let kind = envelope.kind;
        if kind.requires_request_id() && envelope.request_id.is_none() {
            return Err(Error::malformed(format!(
                "{:?} envelope '{}' is missing a request id",
                kind, message_type
            )));
        }
        if matches!(kind, MessageKind::Notify | MessageKind::Event) && envelope.request_id.is_some()
        {
            return Err(Error::malformed(format!(
                "{:?} envelope '{}' must not carry a request id",
                kind, message_type
            )));
        }
        if kind.is_stream() && envelope.stream_id.is_none() {
            return Err(Error::malformed(format!(
                "{:?} envelope '{}' is missing a stream id",
                kind, message_type
            )));
        }
        if kind == MessageKind::StreamData && envelope.seq.is_none() {
            return Err(Error::malformed(format!(
                "stream data '{}' is missing a sequence number",
                message_type
            )));
        }

        match (&envelope.recipient, kind) {
            (Recipient::Topic { topic }, MessageKind::Event) => validate_non_empty(topic, "topic")
                .map_err(|e| Error::malformed(e.to_string())),
            (Recipient::Topic { topic }, other) => Err(Error::malformed(format!(
                "{:?} envelope cannot be addressed to topic {}",
                other, topic
            ))),
            (Recipient::Process(_), MessageKind::Event) => Err(Error::malformed(
                "event envelopes must be addressed to a topic",
            )),
            (Recipient::Process(_), _) => Ok(()),
        }
    }

    fn check_authorized(&self, envelope: &Envelope, sender_role: ProcessRole) -> Result<()> {
        // Replies are checked by correlation, not by allow-list.
        if envelope.kind.is_reply() {
            return Ok(());
        }
        if self.roles.get(sender_role).allows(&envelope.message_type) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "role {} may not send '{}'",
                sender_role, envelope.message_type
            )))
        }
    }

    fn check_schema(&self, envelope: &Envelope) -> Result<()> {
        if !matches!(
            envelope.kind,
            MessageKind::Request | MessageKind::Notify | MessageKind::Event
        ) {
            return Ok(());
        }
        let Some(schema) = self.schemas.get(&envelope.message_type) else {
            return Ok(());
        };
        if let Some(error) = schema.iter_errors(&envelope.payload).next() {
            return Err(Error::malformed(format!(
                "payload of '{}' fails schema: {}",
                envelope.message_type, error
            )));
        }
        Ok(())
    }

    fn check_size(&self, envelope: &Envelope) -> Result<()> {
        let size = envelope.encoded_len();
        if size > self.max_envelope_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                limit: self.max_envelope_bytes,
            });
        }
        Ok(())
    }

    pub fn roles(&self) -> &RoleProfiles {
        &self.roles
    }

    pub fn max_envelope_bytes(&self) -> usize {
        self.max_envelope_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProcessId, RequestId, StreamId};
    use serde_json::json;

    fn validator() -> Validator {
        let mut config = RouterConfig {
            max_envelope_bytes: 512,
            ..RouterConfig::default()
        };
        config.message_schemas.insert(
            "model.classify".to_string(),
            json!({
                "type": "object",
                "required": ["text"],
                "properties": { "text": { "type": "string" } }
            }),
        );
        Validator::new(&config, RoleProfiles::default()).unwrap()
    }

    fn request(message_type: &str, payload: serde_json::Value) -> Envelope {
        let mut envelope = Envelope::request(ProcessId::HOST, ProcessId::new(2), message_type, payload);
        envelope.request_id = Some(RequestId::new(1));
        envelope
    }

    #[test]
    fn test_valid_request_passes() {
        let v = validator();
        v.validate(&request("model.classify", json!({"text": "hi"})), ProcessRole::Host)
            .unwrap();
    }

    #[test]
    fn test_role_allow_list() {
        let v = validator();
        let envelope = Envelope::notify(ProcessId::new(3), ProcessId::HOST, "model.load", json!({}));
        let err = v.validate(&envelope, ProcessRole::Renderer).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        v.validate(&envelope, ProcessRole::ModelExec).unwrap();
    }

    #[test]
    fn test_replies_skip_allow_list() {
        let v = validator();
        let reply = request("content.extract", json!({})).reply(json!({"ok": true}));
        v.validate(&reply, ProcessRole::ModelExec).unwrap();
    }

    #[test]
    fn test_structural_checks() {
        let v = validator();

        let mut missing_id = request("model.classify", json!({"text": "x"}));
        missing_id.request_id = None;
        assert!(matches!(
            v.validate(&missing_id, ProcessRole::Host),
            Err(Error::MalformedMessage(_))
        ));

        let mut notify_with_id =
            Envelope::notify(ProcessId::HOST, ProcessId::new(2), "host.ping", json!({}));
        notify_with_id.request_id = Some(RequestId::new(3));
        assert!(matches!(
            v.validate(&notify_with_id, ProcessRole::Host),
            Err(Error::MalformedMessage(_))
        ));

        let mut topic_notify =
            Envelope::notify(ProcessId::HOST, ProcessId::new(2), "host.ping", json!({}));
        topic_notify.recipient = Recipient::topic("tabs");
        assert!(matches!(
            v.validate(&topic_notify, ProcessRole::Host),
            Err(Error::MalformedMessage(_))
        ));

        let mut data = Envelope::stream_data(
            ProcessId::HOST,
            ProcessId::new(2),
            "model.tokens",
            StreamId::new(1),
            0,
            json!({}),
        );
        data.seq = None;
        assert!(matches!(
            v.validate(&data, ProcessRole::Host),
            Err(Error::MalformedMessage(_))
        ));

        let empty = Envelope::notify(ProcessId::HOST, ProcessId::new(2), "", json!({}));
        assert!(matches!(
            v.validate(&empty, ProcessRole::Host),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_schema_violation_is_malformed() {
        let v = validator();
        let err = v
            .validate(&request("model.classify", json!({"text": 42})), ProcessRole::Host)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
        assert!(err.to_string().contains("model.classify"));
    }

    #[test]
    fn test_size_ceiling() {
        let v = validator();
        let big = "x".repeat(1024);
        let err = v
            .validate(&request("model.classify", json!({"text": big})), ProcessRole::Host)
            .unwrap_err();
        match err {
            Error::PayloadTooLarge { size, limit } => {
                assert!(size > limit);
                assert_eq!(limit, 512);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_schema_is_config_error() {
        let mut config = RouterConfig::default();
        config
            .message_schemas
            .insert("x.y".to_string(), json!({"type": 12}));
        assert!(matches!(
            Validator::new(&config, RoleProfiles::default()),
            Err(Error::Config(_))
        ));
    }
}
