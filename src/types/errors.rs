//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. The enum is `Clone` so a single outcome
//! can be handed to every waiter attached to a deduplicated computation.

use thiserror::Error;

/// Application result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error enum for the switchyard host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // -------------------------------------------------------------------------
    // Transport / admission (returned synchronously, never retried)
    // -------------------------------------------------------------------------
    /// Recipient process id is not registered with the router.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// Recipient process has terminated.
    #[error("recipient gone: {0}")]
    RecipientGone(String),

    /// Envelope exceeds the configured size ceiling.
    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Sender role is not allowed to emit this message type.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Envelope failed structural or schema checks.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Per-(process, message type) admission window exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------
    /// Deadline elapsed before a reply arrived.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Process launcher could not start the process.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// Model cannot fit in the model cache.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Target process (or every process of a role) crashed.
    #[error("process crashed: {0}")]
    ProcessCrashed(String),

    /// Error reply produced by a worker process.
    #[error("remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    // -------------------------------------------------------------------------
    // Ambient
    // -------------------------------------------------------------------------
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Stable wire code, used in `Error` envelopes and IPC error frames.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::UnknownRecipient(_) => "UNKNOWN_RECIPIENT",
            Error::RecipientGone(_) => "RECIPIENT_GONE",
            Error::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Timeout(_) => "TIMEOUT",
            Error::SpawnFailed(_) => "SPAWN_FAILED",
            Error::InsufficientCapacity(_) => "INSUFFICIENT_CAPACITY",
            Error::ProcessCrashed(_) => "PROCESS_CRASHED",
            Error::Remote { .. } => "REMOTE",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Cancelled(_) => "CANCELLED",
            Error::Config(_) => "CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// Rebuild an error from a wire code and message (error replies).
    pub fn from_ipc_error_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "UNKNOWN_RECIPIENT" => Error::UnknownRecipient(message),
            "RECIPIENT_GONE" => Error::RecipientGone(message),
            "UNAUTHORIZED" => Error::Unauthorized(message),
            "MALFORMED_MESSAGE" => Error::MalformedMessage(message),
            "RATE_LIMITED" => Error::RateLimited(message),
            "TIMEOUT" => Error::Timeout(message),
            "PROCESS_CRASHED" => Error::ProcessCrashed(message),
            "INSUFFICIENT_CAPACITY" => Error::InsufficientCapacity(message),
            "NOT_FOUND" => Error::NotFound(message),
            other => Error::Remote {
                code: other.to_string(),
                message,
            },
        }
    }

    /// Transport and admission errors are reported to the sender and never
    /// retried automatically.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::UnknownRecipient(_)
                | Error::PayloadTooLarge { .. }
                | Error::Unauthorized(_)
                | Error::MalformedMessage(_)
                | Error::RateLimited(_)
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
