//! Error types shared across the gateway.

use thiserror::Error;

use crate::clog::{ErrorCode, LogError};
use crate::status::MsgStatus;

/// Outcome of a handler `send` attempt.
///
/// Handlers do not build the final status themselves; they return one of
/// these sentinels and the sender classifies it into a status update plus a
/// channel-log error record.
#[derive(Debug, Error)]
pub enum SendError {
    /// The channel is misconfigured (missing token, bad endpoint, ...).
    #[error("channel config: {reason}")]
    ChannelConfig {
        /// What is missing or malformed.
        reason: String,
    },

    /// The provider could not be reached.
    #[error("connection failed: {reason}")]
    ConnectionFailed {
        /// Transport-level failure description.
        reason: String,
    },

    /// The provider is rate limiting us.
    #[error("connection throttled")]
    ConnectionThrottled,

    /// The provider answered with a non-success status code.
    #[error("unexpected response status {status}")]
    ResponseStatus {
        /// HTTP status code returned by the provider.
        status: u16,
    },

    /// The provider response could not be parsed.
    #[error("unparseable response: {reason}")]
    ResponseUnparseable {
        /// Parse failure description.
        reason: String,
    },

    /// The provider response parsed but did not contain what we expected.
    #[error("unexpected response: {reason}")]
    ResponseUnexpected {
        /// What was expected but not found.
        reason: String,
    },

    /// The contact has opted out on the provider side.
    #[error("contact has stopped or blocked this channel")]
    ContactStopped,

    /// The provider rejected the message with an explicit reason code.
    #[error("rejected by provider: {description}")]
    FailedWithReason {
        /// Provider-assigned rejection code.
        code: String,
        /// Human-readable rejection description.
        description: String,
    },

    /// Anything the handler could not map to a more specific kind.
    #[error("internal error: {reason}")]
    Internal {
        /// Failure description.
        reason: String,
    },
}

impl SendError {
    /// Whether the send may be retried by the upstream queue.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SendError::ConnectionFailed { .. }
                | SendError::ConnectionThrottled
                | SendError::Internal { .. }
        )
    }

    /// The status the sender records for this outcome.
    pub fn status(&self) -> MsgStatus {
        if self.retryable() {
            MsgStatus::Errored
        } else {
            MsgStatus::Failed
        }
    }

    /// The channel-log error record for this outcome.
    pub fn log_error(&self) -> LogError {
        match self {
            SendError::ChannelConfig { reason } => {
                LogError::new(ErrorCode::ChannelConfig, reason.clone())
            }
            SendError::ConnectionFailed { reason } => {
                LogError::new(ErrorCode::ConnectionFailed, reason.clone())
            }
            SendError::ConnectionThrottled => LogError::new(
                ErrorCode::ConnectionThrottled,
                "rate limited by the provider".to_string(),
            ),
            SendError::ResponseStatus { status } => LogError::new(
                ErrorCode::ResponseStatusCode,
                format!("provider returned status {status}"),
            ),
            SendError::ResponseUnparseable { reason } => {
                LogError::new(ErrorCode::ResponseUnparseable, reason.clone())
            }
            SendError::ResponseUnexpected { reason } => {
                LogError::new(ErrorCode::ResponseUnexpected, reason.clone())
            }
            SendError::ContactStopped => LogError::new(
                ErrorCode::ContactStopped,
                "contact has stopped or blocked this channel".to_string(),
            ),
            SendError::FailedWithReason { code, description } => {
                LogError::new(ErrorCode::RejectedWithReason, description.clone())
                    .with_ext_code(code.clone())
            }
            SendError::Internal { reason } => LogError::new(ErrorCode::InternalError, reason.clone()),
        }
    }
}

/// Errors returned by the backend the core consumes.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No channel with the requested UUID exists.
    #[error("channel not found")]
    ChannelNotFound,

    /// A channel exists but is of a different type than the route claims.
    #[error("channel type '{found}' does not match requested '{expected}'")]
    ChannelWrongType {
        /// Type the route asked for.
        expected: String,
        /// Type the stored channel actually has.
        found: String,
    },

    /// The channel was evicted from the backend cache and must be reloaded.
    #[error("channel expired")]
    ChannelExpired,

    /// Queue read/write failure.
    #[error("queue error: {reason}")]
    Queue {
        /// Failure description.
        reason: String,
    },

    /// Storage read/write failure.
    #[error("storage error: {reason}")]
    Storage {
        /// Failure description.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single field-level validation failure, rendered as `field '{name}' {tag}`.
#[derive(Debug, Clone)]
pub struct FieldError {
    pub name: String,
    pub tag: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "field '{}' {}", self.name, self.tag)
    }
}

/// Errors produced while servicing an inbound request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// One error item per validation failure in the response envelope.
    #[error("request failed validation")]
    Validation(Vec<FieldError>),

    /// The provider payload could not be understood.
    #[error("{0}")]
    Payload(String),

    /// The request failed provider authentication (bad signature, token, ...).
    #[error("unauthorized")]
    Unauthorized,

    /// Channel lookup or write failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RequestError {
    /// Convenience constructor for a single required-field failure.
    pub fn required(name: impl Into<String>) -> Self {
        RequestError::Validation(vec![FieldError {
            name: name.into(),
            tag: "required".to_string(),
        }])
    }
}

/// Errors from the on-disk spool.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The file contents could not be decoded; the file is quarantined.
    #[error("unparseable spool file: {reason}")]
    Unparseable {
        /// Decode failure description.
        reason: String,
    },

    /// The registered flusher could not deliver the value to the backend.
    #[error("flush failed: {reason}")]
    Flush {
        /// Failure description.
        reason: String,
    },

    /// I/O error reading or writing spool files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors surfaced at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A disallowed-network entry is not a valid IP or CIDR.
    #[error("invalid network '{value}': {reason}")]
    InvalidNetwork {
        /// The offending entry.
        value: String,
        /// Parse failure description.
        reason: String,
    },

    /// The backend selector names no compiled-in backend.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// A channel type tag in the include/exclude lists is malformed.
    #[error("invalid channel type '{0}'")]
    InvalidChannelType(String),
}

/// Errors from server startup and shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listen address.
    #[error("failed to bind {address}: {reason}")]
    Bind {
        /// Address we tried to bind.
        address: String,
        /// Bind failure description.
        reason: String,
    },

    /// Backend lifecycle failure.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Spool directory could not be prepared.
    #[error(transparent)]
    Spool(#[from] SpoolError),
}
