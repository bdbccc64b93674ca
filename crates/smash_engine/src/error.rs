//! Error types for the replication engine.

use smash_protocol::ProtocolError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations.
pub type SmashResult<T> = Result<T, SmashError>;

/// Errors that can occur while replicating tables.
#[derive(Error, Debug)]
pub enum SmashError {
    /// Malformed arguments, rejected before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// A change context would exceed its unit budget.
    #[error("change budget exceeded: operation costs {cost} units, {remaining} of {limit} remaining")]
    ChangeBudgetExceeded {
        /// Cost of the rejected operation.
        cost: u32,
        /// Units still available.
        remaining: u32,
        /// Total budget of a context.
        limit: u32,
    },

    /// Mutation of a frozen, deleted or committed record.
    #[error("stale edit: {0}")]
    StaleEdit(String),

    /// The change context was already committed.
    #[error("change context already committed")]
    ContextExhausted,

    /// The record is already tracked by the change context.
    #[error("record {0} is already tracked by this change context")]
    DuplicateAdd(Uuid),

    /// Two joined tables share a type hash.
    #[error("table `{name}` collides with a joined table on type hash {type_hash:#010x}")]
    DuplicateTable {
        /// Name of the rejected table.
        name: String,
        /// Colliding hash.
        type_hash: u32,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The coordination service rejected the request.
    #[error("server error ({status}): {message}")]
    Server {
        /// Status code reported by the service.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Client-side deadline exceeded.
    #[error("operation timed out")]
    Timeout,

    /// In-flight request aborted by the caller.
    #[error("request aborted")]
    Aborted,

    /// Payload or message codec error.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport is closed.
    #[error("not connected to server")]
    NotConnected,

    /// The session was shut down.
    #[error("session is shut down")]
    SessionClosed,

    /// I/O error while starting session threads.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmashError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a stale edit error.
    pub fn stale(message: impl Into<String>) -> Self {
        Self::StaleEdit(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SmashError::Transport { retryable, .. } => *retryable,
            SmashError::Timeout => true,
            SmashError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SmashError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Json(e) => SmashError::Codec(e.to_string()),
            other => SmashError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SmashError::transport_retryable("connection reset").is_retryable());
        assert!(!SmashError::transport_fatal("bad certificate").is_retryable());
        assert!(SmashError::Timeout.is_retryable());
        assert!(SmashError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());
        assert!(!SmashError::Server {
            status: 404,
            message: "unknown session".into()
        }
        .is_retryable());
        assert!(!SmashError::Aborted.is_retryable());
    }

    #[test]
    fn protocol_errors_map_to_validation() {
        let err: SmashError = ProtocolError::invalid_field("rows", "must not be empty").into();
        assert!(matches!(err, SmashError::Validation(_)));
    }

    #[test]
    fn budget_display() {
        let err = SmashError::ChangeBudgetExceeded {
            cost: 3,
            remaining: 1,
            limit: 100,
        };
        assert_eq!(
            err.to_string(),
            "change budget exceeded: operation costs 3 units, 1 of 100 remaining"
        );
    }
}
