//! Error types for the protocol crate.

use thiserror::Error;
use uuid::Uuid;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row payload exceeds the per-row limit.
    #[error("row {guid} payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        /// Row identifier.
        guid: Uuid,
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// A field failed validation.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an invalid field error.
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
