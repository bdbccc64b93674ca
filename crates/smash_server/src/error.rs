//! Error types for the coordination server.

use smash_protocol::{Fault, ProtocolError, SessionId};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the coordination server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request body failed to decode or validate.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No session matches the meeting token.
    #[error("unknown meeting token")]
    UnknownToken,

    /// No session has this id.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Caller is not allowed to perform the operation.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Session lifetime has run out.
    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    /// No handler exists for the path.
    #[error("no endpoint at {0}")]
    UnknownEndpoint(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status reported for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Protocol(_) => 400,
            ServerError::NotAuthorized(_) => 403,
            ServerError::UnknownToken
            | ServerError::UnknownSession(_)
            | ServerError::UnknownEndpoint(_) => 404,
            ServerError::SessionExpired(_) => 410,
            ServerError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }

    /// Converts the error into a wire fault.
    pub fn to_fault(&self) -> Fault {
        Fault::new(self.status(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(ServerError::UnknownToken.is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn fault_carries_status() {
        let id = SessionId::new();
        let fault = ServerError::SessionExpired(id).to_fault();
        assert_eq!(fault.status, 410);
        assert!(fault.message.contains(&id.to_string()));
        assert!(!fault.is_server_fault());
    }

    #[test]
    fn protocol_errors_are_bad_requests() {
        let err: ServerError = ProtocolError::invalid_field("rows", "must not be empty").into();
        assert_eq!(err.status(), 400);
    }
}
