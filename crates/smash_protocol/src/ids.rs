//! Server-assigned identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a session on the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one participant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    /// Placeholder creator for records that have not been sent yet.
    pub const UNASSIGNED: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Owner-only secret authorizing enumerate, modify and wipe operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagementId(pub Uuid);

impl ManagementId {
    /// Generates a fresh random management id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ManagementId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let client = ClientId(7);
        assert_eq!(serde_json::to_string(&client).unwrap(), "7");

        let session = SessionId(Uuid::nil());
        assert_eq!(
            serde_json::to_string(&session).unwrap(),
            "\"00000000-0000-0000-0000-000000000000\""
        );
    }

    #[test]
    fn fresh_ids_differ() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_ne!(ManagementId::new(), ManagementId::new());
        assert_eq!(ClientId(3).to_string(), "client-3");
    }
}
