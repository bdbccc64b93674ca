//! Data rows, the unit of replication.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::ClientId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest serialized payload a single row may carry.
pub const MAX_ROW_PAYLOAD_BYTES: usize = 64 * 1024;

/// What a row does to the record it names.
///
/// Travels on the wire as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RowAction {
    /// Record was created.
    Add,
    /// Record payload was replaced.
    Update,
    /// Record was removed.
    Delete,
}

impl RowAction {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            RowAction::Add => 1,
            RowAction::Update => 2,
            RowAction::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RowAction::Add),
            2 => Some(RowAction::Update),
            3 => Some(RowAction::Delete),
            _ => None,
        }
    }
}

impl From<RowAction> for u8 {
    fn from(action: RowAction) -> Self {
        action.to_code()
    }
}

impl TryFrom<u8> for RowAction {
    type Error = ProtocolError;

    fn try_from(code: u8) -> ProtocolResult<Self> {
        RowAction::from_code(code)
            .ok_or_else(|| ProtocolError::invalid_field("action", format!("unknown code {code}")))
    }
}

/// A single replicated change.
///
/// Rows are produced from local records for transmission and consumed to
/// reconstruct records when applied to a table.
///
/// # Fields
///
/// - `guid`: record identifier, stable for the life of the record
/// - `version`: server timestamp; zero until the server has accepted the row
/// - `creator`: participant that authored the row
/// - `type_hash`: identifies the table the row belongs to
/// - `payload`: serialized record payload, at most 64 KiB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRow {
    /// Action carried by the row.
    pub action: RowAction,
    /// Record identifier.
    pub guid: Uuid,
    /// Server-assigned version.
    pub version: u64,
    /// Authoring participant.
    pub creator: ClientId,
    /// Application-defined modification flag.
    pub modification_flag: i32,
    /// Hash identifying the destination table.
    pub type_hash: u32,
    /// Serialized payload.
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl DataRow {
    /// Creates an unversioned row.
    pub fn new(action: RowAction, guid: Uuid, type_hash: u32, payload: Vec<u8>) -> Self {
        Self {
            action,
            guid,
            version: 0,
            creator: ClientId::UNASSIGNED,
            modification_flag: 0,
            type_hash,
            payload,
        }
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Sets the creator.
    pub fn with_creator(mut self, creator: ClientId) -> Self {
        self.creator = creator;
        self
    }

    /// Sets the modification flag.
    pub fn with_modification_flag(mut self, flag: i32) -> Self {
        self.modification_flag = flag;
        self
    }

    /// Returns the size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Rejects rows whose payload exceeds [`MAX_ROW_PAYLOAD_BYTES`].
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.payload.len() > MAX_ROW_PAYLOAD_BYTES {
            return Err(ProtocolError::PayloadTooLarge {
                guid: self.guid,
                size: self.payload.len(),
                limit: MAX_ROW_PAYLOAD_BYTES,
            });
        }
        Ok(())
    }
}
