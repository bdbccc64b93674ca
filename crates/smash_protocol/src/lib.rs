//! # Smash Protocol
//!
//! Wire types and JSON codecs for the Smash session replication protocol.
//!
//! This crate provides:
//! - Identifiers (`SessionId`, `ClientId`, `ManagementId`)
//! - `DataRow`, the unit of replication, and `RowAction`
//! - Request/response messages for every coordination endpoint
//! - JSON encoding/decoding via the `WireMessage` trait
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ids;
mod messages;
mod row;

pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ClientId, ManagementId, SessionId};
pub use messages::{
    Ack, CreateSessionRequest, CreateSessionResponse, Endpoint, EnumSessionsRequest,
    EnumSessionsResponse, Fault, GetRowsRequest, GetRowsResponse, JoinSessionRequest,
    JoinSessionResponse, ModifySessionRequest, SendRowsRequest, SendRowsResponse, SessionInfo,
    WipeSessionRequest, WireMessage, MAX_SESSION_LIFETIME_SECS,
};
pub use row::{DataRow, RowAction, MAX_ROW_PAYLOAD_BYTES};
