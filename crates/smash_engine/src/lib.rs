//! # Smash Engine
//!
//! Client-side record replication for Smash sessions.
//!
//! This crate provides:
//! - Records with a freeze/thaw ownership model (`Record`, `Frozen`, `Unfrozen`)
//! - Observable tables of frozen records
//! - Budgeted change contexts for local Add/Update/Delete
//! - A deduper with a retention window and adaptive transfer budget
//! - Session and management clients over a pluggable transport
//! - Sessions with a resilient background long-poll loop
//!
//! ## Architecture
//!
//! Local edits go through a `ChangeContext`: records are frozen and shown in
//! the table as pending, then sent with SendRows. The server assigns each row
//! an authoritative version, and the confirmation is applied back through the
//! deduper. Concurrently, the session's polling thread fetches rows authored
//! by other participants with GetRows and applies them through the same path.
//!
//! ## Key Invariants
//!
//! - Published records are immutable; edits happen on private copies
//! - A change context never exceeds 100 change units and commits once
//! - A `(record, version)` pair is applied at most once
//! - Only rows received from the network advance the session watermark
//! - Table mutations run one at a time on the session's dispatcher

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod context;
mod deduper;
mod dispatcher;
mod error;
mod http;
mod record;
mod session;
mod stats;
mod table;
mod transport;

pub use client::{ManagementClient, Participant, SessionClient};
pub use config::SessionConfig;
pub use context::{
    ChangeContext, SaveHandle, SaveReceipt, ADD_COST, CHANGE_UNIT_LIMIT, DELETE_COST, UPDATE_COST,
};
pub use deduper::{
    Deduper, REFERENCE_ROUND_TRIP, RETENTION_FLOOR, TRANSFER_BUDGET_CEILING, TRANSFER_BUDGET_FLOOR,
};
pub use dispatcher::{Dispatcher, ImmediateDispatcher, Job, ThreadDispatcher};
pub use error::{SmashError, SmashResult};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use record::{Envelope, Frozen, Payload, Record, RecordState, Unfrozen};
pub use session::{PollState, Session};
pub use stats::SessionStats;
pub use table::{type_hash_for, Table, TableChange, TableEvent};
pub use transport::{MockReply, MockTransport, SessionTransport};
