//! # Smash Server
//!
//! In-memory reference coordination service for Smash sessions.
//!
//! This crate provides:
//! - Handlers for every Smash endpoint (JoinSession, CreateSession,
//!   GetRows, SendRows, ModifySession, WipeSession, EnumSessions)
//! - Long-poll GetRows with a configurable ceiling
//! - Server-wide row versioning
//! - Owner authorization by management id
//!
//! # Architecture
//!
//! All state lives in a [`SessionStore`] behind a single mutex. Each
//! session keeps its participants and the full row log in version order,
//! plus a short recent-row window for cached reads. A GetRows call with
//! nothing newer than its watermark waits on a condition variable until a
//! SendRows or WipeSession on any session wakes it, or its hold runs out.
//!
//! The server speaks JSON bodies through [`CoordinationServer::handle_post`]
//! and leaves the choice of HTTP listener to the embedder.
//!
//! # Protocol
//!
//! 1. The owner creates a session and shares its meeting token
//! 2. Participants join and receive a client id
//! 3. Participants send rows; each row gets the next server version
//! 4. Participants long-poll for rows newer than their watermark

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::CoordinationServer;
pub use store::{SessionStore, StoreStats};
