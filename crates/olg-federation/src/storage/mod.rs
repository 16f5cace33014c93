//! SQLite storage for the federation service.
//!
//! Provides persistence for the instance registry, the message queue, sync
//! cursors and sessions, replicated records, the local change feed, and the
//! audit log. Query functions take a `&mut SqliteConnection` so callers can
//! run several of them inside one [`WriteTx`].

mod db;
mod models;
pub mod queries_audit;
pub mod queries_instances;
pub mod queries_messages;
pub mod queries_sync;


pub use db::{DatabaseError, FederationDatabase, WriteTx};
pub use models::*;
