//! Open Learn Grid Federation Library
//!
//! Core of a federated instance:
//! - Instance registry with graded trust and review flags
//! - Durable signed message queue with backoff, dead-lettering and an
//!   idempotent inbox
//! - Cursor-based sync reconciliation with trust-gated field acceptance
//! - Hash-chained audit log written in the same transaction as each mutation
//! - HTTP federation API, admin API and health report

pub mod audit;
pub mod auth;
pub mod delivery;
pub mod error;
pub mod health;
pub mod locks;
pub mod queue;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod sync;
pub mod transport;

pub use error::{Classify, FederationErrorKind};
pub use service::FederationService;
