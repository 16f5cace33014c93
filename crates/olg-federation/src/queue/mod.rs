//! Federation message queue.
//!
//! Durable outbox of signed messages per peer with bounded exponential
//! backoff and dead-lettering, plus the idempotent inbox for messages
//! arriving from peers. Every status transition is audited in the same
//! transaction that performs it.

mod inbox;
mod outbox;
mod policy;

pub use inbox::{AcknowledgeOnly, HandlerError, InboundHandler};
pub use outbox::{AttemptOutcome, EnqueueRequest};
pub use policy::RetryPolicy;

use std::sync::Arc;

use olg_core::Config;
use olg_crypto::SigningIdentity;

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::error::{Classify, FederationErrorKind};
use crate::locks::KeyedLocks;
use crate::registry::RegistryError;
use crate::storage::{DatabaseError, FederationDatabase};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance is not active: {0}")]
    InstanceInactive(String),

    #[error("Message {0} is not dead-lettered")]
    NotDeadLettered(String),

    #[error("Unknown source instance: {0}")]
    UnknownSource(String),

    #[error("Envelope addressed to {0}, not this instance")]
    WrongTarget(String),

    #[error("Envelope signature rejected: {0}")]
    BadSignature(String),

    #[error("Envelope timestamp outside allowed clock skew ({skew_secs}s)")]
    ClockSkew { skew_secs: i64 },

    #[error("Inbound message rejected by handler: {0}")]
    Rejected(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl Classify for QueueError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::NotFound(_) | Self::InstanceNotFound(_) => FederationErrorKind::NotFound,
            Self::InstanceInactive(_) | Self::NotDeadLettered(_) => FederationErrorKind::Conflict,
            Self::UnknownSource(_) | Self::BadSignature(_) | Self::ClockSkew { .. } => {
                FederationErrorKind::AuthFailure
            }
            Self::WrongTarget(_) | Self::Rejected(_) | Self::InvalidPayload(_) => {
                FederationErrorKind::Validation
            }
            Self::Unauthorized(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Audit(e) => e.kind(),
            Self::Registry(e) => e.kind(),
        }
    }
}

/// Outbox and inbox for federation messages.
#[derive(Clone)]
pub struct MessageQueue {
    db: FederationDatabase,
    locks: KeyedLocks,
    identity: Arc<SigningIdentity>,
    local_domain: String,
    policy: RetryPolicy,
    max_clock_skew_secs: i64,
    handler: Arc<dyn InboundHandler>,
}

impl MessageQueue {
    pub fn new(
        db: FederationDatabase,
        locks: KeyedLocks,
        identity: Arc<SigningIdentity>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            locks,
            identity,
            local_domain: config.instance.domain.clone(),
            policy: RetryPolicy::from(&config.delivery),
            max_clock_skew_secs: config.inbound.max_clock_skew_secs,
            handler: Arc::new(AcknowledgeOnly),
        }
    }

    /// Replace the handler inbound messages are dispatched to.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }
}
