//! Sync reconciliation.
//!
//! Each (peer, resource type) pair has a cursor into the peer's change
//! feed. A reconcile run fetches signed batches after the cursor and applies
//! each one in a single transaction: replicated fields, rejections, the
//! cursor advance and their audit entries commit together or not at all.
//!
//! Per pair the run moves `idle → fetching → applying → idle`, or ends in
//! `failed`. Schema mismatches halt the pair until an operator resumes it.
//! An authentication failure flags the peer for review, and no pair with
//! that peer is fetched again until the flag is cleared.

pub mod conflict;
mod engine;
mod feed;
pub mod policy;
mod types;

pub use engine::{ApplyReport, SessionState, SyncAvailableHandler, SyncEngine, SyncOutcome, SyncSummary};
pub use feed::ChangeFeed;
pub use types::{Change, ChangeBatch, PROTOCOL_VERSION, SyncAvailable, SyncRequest};

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::error::{Classify, FederationErrorKind};
use crate::queue::QueueError;
use crate::registry::RegistryError;
use crate::storage::DatabaseError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Peer authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Change batch rejected: {0}")]
    BatchRejected(String),

    #[error("Sync of {resource_type} with instance {instance_id} is halted")]
    Halted {
        instance_id: String,
        resource_type: String,
    },

    #[error("Sync of {resource_type} with instance {instance_id} is not halted")]
    NotHalted {
        instance_id: String,
        resource_type: String,
    },

    #[error("Instance {0} is flagged for review; sync suspended")]
    UnderReview(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance is not active: {0}")]
    InstanceInactive(String),

    #[error("Corrupt replicated state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Sync storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SyncError {
    pub(crate) fn from_transport(error: TransportError) -> Self {
        match error.kind() {
            FederationErrorKind::AuthFailure => Self::AuthenticationFailed(error.to_string()),
            FederationErrorKind::ProtocolMismatch => Self::SchemaMismatch(error.to_string()),
            _ => Self::PeerUnreachable(error.to_string()),
        }
    }
}

impl Classify for SyncError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::PeerUnreachable(_) => FederationErrorKind::Transient,
            Self::AuthenticationFailed(_) => FederationErrorKind::AuthFailure,
            Self::SchemaMismatch(_) => FederationErrorKind::ProtocolMismatch,
            Self::BatchRejected(_) => FederationErrorKind::Validation,
            Self::Halted { .. }
            | Self::NotHalted { .. }
            | Self::UnderReview(_)
            | Self::InstanceInactive(_) => FederationErrorKind::Conflict,
            Self::InstanceNotFound(_) => FederationErrorKind::NotFound,
            Self::Serialize(_) => FederationErrorKind::StorageFailure,
            Self::Unauthorized(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Audit(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::Queue(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_sync_errors() {
        assert!(matches!(
            SyncError::from_transport(TransportError::Timeout(5)),
            SyncError::PeerUnreachable(_)
        ));
        assert!(matches!(
            SyncError::from_transport(TransportError::Unauthenticated("401".into())),
            SyncError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            SyncError::from_transport(TransportError::Protocol("422".into())),
            SyncError::SchemaMismatch(_)
        ));
    }
}
