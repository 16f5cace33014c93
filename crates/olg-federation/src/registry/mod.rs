//! Instance registry: durable record of known federated peers.
//!
//! Domains are unique among active instances only. Instances are never
//! deleted; deactivation is a soft delete that dead-letters the peer's
//! outstanding outbound messages in the same transaction.

mod instances;
mod validate;

pub use instances::{
    InstanceRegistry, RegisterRequest, RemoteRegistration, flag_in, instance_snapshot,
};
pub use validate::{normalize_domain, normalize_endpoint};

use olg_crypto::CryptoError;

use crate::audit::AuditError;
use crate::auth::AuthError;
use crate::error::{Classify, FederationErrorKind};
use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Instance already registered and active: {0}")]
    DuplicateInstance(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance is already inactive: {0}")]
    AlreadyInactive(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(#[source] CryptoError),

    #[error("Registration signature rejected: {0}")]
    BadRegistrationSignature(String),

    #[error("Registration timestamp outside allowed clock skew ({skew_secs}s)")]
    ClockSkew { skew_secs: i64 },

    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error("Registry storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl Classify for RegistryError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::DuplicateInstance(_) | Self::AlreadyInactive(_) => FederationErrorKind::Conflict,
            Self::NotFound(_) => FederationErrorKind::NotFound,
            Self::InvalidDomain(_) | Self::InvalidEndpoint(_) | Self::InvalidPublicKey(_) => {
                FederationErrorKind::Validation
            }
            Self::BadRegistrationSignature(_) | Self::ClockSkew { .. } => {
                FederationErrorKind::AuthFailure
            }
            Self::Unauthorized(e) => e.kind(),
            Self::Storage(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}
