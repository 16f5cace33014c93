//! Error classification shared by the federation components.
//!
//! Each component has its own error enum; [`Classify`] maps any of them onto
//! one [`FederationErrorKind`] so the engines can decide retry versus surface
//! and the HTTP layer can pick a status code uniformly.

use serde::Serialize;

use crate::storage::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FederationErrorKind {
    /// Network or peer availability problem. Retried with backoff.
    Transient,
    /// Peer signature or credential rejected. Not retried; peer is flagged.
    AuthFailure,
    /// Uniqueness or ordering violation.
    Conflict,
    /// Peer speaks an incompatible payload schema. Halts until resumed.
    ProtocolMismatch,
    /// Caller lacks the required capability.
    Unauthorized,
    /// The local store failed. Aborts the whole operation.
    StorageFailure,
    /// Malformed input from a local caller.
    Validation,
    NotFound,
}

impl FederationErrorKind {
    /// Whether an operation failing with this kind may succeed on retry.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Classify an error into the federation taxonomy.
pub trait Classify {
    fn kind(&self) -> FederationErrorKind;
}

impl Classify for DatabaseError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::Conflict(_) => FederationErrorKind::Conflict,
            Self::NotFound(_) => FederationErrorKind::NotFound,
            Self::Io(_) | Self::Connection(_) | Self::Migration(_) | Self::Query(_) => {
                FederationErrorKind::StorageFailure
            }
        }
    }
}
