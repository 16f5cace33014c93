//! Principals, capabilities and the actor performing an operation.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Classify, FederationErrorKind};
use crate::storage::ActorKind;

/// A permission a principal can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Registry changes, trust levels, requeue and sync resume.
    #[serde(rename = "federation:admin")]
    FederationAdmin,
    /// Read access to the audit log.
    #[serde(rename = "audit:read")]
    AuditRead,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FederationAdmin => "federation:admin",
            Self::AuditRead => "audit:read",
        }
    }
}

impl FromStr for Capability {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "federation:admin" => Ok(Self::FederationAdmin),
            "audit:read" => Ok(Self::AuditRead),
            other => Err(AuthError::UnknownCapability(other.to_string())),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated human or service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    pub capabilities: BTreeSet<Capability>,
}

impl Principal {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Who is performing an operation. Recorded on every audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Background engines and startup recovery. Holds every capability.
    System,
    User(Principal),
    /// A federated peer, identified by its domain. Holds no capabilities.
    Instance(String),
}

impl Actor {
    pub const fn kind(&self) -> ActorKind {
        match self {
            Self::System => ActorKind::System,
            Self::User(_) => ActorKind::User,
            Self::Instance(_) => ActorKind::Instance,
        }
    }

    /// Identifier stored in the audit log; `None` for the system.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::System => None,
            Self::User(p) => Some(&p.id),
            Self::Instance(domain) => Some(domain),
        }
    }

    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }

    pub fn has(&self, capability: Capability) -> bool {
        match self {
            Self::System => true,
            Self::User(p) => p.has(capability),
            Self::Instance(_) => false,
        }
    }

    /// Fail with [`AuthError::MissingCapability`] unless the actor holds `capability`.
    pub fn require(&self, capability: Capability) -> Result<(), AuthError> {
        if self.has(capability) {
            Ok(())
        } else {
            Err(AuthError::MissingCapability {
                actor: self.to_string(),
                capability,
            })
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::User(p) => write!(f, "user:{}", p.username),
            Self::Instance(domain) => write!(f, "instance:{domain}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{actor} lacks capability {capability}")]
    MissingCapability {
        actor: String,
        capability: Capability,
    },

    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Token issuance failed: {0}")]
    Issue(String),
}

impl Classify for AuthError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::MissingCapability { .. } | Self::MissingToken | Self::InvalidToken(_) => {
                FederationErrorKind::Unauthorized
            }
            Self::UnknownCapability(_) => FederationErrorKind::Validation,
            Self::Issue(_) => FederationErrorKind::StorageFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_holds_every_capability() {
        assert!(Actor::System.require(Capability::FederationAdmin).is_ok());
        assert!(Actor::System.require(Capability::AuditRead).is_ok());
        assert_eq!(Actor::System.id(), None);
    }

    #[test]
    fn instance_holds_none() {
        let actor = Actor::Instance("peer.example".into());
        let err = actor.require(Capability::FederationAdmin).unwrap_err();
        assert!(matches!(err, AuthError::MissingCapability { .. }));
        assert_eq!(err.kind(), FederationErrorKind::Unauthorized);
        assert_eq!(actor.id(), Some("peer.example"));
        assert_eq!(actor.kind(), ActorKind::Instance);
    }

    #[test]
    fn user_capabilities_are_checked() {
        let auditor = Actor::User(Principal::new("u1", "alice", [Capability::AuditRead]));
        assert!(auditor.require(Capability::AuditRead).is_ok());
        assert!(auditor.require(Capability::FederationAdmin).is_err());
        assert_eq!(auditor.to_string(), "user:alice");
    }

    #[test]
    fn capability_names_roundtrip() {
        for cap in [Capability::FederationAdmin, Capability::AuditRead] {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("root".parse::<Capability>().is_err());
    }
}
