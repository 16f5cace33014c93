//! Transport between instances.
//!
//! The core consumes the [`Transport`] trait only. [`HttpTransport`] posts
//! signed [`Envelope`]s to a peer's federation API over HTTPS;
//! [`ScriptedTransport`] answers from a script, for tests and dry runs.

mod envelope;
mod http;
mod scripted;

pub use envelope::{Ack, Envelope};
pub use http::HttpTransport;
pub use scripted::ScriptedTransport;

use async_trait::async_trait;

use crate::error::{Classify, FederationErrorKind};
use crate::storage::Instance;

pub const INBOX_PATH: &str = "/federation/v1/inbox";
pub const CHANGES_PATH: &str = "/federation/v1/changes";
pub const REGISTER_PATH: &str = "/federation/v1/register";

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection refused, DNS failure, 5xx and similar.
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Peer did not answer within {0}s")]
    Timeout(u64),

    /// The peer rejected our signature or credentials.
    #[error("Peer rejected authentication: {0}")]
    Unauthenticated(String),

    /// The peer answered with something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Classify for TransportError {
    fn kind(&self) -> FederationErrorKind {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) => FederationErrorKind::Transient,
            Self::Unauthenticated(_) => FederationErrorKind::AuthFailure,
            Self::Protocol(_) => FederationErrorKind::ProtocolMismatch,
        }
    }
}

/// Sends envelopes to peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an envelope to the peer's inbox and return its receipt.
    async fn send(&self, peer: &Instance, envelope: &Envelope) -> Result<Ack, TransportError>;

    /// Ask the peer for changes; the answer is a signed `sync_response` envelope.
    async fn fetch_changes(
        &self,
        peer: &Instance,
        request: &Envelope,
    ) -> Result<Envelope, TransportError>;
}
