//! Signed message envelope exchanged between instances.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use olg_core::db::unix_timestamp;
use olg_crypto::{CryptoError, SigningIdentity};

use crate::storage::MessageType;

/// Wire form of every federation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique message id assigned by the sender.
    pub id: String,
    pub source_domain: String,
    pub target_domain: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
    /// Base64 Ed25519 signature over [`Envelope::canonical_bytes`].
    #[serde(default)]
    pub signature: String,
    /// Unix seconds at signing time.
    pub timestamp: i64,
}

impl Envelope {
    /// An unsigned envelope stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        source_domain: impl Into<String>,
        target_domain: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            source_domain: source_domain.into(),
            target_domain: target_domain.into(),
            message_type,
            payload,
            signature: String::new(),
            timestamp: unix_timestamp(),
        }
    }

    /// Hex SHA-256 of the compact JSON payload.
    pub fn payload_digest(&self) -> String {
        hex::encode(Sha256::digest(self.payload.to_string().as_bytes()))
    }

    /// Bytes covered by the signature:
    /// `id:source:target:type:timestamp:sha256(payload)`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.id,
            self.source_domain,
            self.target_domain,
            self.message_type.as_str(),
            self.timestamp,
            self.payload_digest()
        )
        .into_bytes()
    }

    /// Sign in place with the local identity.
    pub fn sign(&mut self, identity: &SigningIdentity) {
        self.signature = identity.sign(&self.canonical_bytes());
    }

    #[must_use]
    pub fn signed(mut self, identity: &SigningIdentity) -> Self {
        self.sign(identity);
        self
    }

    /// Verify the signature against a peer's registered public key.
    pub fn verify(&self, public_key_b64: &str) -> Result<(), CryptoError> {
        olg_crypto::verify_signature(public_key_b64, &self.canonical_bytes(), &self.signature)
    }

    /// Absolute difference between the envelope timestamp and `now`.
    pub const fn skew_from(&self, now: i64) -> i64 {
        (now - self.timestamp).abs()
    }
}

/// Receipt returned for an accepted inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub message_id: String,
    /// Domain of the acknowledging instance.
    pub receiver: String,
    pub received_at: i64,
    /// Handler response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}
