//! Open Learn Grid Federation Crypto Library
//!
//! Provides the signing primitives instances use to authenticate each other.
//!
//! ## Crypto primitives
//!
//! - **Identity**: Ed25519 keypair per instance, seed persisted with 0600 permissions
//! - **Signatures**: Ed25519 over canonical envelope bytes, base64 on the wire
//! - **Fingerprints**: SHA-256 of the public key, colon-separated hex

pub mod error;
pub mod identity;
pub mod verify;

pub use error::CryptoError;
pub use identity::{SigningIdentity, fingerprint_of};
pub use verify::{decode_public_key, verify_signature};
