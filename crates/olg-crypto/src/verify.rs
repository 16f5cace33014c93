//! Signature verification against registered peer keys.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::CryptoError;

/// Decode and validate a base64 Ed25519 public key.
pub fn decode_public_key(public_key_b64: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = BASE64
        .decode(public_key_b64.trim())
        .map_err(|e| CryptoError::InvalidPublicKey(format!("invalid base64: {e}")))?;

    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;

    VerifyingKey::from_bytes(&array).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Verify a base64 signature over `message` with a base64 public key.
pub fn verify_signature(
    public_key_b64: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), CryptoError> {
    let verifying_key = decode_public_key(public_key_b64)?;

    let sig_bytes = BASE64
        .decode(signature_b64.trim())
        .map_err(|e| CryptoError::InvalidSignature(format!("invalid base64: {e}")))?;
    let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidSignature(format!(
            "signature must be 64 bytes, got {}",
            sig_bytes.len()
        ))
    })?;

    let signature = Signature::from_bytes(&sig_array);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::SigningIdentity;

    #[test]
    fn tampered_message_fails() {
        let identity = SigningIdentity::generate();
        let sig = identity.sign(b"original");
        let err = verify_signature(&identity.public_key_base64(), b"tampered", &sig).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = SigningIdentity::generate();
        let other = SigningIdentity::generate();
        let sig = signer.sign(b"payload");
        assert!(verify_signature(&other.public_key_base64(), b"payload", &sig).is_err());
    }

    #[test]
    fn short_public_key_is_rejected() {
        let short = BASE64.encode([1u8; 16]);
        let err = decode_public_key(&short).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            }
        ));
    }

    #[test]
    fn garbage_signature_is_format_error() {
        let identity = SigningIdentity::generate();
        let err =
            verify_signature(&identity.public_key_base64(), b"payload", "not base64!").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidSignature(_)));
    }
}
