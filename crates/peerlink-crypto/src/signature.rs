//! Session-key signature verification.
//!
//! Signing always happens outside this crate (the key material lives behind
//! a crypto service); only verification is done locally.

use ed25519_dalek::{Signature, VerifyingKey};

/// Error type for signature operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Signature scheme used with a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureSpec {
    Ed25519,
}

impl SignatureSpec {
    pub fn name(&self) -> &'static str {
        match self {
            SignatureSpec::Ed25519 => "Ed25519",
        }
    }

    /// Scheme for a session public key, chosen from its encoding.
    pub fn for_public_key(public_key: &[u8]) -> Option<Self> {
        (public_key.len() == 32).then_some(SignatureSpec::Ed25519)
    }
}

/// Verify `signature` over `data` with `public_key` under `spec`.
pub fn verify_signature(
    public_key: &[u8],
    spec: SignatureSpec,
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    match spec {
        SignatureSpec::Ed25519 => {
            let key_bytes: &[u8; 32] = public_key
                .try_into()
                .map_err(|_| SignatureError::InvalidPublicKey)?;
            let verifying_key =
                VerifyingKey::from_bytes(key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
            let sig_bytes: &[u8; 64] = signature
                .try_into()
                .map_err(|_| SignatureError::InvalidSignature)?;
            verifying_key
                .verify_strict(data, &Signature::from_bytes(sig_bytes))
                .map_err(|_| SignatureError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_verify_round_trip() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let sig = key.sign(b"data").to_bytes();
        let public = key.verifying_key().to_bytes();

        assert!(verify_signature(&public, SignatureSpec::Ed25519, b"data", &sig).is_ok());
        assert_eq!(
            verify_signature(&public, SignatureSpec::Ed25519, b"other", &sig),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_inputs() {
        assert_eq!(
            verify_signature(&[0u8; 31], SignatureSpec::Ed25519, b"d", &[0u8; 64]),
            Err(SignatureError::InvalidPublicKey)
        );
        let public = SigningKey::from_bytes(&[1u8; 32]).verifying_key().to_bytes();
        assert_eq!(
            verify_signature(&public, SignatureSpec::Ed25519, b"d", &[0u8; 10]),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_spec_for_public_key() {
        assert_eq!(SignatureSpec::for_public_key(&[0u8; 32]), Some(SignatureSpec::Ed25519));
        assert_eq!(SignatureSpec::for_public_key(&[0u8; 65]), None);
        assert_eq!(SignatureSpec::Ed25519.name(), "Ed25519");
    }
}
