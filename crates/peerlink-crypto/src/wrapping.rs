//! Key wrapping for persisted secrets.
//!
//! Secrets written to the state store (session keys, ephemeral handshake
//! keys) are sealed under a wrapping key first.
//!
//! Format: nonce(12) || ciphertext+tag

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

const WRAP_AAD: &[u8] = b"peerlink_wrap_v1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WrapError {
    #[error("wrapping failed")]
    WrapFailed,
    #[error("unwrapping failed")]
    UnwrapFailed,
    #[error("RNG failed")]
    RngError,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct WrappingKey {
    key: [u8; 32],
}

impl WrappingKey {
    pub fn generate() -> Result<Self, WrapError> {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).map_err(|_| WrapError::RngError)?;
        Ok(Self { key })
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>, WrapError> {
        let mut nonce12 = [0u8; 12];
        getrandom::getrandom(&mut nonce12).map_err(|_| WrapError::RngError)?;
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ct = aead
            .encrypt(Nonce::from_slice(&nonce12), Payload { msg: secret, aad: WRAP_AAD })
            .map_err(|_| WrapError::WrapFailed)?;
        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce12);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, WrapError> {
        if wrapped.len() < 12 {
            return Err(WrapError::UnwrapFailed);
        }
        let (nonce, ct) = wrapped.split_at(12);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        aead.decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: WRAP_AAD })
            .map_err(|_| WrapError::UnwrapFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap() {
        let key = WrappingKey::generate().unwrap();
        let wrapped = key.wrap(&[42u8; 32]).unwrap();
        assert_ne!(&wrapped[12..], &[42u8; 32][..]);
        assert_eq!(key.unwrap(&wrapped).unwrap(), vec![42u8; 32]);
    }

    #[test]
    fn test_unwrap_with_other_key_fails() {
        let wrapped = WrappingKey::from_bytes([1u8; 32]).wrap(b"secret").unwrap();
        assert_eq!(
            WrappingKey::from_bytes([2u8; 32]).unwrap(&wrapped),
            Err(WrapError::UnwrapFailed)
        );
        assert_eq!(WrappingKey::from_bytes([1u8; 32]).unwrap(&[0u8; 4]), Err(WrapError::UnwrapFailed));
    }
}
