//! Established sessions.
//!
//! A `Session` holds one key per direction. Depending on the negotiated
//! protocol mode, data records are either MAC-tagged with HMAC-SHA256 or
//! sealed with ChaCha20Poly1305 under a random nonce.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::ProtocolMode;

type HmacSha256 = Hmac<Sha256>;

/// Error type for session data operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid blob: too short")]
    InvalidBlob,
    #[error("message authentication failed")]
    InvalidMac,
    #[error("RNG failed")]
    RngError,
    #[error("operation not available in mode {0:?}")]
    WrongMode(ProtocolMode),
}

/// Raw key material of a session, used for persistence.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    #[zeroize(skip)]
    pub session_id: String,
    #[zeroize(skip)]
    pub mode: ProtocolMode,
    pub outbound_key: [u8; 32],
    pub inbound_key: [u8; 32],
    #[zeroize(skip)]
    pub max_message_size: u32,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Session {
    #[zeroize(skip)]
    session_id: String,
    #[zeroize(skip)]
    mode: ProtocolMode,
    outbound_key: [u8; 32],
    inbound_key: [u8; 32],
    #[zeroize(skip)]
    max_message_size: u32,
    #[zeroize(skip)]
    sequence_no: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("mode", &self.mode)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        session_id: String,
        mode: ProtocolMode,
        outbound_key: [u8; 32],
        inbound_key: [u8; 32],
        max_message_size: u32,
    ) -> Self {
        Self {
            session_id,
            mode,
            outbound_key,
            inbound_key,
            max_message_size,
            sequence_no: AtomicU64::new(0),
        }
    }

    pub fn from_keys(keys: &SessionKeys) -> Self {
        Self::new(
            keys.session_id.clone(),
            keys.mode,
            keys.outbound_key,
            keys.inbound_key,
            keys.max_message_size,
        )
    }

    pub fn keys(&self) -> SessionKeys {
        SessionKeys {
            session_id: self.session_id.clone(),
            mode: self.mode,
            outbound_key: self.outbound_key,
            inbound_key: self.inbound_key,
            max_message_size: self.max_message_size,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// Largest payload either side accepts on this session.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Sequence number for the next outbound record.
    pub fn next_sequence_no(&self) -> u64 {
        self.sequence_no.fetch_add(1, Ordering::Relaxed)
    }

    /// HMAC over `header || payload` with the outbound key.
    pub fn create_mac(&self, header: &[u8], payload: &[u8]) -> Result<[u8; 32], SessionError> {
        if self.mode != ProtocolMode::AuthenticationOnly {
            return Err(SessionError::WrongMode(self.mode));
        }
        mac(&self.outbound_key, header, payload)
    }

    /// Check a peer's tag with the inbound key.
    pub fn validate_mac(&self, header: &[u8], payload: &[u8], tag: &[u8]) -> Result<(), SessionError> {
        if self.mode != ProtocolMode::AuthenticationOnly {
            return Err(SessionError::WrongMode(self.mode));
        }
        let expected = mac(&self.inbound_key, header, payload)?;
        if constant_time_eq::constant_time_eq(&expected, tag) {
            Ok(())
        } else {
            Err(SessionError::InvalidMac)
        }
    }

    /// Seal with the outbound key.
    ///
    /// Returns: nonce(12) || ciphertext+tag
    pub fn encrypt(&self, header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.mode != ProtocolMode::AuthenticatedEncryption {
            return Err(SessionError::WrongMode(self.mode));
        }
        let mut nonce12 = [0u8; 12];
        getrandom::getrandom(&mut nonce12).map_err(|_| SessionError::RngError)?;

        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.outbound_key));
        let ct = aead
            .encrypt(Nonce::from_slice(&nonce12), Payload { msg: plaintext, aad: header })
            .map_err(|_| SessionError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(12 + ct.len());
        out.extend_from_slice(&nonce12);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Open a peer's sealed record with the inbound key.
    pub fn decrypt(&self, header: &[u8], blob: &[u8]) -> Result<Vec<u8>, SessionError> {
        if self.mode != ProtocolMode::AuthenticatedEncryption {
            return Err(SessionError::WrongMode(self.mode));
        }
        if blob.len() < 12 {
            return Err(SessionError::InvalidBlob);
        }
        let (nonce, ct) = blob.split_at(12);
        let aead = ChaCha20Poly1305::new(Key::from_slice(&self.inbound_key));
        aead.decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: header })
            .map_err(|_| SessionError::DecryptionFailed)
    }
}

fn mac(key: &[u8; 32], header: &[u8], payload: &[u8]) -> Result<[u8; 32], SessionError> {
    let mut m = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| SessionError::InvalidMac)?;
    m.update(&(header.len() as u32).to_be_bytes());
    m.update(header);
    m.update(payload);
    Ok(m.finalize().into_bytes().into())
}
