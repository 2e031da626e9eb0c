//! Transcript hashing for the handshake.
//!
//! Every hash both sides must agree on (hello transcript, handshake
//! transcript, signed data) is built by appending tagged fields in a fixed
//! order, so the same logical data hashes the same on both ends.

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};

/// Tags for handshake transcript fields.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const INITIATOR_HELLO: u32 = 1;
    pub const RESPONDER_HELLO: u32 = 2;
    pub const HELLO_HASH: u32 = 3;
    pub const CIPHERTEXT: u32 = 4;
    pub const INITIATOR_KEY_HASH: u32 = 5;
    pub const RESPONDER_KEY_HASH: u32 = 6;
    pub const GROUP: u32 = 7;
    pub const MAX_MESSAGE_SIZE: u32 = 8;
}

/// Domain separators.
pub mod domains {
    pub const HELLO: &str = "peerlink_handshake_hello_v1";
    pub const HANDSHAKE: &str = "peerlink_handshake_v1";
    pub const INITIATOR_SIGNATURE: &str = "peerlink_initiator_signature_v1";
    pub const RESPONDER_SIGNATURE: &str = "peerlink_responder_signature_v1";
}

/// Appends (tag, len, bytes) tuples and hashes them with SHA-256.
#[derive(Clone, Debug)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    /// Create a new transcript with the given domain separator.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self { buf: BytesMut::with_capacity(256) };
        t.append_str(tags::DOMAIN, domain);
        t
    }

    /// Append raw bytes with a tag.
    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    /// Append a u64 value with a tag.
    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_u64(v);
        self
    }

    /// Append a string with a tag (encoded as UTF-8 bytes).
    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    /// Get the raw transcript bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finalize the transcript by computing SHA-256 hash of its contents.
    pub fn finalize(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.buf);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }
}

/// Hash over both hellos, the salt for the handshake keys.
pub fn hello_hash(initiator_hello: &[u8], responder_hello: &[u8]) -> [u8; 32] {
    Transcript::new(domains::HELLO)
        .append_bytes(tags::INITIATOR_HELLO, initiator_hello)
        .append_bytes(tags::RESPONDER_HELLO, responder_hello)
        .finalize()
}

/// Hash over the hello hash and the sealed initiator handshake, the salt for
/// the session keys.
pub fn handshake_hash(hello_hash: &[u8; 32], initiator_handshake: &[u8]) -> [u8; 32] {
    Transcript::new(domains::HANDSHAKE)
        .append_bytes(tags::HELLO_HASH, hello_hash)
        .append_bytes(tags::CIPHERTEXT, initiator_handshake)
        .finalize()
}

/// Bytes the initiator signs with its session key.
pub fn initiator_signing_data(
    hello_hash: &[u8; 32],
    initiator_key_hash: &[u8],
    responder_key_hash: &[u8],
    group_id: &str,
    max_message_size: u32,
) -> Vec<u8> {
    Transcript::new(domains::INITIATOR_SIGNATURE)
        .append_bytes(tags::HELLO_HASH, hello_hash)
        .append_bytes(tags::INITIATOR_KEY_HASH, initiator_key_hash)
        .append_bytes(tags::RESPONDER_KEY_HASH, responder_key_hash)
        .append_str(tags::GROUP, group_id)
        .append_u64(tags::MAX_MESSAGE_SIZE, u64::from(max_message_size))
        .finalize()
        .to_vec()
}

/// Bytes the responder signs with its session key.
pub fn responder_signing_data(
    handshake_hash: &[u8; 32],
    responder_key_hash: &[u8],
    max_message_size: u32,
) -> Vec<u8> {
    Transcript::new(domains::RESPONDER_SIGNATURE)
        .append_bytes(tags::HELLO_HASH, handshake_hash)
        .append_bytes(tags::RESPONDER_KEY_HASH, responder_key_hash)
        .append_u64(tags::MAX_MESSAGE_SIZE, u64::from(max_message_size))
        .finalize()
        .to_vec()
}
