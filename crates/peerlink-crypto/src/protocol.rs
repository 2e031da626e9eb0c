//! Handshake protocol objects.
//!
//! This module implements both sides of the four-message session handshake:
//! - `InitiatorProtocol`: sends the hello, then a signed handshake, then
//!   validates the responder's handshake
//! - `ResponderProtocol`: answers the hello, validates the initiator's
//!   handshake, then sends its own signed handshake
//!
//! ```text
//! initiator                                responder
//!   InitiatorHello      ------------------>
//!                       <------------------  ResponderHello
//!   InitiatorHandshake  ------------------>
//!                       <------------------  ResponderHandshake
//! ```
//!
//! The hellos carry X25519 ephemeral keys. HKDF-SHA256 over the shared
//! secret, salted with the hello hash, yields the two single-use handshake
//! keys; salted with the handshake hash it yields the two session keys.
//! Signatures are produced outside this module (the manager asks a crypto
//! service), so each side first exposes the bytes to sign and then takes
//! the signature back.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use prost::Message;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use peerlink_proto::v1::{
    CommonHeaderV1, InitiatorHandshakePayloadV1, InitiatorHandshakeV1, InitiatorHelloIdentityV1,
    InitiatorHelloV1, ProtocolModeV1, ProtocolStepV1, ResponderHandshakePayloadV1,
    ResponderHandshakeV1, ResponderHelloV1, SessionRoleV1,
};
use peerlink_proto::validation::Validate;

use crate::hash::public_key_hash;
use crate::session::Session;
use crate::signature::{verify_signature, SignatureSpec};
use crate::transcript;

/// Smallest max message size a peer may advertise.
pub const MIN_MESSAGE_SIZE: u32 = 256;

const INITIATOR_HANDSHAKE_KEY_INFO: &[u8] = b"peerlink_initiator_handshake_key_v1";
const RESPONDER_HANDSHAKE_KEY_INFO: &[u8] = b"peerlink_responder_handshake_key_v1";
const INITIATOR_TO_RESPONDER_KEY_INFO: &[u8] = b"peerlink_session_i2r_key_v1";
const RESPONDER_TO_INITIATOR_KEY_INFO: &[u8] = b"peerlink_session_r2i_key_v1";

// ============================================================================
// Modes, roles and steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolMode {
    AuthenticationOnly,
    AuthenticatedEncryption,
}

impl ProtocolMode {
    pub fn to_proto(self) -> ProtocolModeV1 {
        match self {
            ProtocolMode::AuthenticationOnly => ProtocolModeV1::AuthenticationOnly,
            ProtocolMode::AuthenticatedEncryption => ProtocolModeV1::AuthenticatedEncryption,
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        match ProtocolModeV1::try_from(value).ok()? {
            ProtocolModeV1::AuthenticationOnly => Some(ProtocolMode::AuthenticationOnly),
            ProtocolModeV1::AuthenticatedEncryption => Some(ProtocolMode::AuthenticatedEncryption),
            ProtocolModeV1::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn to_proto(self) -> SessionRoleV1 {
        match self {
            Role::Initiator => SessionRoleV1::Initiator,
            Role::Responder => SessionRoleV1::Responder,
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        match SessionRoleV1::try_from(value).ok()? {
            SessionRoleV1::Initiator => Some(Role::Initiator),
            SessionRoleV1::Responder => Some(Role::Responder),
            SessionRoleV1::Unspecified => None,
        }
    }
}

/// Position of a protocol object in the handshake.
///
/// Initiator: `Init -> SentHello -> ReceivedPeerHello -> SentHandshake -> SessionEstablished`.
/// Responder: `Init -> ReceivedPeerHello -> SentHello -> ReceivedPeerHandshake -> SessionEstablished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Init,
    SentHello,
    ReceivedPeerHello,
    SentHandshake,
    ReceivedPeerHandshake,
    SessionEstablished,
}

impl Step {
    pub fn to_proto(self) -> ProtocolStepV1 {
        match self {
            Step::Init => ProtocolStepV1::Init,
            Step::SentHello => ProtocolStepV1::SentHello,
            Step::ReceivedPeerHello => ProtocolStepV1::ReceivedPeerHello,
            Step::SentHandshake => ProtocolStepV1::SentHandshake,
            Step::ReceivedPeerHandshake => ProtocolStepV1::ReceivedPeerHandshake,
            Step::SessionEstablished => ProtocolStepV1::SessionEstablished,
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        Some(match ProtocolStepV1::try_from(value).ok()? {
            ProtocolStepV1::Init => Step::Init,
            ProtocolStepV1::SentHello => Step::SentHello,
            ProtocolStepV1::ReceivedPeerHello => Step::ReceivedPeerHello,
            ProtocolStepV1::SentHandshake => Step::SentHandshake,
            ProtocolStepV1::ReceivedPeerHandshake => Step::ReceivedPeerHandshake,
            ProtocolStepV1::SessionEstablished => Step::SessionEstablished,
            ProtocolStepV1::Unspecified => return None,
        })
    }
}

/// Error type for handshake operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("operation requires step {expected:?}, protocol is at {step:?}")]
    InvalidState { step: Step, expected: Step },
    #[error("message for session {got} delivered to session {expected}")]
    SessionIdMismatch { expected: String, got: String },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid ephemeral key")]
    InvalidEphemeralKey,
    #[error("no protocol mode in common")]
    NoCommonMode,
    #[error("handshake encryption failed")]
    EncryptionFailed,
    #[error("handshake decryption failed")]
    DecryptionFailed,
    #[error("public key hash does not match")]
    WrongPublicKeyHash,
    #[error("group id does not match")]
    GroupMismatch,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("peer max message size {0} is below the minimum")]
    MessageSizeTooSmall(u32),
    #[error("key derivation failed")]
    KeyDerivation,
}

/// What the initiator learns from a valid responder handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshakeData {
    pub certificate_chain: Vec<Vec<u8>>,
    pub max_message_size: u32,
}

/// What the responder learns from a valid initiator handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeIdentityData {
    pub initiator_public_key_hash: [u8; 32],
    pub responder_public_key_hash: [u8; 32],
    pub group_id: String,
    pub certificate_chain: Vec<Vec<u8>>,
    pub max_message_size: u32,
}

/// Identity hint of the initiator, taken from its hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorIdentity {
    pub public_key_hash: [u8; 32],
    pub group_id: String,
}

/// Serializable state of a protocol object.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProtocolSnapshot {
    #[zeroize(skip)]
    pub role: Role,
    #[zeroize(skip)]
    pub step: Step,
    pub session_id: String,
    #[zeroize(skip)]
    pub supported_modes: Vec<ProtocolMode>,
    pub our_max_message_size: u32,
    pub ephemeral_secret: [u8; 32],
    /// Encoded hellos and sealed initiator handshake; empty until known.
    pub initiator_hello: Vec<u8>,
    pub responder_hello: Vec<u8>,
    pub initiator_handshake: Vec<u8>,
    /// 0 until the peer's handshake is validated.
    pub peer_max_message_size: u32,
    pub our_public_key_hash: Option<[u8; 32]>,
    pub peer_public_key_hash: Option<[u8; 32]>,
    pub group_id: String,
}

impl fmt::Debug for ProtocolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolSnapshot")
            .field("role", &self.role)
            .field("step", &self.step)
            .field("session_id", &self.session_id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Shared key schedule
// ============================================================================

#[derive(Zeroize, ZeroizeOnDrop)]
struct HandshakeSecrets {
    shared_secret: [u8; 32],
    initiator_key: [u8; 32],
    responder_key: [u8; 32],
    #[zeroize(skip)]
    hello_hash: [u8; 32],
}

impl HandshakeSecrets {
    fn derive(
        ephemeral: &StaticSecret,
        peer_key: &[u8],
        initiator_hello: &InitiatorHelloV1,
        responder_hello: &ResponderHelloV1,
    ) -> Result<Self, HandshakeError> {
        let peer: [u8; 32] = peer_key.try_into().map_err(|_| HandshakeError::InvalidEphemeralKey)?;
        let shared = ephemeral.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(HandshakeError::InvalidEphemeralKey);
        }

        let hello_hash = transcript::hello_hash(
            &initiator_hello.encode_to_vec(),
            &responder_hello.encode_to_vec(),
        );
        let hk = Hkdf::<Sha256>::new(Some(&hello_hash), shared.as_bytes());
        let mut initiator_key = [0u8; 32];
        let mut responder_key = [0u8; 32];
        hk.expand(INITIATOR_HANDSHAKE_KEY_INFO, &mut initiator_key)
            .map_err(|_| HandshakeError::KeyDerivation)?;
        hk.expand(RESPONDER_HANDSHAKE_KEY_INFO, &mut responder_key)
            .map_err(|_| HandshakeError::KeyDerivation)?;

        Ok(Self {
            shared_secret: *shared.as_bytes(),
            initiator_key,
            responder_key,
            hello_hash,
        })
    }

    fn handshake_hash(&self, initiator_handshake: &[u8]) -> [u8; 32] {
        transcript::handshake_hash(&self.hello_hash, initiator_handshake)
    }

    /// Returns (initiator-to-responder, responder-to-initiator) keys.
    fn session_keys(&self, initiator_handshake: &[u8]) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
        let salt = self.handshake_hash(initiator_handshake);
        let hk = Hkdf::<Sha256>::new(Some(&salt), &self.shared_secret);
        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        hk.expand(INITIATOR_TO_RESPONDER_KEY_INFO, &mut i2r)
            .map_err(|_| HandshakeError::KeyDerivation)?;
        hk.expand(RESPONDER_TO_INITIATOR_KEY_INFO, &mut r2i)
            .map_err(|_| HandshakeError::KeyDerivation)?;
        Ok((i2r, r2i))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn header(session_id: &str, sequence_no: u64) -> CommonHeaderV1 {
    CommonHeaderV1 {
        session_id: session_id.to_string(),
        sequence_no,
        timestamp_millis: now_millis(),
    }
}

// Each handshake key seals exactly one message, so a fixed nonce is safe.
fn seal_handshake(key: &[u8; 32], header: &CommonHeaderV1, payload: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    aead.encrypt(
        Nonce::from_slice(&[0u8; 12]),
        Payload { msg: payload, aad: &header.encode_to_vec() },
    )
    .map_err(|_| HandshakeError::EncryptionFailed)
}

fn open_handshake(key: &[u8; 32], header: &CommonHeaderV1, sealed: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let aead = ChaCha20Poly1305::new(Key::from_slice(key));
    aead.decrypt(
        Nonce::from_slice(&[0u8; 12]),
        Payload { msg: sealed, aad: &header.encode_to_vec() },
    )
    .map_err(|_| HandshakeError::DecryptionFailed)
}

fn check_session_id(expected: &str, header: &Option<CommonHeaderV1>) -> Result<CommonHeaderV1, HandshakeError> {
    let header = header
        .as_ref()
        .ok_or_else(|| HandshakeError::Malformed("missing header".into()))?;
    if header.session_id != expected {
        return Err(HandshakeError::SessionIdMismatch {
            expected: expected.to_string(),
            got: header.session_id.clone(),
        });
    }
    Ok(header.clone())
}

fn validated<T: Validate>(msg: &T) -> Result<(), HandshakeError> {
    msg.validate().map_err(|e| HandshakeError::Malformed(e.to_string()))
}

fn to_hash(bytes: &[u8]) -> Result<[u8; 32], HandshakeError> {
    bytes.try_into().map_err(|_| HandshakeError::WrongPublicKeyHash)
}

fn decode<T: Message + Default>(bytes: &[u8]) -> Result<Option<T>, HandshakeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    T::decode(bytes)
        .map(Some)
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

fn encode_opt<T: Message>(msg: &Option<T>) -> Vec<u8> {
    msg.as_ref().map(Message::encode_to_vec).unwrap_or_default()
}

// ============================================================================
// Initiator
// ============================================================================

pub struct InitiatorProtocol {
    session_id: String,
    step: Step,
    supported_modes: Vec<ProtocolMode>,
    our_max_message_size: u32,
    our_public_key_hash: [u8; 32],
    group_id: String,
    ephemeral: StaticSecret,
    initiator_hello: Option<InitiatorHelloV1>,
    responder_hello: Option<ResponderHelloV1>,
    secrets: Option<HandshakeSecrets>,
    initiator_handshake: Option<Vec<u8>>,
    peer_public_key_hash: Option<[u8; 32]>,
    peer_max_message_size: Option<u32>,
}

impl fmt::Debug for InitiatorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitiatorProtocol")
            .field("session_id", &self.session_id)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl InitiatorProtocol {
    /// Create an initiator for `session_id`.
    ///
    /// # Arguments
    /// * `supported_modes` - Modes offered in the hello, from group policy
    /// * `our_max_message_size` - Largest payload we accept
    /// * `our_public_key` - Our session public key, announced by hash
    /// * `group_id` - Group both identities belong to
    pub fn new(
        session_id: impl Into<String>,
        supported_modes: Vec<ProtocolMode>,
        our_max_message_size: u32,
        our_public_key: &[u8],
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            step: Step::Init,
            supported_modes,
            our_max_message_size,
            our_public_key_hash: public_key_hash(our_public_key),
            group_id: group_id.into(),
            ephemeral: StaticSecret::random_from_rng(OsRng),
            initiator_hello: None,
            responder_hello: None,
            secrets: None,
            initiator_handshake: None,
            peer_public_key_hash: None,
            peer_max_message_size: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Mode chosen by the responder, once its hello has been received.
    pub fn selected_mode(&self) -> Option<ProtocolMode> {
        self.responder_hello
            .as_ref()
            .and_then(|h| ProtocolMode::from_proto(h.selected_mode))
    }

    fn require(&self, expected: Step) -> Result<(), HandshakeError> {
        if self.step != expected {
            return Err(HandshakeError::InvalidState { step: self.step, expected });
        }
        Ok(())
    }

    fn secrets(&self) -> Result<&HandshakeSecrets, HandshakeError> {
        self.secrets.as_ref().ok_or(HandshakeError::InvalidState {
            step: self.step,
            expected: Step::ReceivedPeerHello,
        })
    }

    pub fn generate_initiator_hello(&mut self) -> Result<InitiatorHelloV1, HandshakeError> {
        self.require(Step::Init)?;
        let hello = InitiatorHelloV1 {
            header: Some(header(&self.session_id, 0)),
            initiator_ephemeral_key: PublicKey::from(&self.ephemeral).as_bytes().to_vec(),
            supported_modes: self.supported_modes.iter().map(|m| m.to_proto() as i32).collect(),
            source: Some(InitiatorHelloIdentityV1 {
                initiator_public_key_hash: self.our_public_key_hash.to_vec(),
                group_id: self.group_id.clone(),
            }),
        };
        self.initiator_hello = Some(hello.clone());
        self.step = Step::SentHello;
        Ok(hello)
    }

    /// Accept the responder's hello and derive the handshake keys.
    pub fn receive_responder_hello(&mut self, msg: &ResponderHelloV1) -> Result<ProtocolMode, HandshakeError> {
        self.require(Step::SentHello)?;
        check_session_id(&self.session_id, &msg.header)?;
        validated(msg)?;

        let mode = ProtocolMode::from_proto(msg.selected_mode).ok_or(HandshakeError::NoCommonMode)?;
        if !self.supported_modes.contains(&mode) {
            return Err(HandshakeError::NoCommonMode);
        }
        let initiator_hello = self.initiator_hello.as_ref().ok_or(HandshakeError::InvalidState {
            step: self.step,
            expected: Step::SentHello,
        })?;
        let secrets = HandshakeSecrets::derive(
            &self.ephemeral,
            &msg.responder_ephemeral_key,
            initiator_hello,
            msg,
        )?;

        self.secrets = Some(secrets);
        self.responder_hello = Some(msg.clone());
        self.step = Step::ReceivedPeerHello;
        Ok(mode)
    }

    /// Bytes to sign with our session key before sending the handshake.
    pub fn handshake_signing_data(&self, responder_public_key: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.require(Step::ReceivedPeerHello)?;
        Ok(transcript::initiator_signing_data(
            &self.secrets()?.hello_hash,
            &self.our_public_key_hash,
            &public_key_hash(responder_public_key),
            &self.group_id,
            self.our_max_message_size,
        ))
    }

    /// Seal our identity proof for the responder.
    ///
    /// `signature` must be over [`Self::handshake_signing_data`] for the same
    /// responder key.
    pub fn generate_our_handshake_message(
        &mut self,
        responder_public_key: &[u8],
        certificate_chain: Vec<Vec<u8>>,
        signature: Vec<u8>,
    ) -> Result<InitiatorHandshakeV1, HandshakeError> {
        self.require(Step::ReceivedPeerHello)?;
        let responder_hash = public_key_hash(responder_public_key);
        let payload = InitiatorHandshakePayloadV1 {
            initiator_public_key_hash: self.our_public_key_hash.to_vec(),
            responder_public_key_hash: responder_hash.to_vec(),
            group_id: self.group_id.clone(),
            initiator_signature: signature,
            max_message_size: self.our_max_message_size,
            certificate_chain,
        };
        let header = header(&self.session_id, 1);
        let encrypted_data = seal_handshake(&self.secrets()?.initiator_key, &header, &payload.encode_to_vec())?;

        self.initiator_handshake = Some(encrypted_data.clone());
        self.peer_public_key_hash = Some(responder_hash);
        self.step = Step::SentHandshake;
        Ok(InitiatorHandshakeV1 { header: Some(header), encrypted_data })
    }

    /// Open and verify the responder's handshake.
    pub fn validate_peer_handshake_message(
        &mut self,
        msg: &ResponderHandshakeV1,
        responder_public_key: &[u8],
        spec: SignatureSpec,
    ) -> Result<PeerHandshakeData, HandshakeError> {
        self.require(Step::SentHandshake)?;
        let header = check_session_id(&self.session_id, &msg.header)?;
        validated(msg)?;

        let secrets = self.secrets()?;
        let plaintext = open_handshake(&secrets.responder_key, &header, &msg.encrypted_data)?;
        let payload = ResponderHandshakePayloadV1::decode(plaintext.as_slice())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        validated(&payload)?;

        let claimed = to_hash(&payload.responder_public_key_hash)?;
        if claimed != public_key_hash(responder_public_key) || Some(claimed) != self.peer_public_key_hash {
            return Err(HandshakeError::WrongPublicKeyHash);
        }
        if payload.max_message_size < MIN_MESSAGE_SIZE {
            return Err(HandshakeError::MessageSizeTooSmall(payload.max_message_size));
        }
        let initiator_handshake = self.initiator_handshake.as_deref().unwrap_or_default();
        let signed = transcript::responder_signing_data(
            &secrets.handshake_hash(initiator_handshake),
            &claimed,
            payload.max_message_size,
        );
        verify_signature(responder_public_key, spec, &signed, &payload.responder_signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        self.peer_max_message_size = Some(payload.max_message_size);
        self.step = Step::SessionEstablished;
        Ok(PeerHandshakeData {
            certificate_chain: payload.certificate_chain,
            max_message_size: payload.max_message_size,
        })
    }

    /// The established session; outbound traffic uses the i2r key.
    pub fn get_session(&self) -> Result<Session, HandshakeError> {
        self.require(Step::SessionEstablished)?;
        let mode = self.selected_mode().ok_or(HandshakeError::NoCommonMode)?;
        let initiator_handshake = self.initiator_handshake.as_deref().unwrap_or_default();
        let (i2r, r2i) = self.secrets()?.session_keys(initiator_handshake)?;
        let peer_max = self.peer_max_message_size.unwrap_or(self.our_max_message_size);
        Ok(Session::new(
            self.session_id.clone(),
            mode,
            i2r,
            r2i,
            self.our_max_message_size.min(peer_max),
        ))
    }

    pub fn snapshot(&self) -> ProtocolSnapshot {
        ProtocolSnapshot {
            role: Role::Initiator,
            step: self.step,
            session_id: self.session_id.clone(),
            supported_modes: self.supported_modes.clone(),
            our_max_message_size: self.our_max_message_size,
            ephemeral_secret: self.ephemeral.to_bytes(),
            initiator_hello: encode_opt(&self.initiator_hello),
            responder_hello: encode_opt(&self.responder_hello),
            initiator_handshake: self.initiator_handshake.clone().unwrap_or_default(),
            peer_max_message_size: self.peer_max_message_size.unwrap_or(0),
            our_public_key_hash: Some(self.our_public_key_hash),
            peer_public_key_hash: self.peer_public_key_hash,
            group_id: self.group_id.clone(),
        }
    }

    pub fn restore(snapshot: &ProtocolSnapshot) -> Result<Self, HandshakeError> {
        if snapshot.role != Role::Initiator {
            return Err(HandshakeError::Malformed("snapshot is not an initiator".into()));
        }
        let our_public_key_hash = snapshot
            .our_public_key_hash
            .ok_or_else(|| HandshakeError::Malformed("missing our public key hash".into()))?;
        let ephemeral = StaticSecret::from(snapshot.ephemeral_secret);
        let initiator_hello: Option<InitiatorHelloV1> = decode(&snapshot.initiator_hello)?;
        let responder_hello: Option<ResponderHelloV1> = decode(&snapshot.responder_hello)?;
        let secrets = match (&initiator_hello, &responder_hello) {
            (Some(i), Some(r)) => Some(HandshakeSecrets::derive(&ephemeral, &r.responder_ephemeral_key, i, r)?),
            _ => None,
        };

        Ok(Self {
            session_id: snapshot.session_id.clone(),
            step: snapshot.step,
            supported_modes: snapshot.supported_modes.clone(),
            our_max_message_size: snapshot.our_max_message_size,
            our_public_key_hash,
            group_id: snapshot.group_id.clone(),
            ephemeral,
            initiator_hello,
            responder_hello,
            secrets,
            initiator_handshake: (!snapshot.initiator_handshake.is_empty())
                .then(|| snapshot.initiator_handshake.clone()),
            peer_public_key_hash: snapshot.peer_public_key_hash,
            peer_max_message_size: (snapshot.peer_max_message_size != 0).then_some(snapshot.peer_max_message_size),
        })
    }
}

// ============================================================================
// Responder
// ============================================================================

pub struct ResponderProtocol {
    session_id: String,
    step: Step,
    our_max_message_size: u32,
    ephemeral: StaticSecret,
    initiator_hello: Option<InitiatorHelloV1>,
    responder_hello: Option<ResponderHelloV1>,
    secrets: Option<HandshakeSecrets>,
    initiator_handshake: Option<Vec<u8>>,
    our_public_key_hash: Option<[u8; 32]>,
    peer_public_key_hash: Option<[u8; 32]>,
    peer_max_message_size: Option<u32>,
}

impl fmt::Debug for ResponderProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponderProtocol")
            .field("session_id", &self.session_id)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl ResponderProtocol {
    pub fn new(session_id: impl Into<String>, our_max_message_size: u32) -> Self {
        Self {
            session_id: session_id.into(),
            step: Step::Init,
            our_max_message_size,
            ephemeral: StaticSecret::random_from_rng(OsRng),
            initiator_hello: None,
            responder_hello: None,
            secrets: None,
            initiator_handshake: None,
            our_public_key_hash: None,
            peer_public_key_hash: None,
            peer_max_message_size: None,
        }
    }

    /// Rebuild a responder from a legacy Step2 hand-over: the hello pair was
    /// already exchanged and `ephemeral_secret` is the secret behind the
    /// responder hello's key.
    pub fn from_step2(
        initiator_hello: &InitiatorHelloV1,
        responder_hello: &ResponderHelloV1,
        ephemeral_secret: [u8; 32],
        our_max_message_size: u32,
    ) -> Result<Self, HandshakeError> {
        validated(initiator_hello)?;
        validated(responder_hello)?;
        let session_id = initiator_hello
            .header
            .as_ref()
            .map(|h| h.session_id.clone())
            .unwrap_or_default();
        check_session_id(&session_id, &responder_hello.header)?;

        let ephemeral = StaticSecret::from(ephemeral_secret);
        if PublicKey::from(&ephemeral).as_bytes().as_slice() != responder_hello.responder_ephemeral_key.as_slice() {
            return Err(HandshakeError::InvalidEphemeralKey);
        }
        if !initiator_hello.supported_modes.contains(&responder_hello.selected_mode) {
            return Err(HandshakeError::NoCommonMode);
        }
        let secrets = HandshakeSecrets::derive(
            &ephemeral,
            &initiator_hello.initiator_ephemeral_key,
            initiator_hello,
            responder_hello,
        )?;

        Ok(Self {
            session_id,
            step: Step::SentHello,
            our_max_message_size,
            ephemeral,
            initiator_hello: Some(initiator_hello.clone()),
            responder_hello: Some(responder_hello.clone()),
            secrets: Some(secrets),
            initiator_handshake: None,
            our_public_key_hash: None,
            peer_public_key_hash: None,
            peer_max_message_size: None,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn selected_mode(&self) -> Option<ProtocolMode> {
        self.responder_hello
            .as_ref()
            .and_then(|h| ProtocolMode::from_proto(h.selected_mode))
    }

    fn require(&self, expected: Step) -> Result<(), HandshakeError> {
        if self.step != expected {
            return Err(HandshakeError::InvalidState { step: self.step, expected });
        }
        Ok(())
    }

    fn secrets(&self) -> Result<&HandshakeSecrets, HandshakeError> {
        self.secrets.as_ref().ok_or(HandshakeError::InvalidState {
            step: self.step,
            expected: Step::SentHello,
        })
    }

    pub fn receive_initiator_hello(&mut self, msg: &InitiatorHelloV1) -> Result<(), HandshakeError> {
        self.require(Step::Init)?;
        check_session_id(&self.session_id, &msg.header)?;
        validated(msg)?;
        self.initiator_hello = Some(msg.clone());
        self.step = Step::ReceivedPeerHello;
        Ok(())
    }

    /// Public key hash and group the initiator announced in its hello.
    pub fn initiator_identity(&self) -> Result<InitiatorIdentity, HandshakeError> {
        let source = self
            .initiator_hello
            .as_ref()
            .and_then(|h| h.source.as_ref())
            .ok_or(HandshakeError::InvalidState { step: self.step, expected: Step::ReceivedPeerHello })?;
        Ok(InitiatorIdentity {
            public_key_hash: to_hash(&source.initiator_public_key_hash)?,
            group_id: source.group_id.clone(),
        })
    }

    /// Answer the hello, choosing a protocol mode both sides support.
    ///
    /// `AuthenticatedEncryption` wins when both sides offer it.
    pub fn generate_responder_hello(&mut self, our_modes: &[ProtocolMode]) -> Result<ResponderHelloV1, HandshakeError> {
        self.require(Step::ReceivedPeerHello)?;
        let initiator_hello = self.initiator_hello.as_ref().ok_or(HandshakeError::InvalidState {
            step: self.step,
            expected: Step::ReceivedPeerHello,
        })?;
        let offered: Vec<ProtocolMode> = initiator_hello
            .supported_modes
            .iter()
            .filter_map(|m| ProtocolMode::from_proto(*m))
            .collect();
        let mode = [ProtocolMode::AuthenticatedEncryption, ProtocolMode::AuthenticationOnly]
            .into_iter()
            .find(|m| offered.contains(m) && our_modes.contains(m))
            .ok_or(HandshakeError::NoCommonMode)?;

        let hello = ResponderHelloV1 {
            header: Some(header(&self.session_id, 0)),
            responder_ephemeral_key: PublicKey::from(&self.ephemeral).as_bytes().to_vec(),
            selected_mode: mode.to_proto() as i32,
        };
        let secrets = HandshakeSecrets::derive(
            &self.ephemeral,
            &initiator_hello.initiator_ephemeral_key,
            initiator_hello,
            &hello,
        )?;

        self.secrets = Some(secrets);
        self.responder_hello = Some(hello.clone());
        self.step = Step::SentHello;
        Ok(hello)
    }

    /// Open and verify the initiator's handshake.
    ///
    /// `initiator_public_key` is the session key found for the hash the
    /// initiator announced in its hello.
    pub fn validate_peer_handshake_message(
        &mut self,
        msg: &InitiatorHandshakeV1,
        initiator_public_key: &[u8],
        spec: SignatureSpec,
    ) -> Result<HandshakeIdentityData, HandshakeError> {
        self.require(Step::SentHello)?;
        let header = check_session_id(&self.session_id, &msg.header)?;
        validated(msg)?;
        let identity = self.initiator_identity()?;

        let secrets = self.secrets()?;
        let plaintext = open_handshake(&secrets.initiator_key, &header, &msg.encrypted_data)?;
        let payload = InitiatorHandshakePayloadV1::decode(plaintext.as_slice())
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        validated(&payload)?;

        let initiator_hash = to_hash(&payload.initiator_public_key_hash)?;
        if initiator_hash != identity.public_key_hash || initiator_hash != public_key_hash(initiator_public_key) {
            return Err(HandshakeError::WrongPublicKeyHash);
        }
        if payload.group_id != identity.group_id {
            return Err(HandshakeError::GroupMismatch);
        }
        if payload.max_message_size < MIN_MESSAGE_SIZE {
            return Err(HandshakeError::MessageSizeTooSmall(payload.max_message_size));
        }
        let responder_hash = to_hash(&payload.responder_public_key_hash)?;
        let signed = transcript::initiator_signing_data(
            &secrets.hello_hash,
            &initiator_hash,
            &responder_hash,
            &payload.group_id,
            payload.max_message_size,
        );
        verify_signature(initiator_public_key, spec, &signed, &payload.initiator_signature)
            .map_err(|_| HandshakeError::InvalidSignature)?;

        self.initiator_handshake = Some(msg.encrypted_data.clone());
        self.our_public_key_hash = Some(responder_hash);
        self.peer_public_key_hash = Some(initiator_hash);
        self.peer_max_message_size = Some(payload.max_message_size);
        self.step = Step::ReceivedPeerHandshake;
        Ok(HandshakeIdentityData {
            initiator_public_key_hash: initiator_hash,
            responder_public_key_hash: responder_hash,
            group_id: payload.group_id,
            certificate_chain: payload.certificate_chain,
            max_message_size: payload.max_message_size,
        })
    }

    fn check_our_key(&self, our_public_key: &[u8]) -> Result<[u8; 32], HandshakeError> {
        let ours = public_key_hash(our_public_key);
        if Some(ours) != self.our_public_key_hash {
            return Err(HandshakeError::WrongPublicKeyHash);
        }
        Ok(ours)
    }

    /// Bytes to sign with our session key before sending the handshake.
    pub fn handshake_signing_data(&self, our_public_key: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.require(Step::ReceivedPeerHandshake)?;
        let ours = self.check_our_key(our_public_key)?;
        let initiator_handshake = self.initiator_handshake.as_deref().unwrap_or_default();
        Ok(transcript::responder_signing_data(
            &self.secrets()?.handshake_hash(initiator_handshake),
            &ours,
            self.our_max_message_size,
        ))
    }

    pub fn generate_our_handshake_message(
        &mut self,
        our_public_key: &[u8],
        certificate_chain: Vec<Vec<u8>>,
        signature: Vec<u8>,
    ) -> Result<ResponderHandshakeV1, HandshakeError> {
        self.require(Step::ReceivedPeerHandshake)?;
        let ours = self.check_our_key(our_public_key)?;
        let payload = ResponderHandshakePayloadV1 {
            responder_public_key_hash: ours.to_vec(),
            responder_signature: signature,
            max_message_size: self.our_max_message_size,
            certificate_chain,
        };
        let header = header(&self.session_id, 1);
        let encrypted_data = seal_handshake(&self.secrets()?.responder_key, &header, &payload.encode_to_vec())?;

        self.step = Step::SessionEstablished;
        Ok(ResponderHandshakeV1 { header: Some(header), encrypted_data })
    }

    /// The established session; outbound traffic uses the r2i key.
    pub fn get_session(&self) -> Result<Session, HandshakeError> {
        self.require(Step::SessionEstablished)?;
        let mode = self.selected_mode().ok_or(HandshakeError::NoCommonMode)?;
        let initiator_handshake = self.initiator_handshake.as_deref().unwrap_or_default();
        let (i2r, r2i) = self.secrets()?.session_keys(initiator_handshake)?;
        let peer_max = self.peer_max_message_size.unwrap_or(self.our_max_message_size);
        Ok(Session::new(
            self.session_id.clone(),
            mode,
            r2i,
            i2r,
            self.our_max_message_size.min(peer_max),
        ))
    }

    pub fn snapshot(&self) -> ProtocolSnapshot {
        let group_id = self
            .initiator_hello
            .as_ref()
            .and_then(|h| h.source.as_ref())
            .map(|s| s.group_id.clone())
            .unwrap_or_default();
        ProtocolSnapshot {
            role: Role::Responder,
            step: self.step,
            session_id: self.session_id.clone(),
            supported_modes: self.selected_mode().into_iter().collect(),
            our_max_message_size: self.our_max_message_size,
            ephemeral_secret: self.ephemeral.to_bytes(),
            initiator_hello: encode_opt(&self.initiator_hello),
            responder_hello: encode_opt(&self.responder_hello),
            initiator_handshake: self.initiator_handshake.clone().unwrap_or_default(),
            peer_max_message_size: self.peer_max_message_size.unwrap_or(0),
            our_public_key_hash: self.our_public_key_hash,
            peer_public_key_hash: self.peer_public_key_hash,
            group_id,
        }
    }

    pub fn restore(snapshot: &ProtocolSnapshot) -> Result<Self, HandshakeError> {
        if snapshot.role != Role::Responder {
            return Err(HandshakeError::Malformed("snapshot is not a responder".into()));
        }
        let ephemeral = StaticSecret::from(snapshot.ephemeral_secret);
        let initiator_hello: Option<InitiatorHelloV1> = decode(&snapshot.initiator_hello)?;
        let responder_hello: Option<ResponderHelloV1> = decode(&snapshot.responder_hello)?;
        let secrets = match (&initiator_hello, &responder_hello) {
            (Some(i), Some(r)) => Some(HandshakeSecrets::derive(&ephemeral, &i.initiator_ephemeral_key, i, r)?),
            _ => None,
        };

        Ok(Self {
            session_id: snapshot.session_id.clone(),
            step: snapshot.step,
            our_max_message_size: snapshot.our_max_message_size,
            ephemeral,
            initiator_hello,
            responder_hello,
            secrets,
            initiator_handshake: (!snapshot.initiator_handshake.is_empty())
                .then(|| snapshot.initiator_handshake.clone()),
            our_public_key_hash: snapshot.our_public_key_hash,
            peer_public_key_hash: snapshot.peer_public_key_hash,
            peer_max_message_size: (snapshot.peer_max_message_size != 0).then_some(snapshot.peer_max_message_size),
        })
    }
}
