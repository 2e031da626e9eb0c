//! Version 1 of the peerlink messages.
//!
//! Three groups of messages live here:
//! - handshake messages exchanged while a session is negotiated
//! - data records carried over an established session
//! - the persisted session-state blob written to the state store

// ============================================================================
// Enumerations
// ============================================================================

/// Protection applied to data records of an established session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolModeV1 {
    Unspecified = 0,
    /// Payloads travel in clear text with an HMAC tag.
    AuthenticationOnly = 1,
    /// Payloads are encrypted with an AEAD cipher.
    AuthenticatedEncryption = 2,
}

/// Network flavour of the group a message is routed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum NetworkTypeV1 {
    Unspecified = 0,
    Standard = 1,
    Compatibility = 2,
}

/// Role a node plays in a negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SessionRoleV1 {
    Unspecified = 0,
    Initiator = 1,
    Responder = 2,
}

/// Last handshake message a node sent for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SessionStatusV1 {
    Unspecified = 0,
    SentInitiatorHello = 1,
    SentResponderHello = 2,
    SentInitiatorHandshake = 3,
    SentResponderHandshake = 4,
    SessionReady = 5,
}

/// Position of a protocol object inside its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolStepV1 {
    Unspecified = 0,
    Init = 1,
    SentHello = 2,
    ReceivedPeerHello = 3,
    SentHandshake = 4,
    ReceivedPeerHandshake = 5,
    SessionEstablished = 6,
}

// ============================================================================
// Common
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommonHeaderV1 {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(uint64, tag = "2")]
    pub sequence_no: u64,
    #[prost(uint64, tag = "3")]
    pub timestamp_millis: u64,
}

#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct HoldingIdentityV1 {
    #[prost(string, tag = "1")]
    pub x500_name: String,
    #[prost(string, tag = "2")]
    pub group_id: String,
}

// ============================================================================
// Handshake messages
// ============================================================================

/// Identity hint sent in the clear with the initiator hello.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiatorHelloIdentityV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub initiator_public_key_hash: Vec<u8>,
    #[prost(string, tag = "2")]
    pub group_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiatorHelloV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    #[prost(bytes = "vec", tag = "2")]
    pub initiator_ephemeral_key: Vec<u8>,
    #[prost(enumeration = "ProtocolModeV1", repeated, tag = "3")]
    pub supported_modes: Vec<i32>,
    #[prost(message, optional, tag = "4")]
    pub source: Option<InitiatorHelloIdentityV1>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponderHelloV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    #[prost(bytes = "vec", tag = "2")]
    pub responder_ephemeral_key: Vec<u8>,
    #[prost(enumeration = "ProtocolModeV1", tag = "3")]
    pub selected_mode: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiatorHandshakeV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    /// AEAD-sealed `InitiatorHandshakePayloadV1`.
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponderHandshakeV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    /// AEAD-sealed `ResponderHandshakePayloadV1`.
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitiatorHandshakePayloadV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub initiator_public_key_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub responder_public_key_hash: Vec<u8>,
    #[prost(string, tag = "3")]
    pub group_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub initiator_signature: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub max_message_size: u32,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub certificate_chain: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponderHandshakePayloadV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub responder_public_key_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub responder_signature: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub max_message_size: u32,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub certificate_chain: Vec<Vec<u8>>,
}

/// Legacy combined message: a hello pair plus the responder's wrapped
/// ephemeral secret, handed over by a component that answered the hello on
/// this node's behalf.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Step2V1 {
    #[prost(message, optional, tag = "1")]
    pub initiator_hello: Option<InitiatorHelloV1>,
    #[prost(message, optional, tag = "2")]
    pub responder_hello: Option<ResponderHelloV1>,
    #[prost(bytes = "vec", tag = "3")]
    pub wrapped_responder_ephemeral_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionMessageV1 {
    #[prost(oneof = "session_message_v1::Payload", tags = "1, 2, 3, 4, 5")]
    pub payload: Option<session_message_v1::Payload>,
}

pub mod session_message_v1 {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        InitiatorHello(super::InitiatorHelloV1),
        #[prost(message, tag = "2")]
        ResponderHello(super::ResponderHelloV1),
        #[prost(message, tag = "3")]
        InitiatorHandshake(super::InitiatorHandshakeV1),
        #[prost(message, tag = "4")]
        ResponderHandshake(super::ResponderHandshakeV1),
        #[prost(message, tag = "5")]
        Step2(super::Step2V1),
    }
}

// ============================================================================
// Application and data messages
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticatedMessageHeaderV1 {
    #[prost(message, optional, tag = "1")]
    pub destination: Option<HoldingIdentityV1>,
    #[prost(message, optional, tag = "2")]
    pub source: Option<HoldingIdentityV1>,
    #[prost(string, tag = "3")]
    pub message_id: String,
    #[prost(string, tag = "4")]
    pub subsystem: String,
}

/// Application message carried inside a data record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticatedMessageV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<AuthenticatedMessageHeaderV1>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticatedDataMessageV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub auth_tag: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AuthenticatedEncryptedDataMessageV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<CommonHeaderV1>,
    /// nonce(12) || ciphertext+tag
    #[prost(bytes = "vec", tag = "2")]
    pub encrypted_payload: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkOutHeaderV1 {
    #[prost(message, optional, tag = "1")]
    pub destination: Option<HoldingIdentityV1>,
    #[prost(message, optional, tag = "2")]
    pub source: Option<HoldingIdentityV1>,
    #[prost(enumeration = "NetworkTypeV1", tag = "3")]
    pub network_type: i32,
}

/// Record handed to the outbound link for delivery.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LinkOutMessageV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<LinkOutHeaderV1>,
    #[prost(oneof = "link_out_message_v1::Payload", tags = "2, 3, 4")]
    pub payload: Option<link_out_message_v1::Payload>,
}

pub mod link_out_message_v1 {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        SessionMessage(super::SessionMessageV1),
        #[prost(message, tag = "3")]
        AuthenticatedData(super::AuthenticatedDataMessageV1),
        #[prost(message, tag = "4")]
        AuthenticatedEncryptedData(super::AuthenticatedEncryptedDataMessageV1),
    }
}

// ============================================================================
// Persisted session state
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CounterpartiesV1 {
    #[prost(message, optional, tag = "1")]
    pub our_identity: Option<HoldingIdentityV1>,
    #[prost(message, optional, tag = "2")]
    pub counterparty: Option<HoldingIdentityV1>,
    #[prost(uint64, tag = "3")]
    pub serial: u64,
}

/// Snapshot of an in-flight handshake protocol object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolStateV1 {
    #[prost(enumeration = "SessionRoleV1", tag = "1")]
    pub role: i32,
    #[prost(enumeration = "ProtocolStepV1", tag = "2")]
    pub step: i32,
    #[prost(string, tag = "3")]
    pub session_id: String,
    #[prost(uint32, tag = "4")]
    pub our_max_message_size: u32,
    #[prost(enumeration = "ProtocolModeV1", repeated, tag = "5")]
    pub supported_modes: Vec<i32>,
    /// Ephemeral X25519 secret, wrapped by the key wrapper.
    #[prost(bytes = "vec", tag = "6")]
    pub wrapped_ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub initiator_hello: Vec<u8>,
    #[prost(bytes = "vec", tag = "8")]
    pub responder_hello: Vec<u8>,
    #[prost(bytes = "vec", tag = "9")]
    pub initiator_handshake: Vec<u8>,
    #[prost(uint32, tag = "10")]
    pub peer_max_message_size: u32,
    #[prost(bytes = "vec", tag = "11")]
    pub our_public_key_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "12")]
    pub peer_public_key_hash: Vec<u8>,
    #[prost(string, tag = "13")]
    pub group_id: String,
}

/// Symmetric keys of an established session, each wrapped by the key wrapper.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionKeysV1 {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(enumeration = "ProtocolModeV1", tag = "2")]
    pub mode: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub wrapped_outbound_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub wrapped_inbound_key: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub max_message_size: u32,
}

/// Value stored under a session's state key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionStateBlobV1 {
    #[prost(enumeration = "SessionRoleV1", tag = "1")]
    pub role: i32,
    #[prost(enumeration = "SessionStatusV1", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub session_id: String,
    #[prost(message, optional, tag = "4")]
    pub counterparties: Option<CounterpartiesV1>,
    #[prost(message, optional, tag = "5")]
    pub protocol_state: Option<ProtocolStateV1>,
    #[prost(message, optional, tag = "6")]
    pub session_keys: Option<SessionKeysV1>,
    /// Last handshake message sent, replayed when a negotiation is resumed.
    #[prost(message, optional, tag = "7")]
    pub last_message: Option<LinkOutMessageV1>,
}
