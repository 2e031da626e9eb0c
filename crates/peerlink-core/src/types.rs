//! Shared domain types.

use std::fmt;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use peerlink_crypto::hash::{public_key_hash, sha256};
use peerlink_crypto::protocol::ProtocolMode;
use peerlink_crypto::session::Session;
use peerlink_proto::v1::{CounterpartiesV1, HoldingIdentityV1, NetworkTypeV1};

// ============================================================================
// Identities
// ============================================================================

/// A virtual node: an X.500 name inside a membership group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HoldingIdentity {
    pub x500_name: String,
    pub group_id: String,
}

impl HoldingIdentity {
    pub fn new(x500_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self { x500_name: x500_name.into(), group_id: group_id.into() }
    }

    pub fn to_proto(&self) -> HoldingIdentityV1 {
        HoldingIdentityV1 { x500_name: self.x500_name.clone(), group_id: self.group_id.clone() }
    }

    pub fn from_proto(proto: &HoldingIdentityV1) -> Self {
        Self::new(proto.x500_name.clone(), proto.group_id.clone())
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.x500_name, self.group_id)
    }
}

/// Unique, immutable identifier of one negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// 16 random bytes from the OS RNG, lowercase hex.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who talks to whom, and against which membership record of the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterpartiesKey {
    pub our_id: HoldingIdentity,
    pub counterparty_id: HoldingIdentity,
    pub serial: u64,
}

impl CounterpartiesKey {
    pub fn new(our_id: HoldingIdentity, counterparty_id: HoldingIdentity, serial: u64) -> Self {
        Self { our_id, counterparty_id, serial }
    }

    /// Key under which the outbound session state of this pair is stored.
    pub fn state_key(&self) -> String {
        let material = format!(
            "{}\n{}\n{}\n{}\n{}",
            self.our_id.x500_name,
            self.our_id.group_id,
            self.counterparty_id.x500_name,
            self.counterparty_id.group_id,
            self.serial
        );
        hex::encode(sha256(material.as_bytes()))
    }

    pub fn to_proto(&self) -> CounterpartiesV1 {
        CounterpartiesV1 {
            our_identity: Some(self.our_id.to_proto()),
            counterparty: Some(self.counterparty_id.to_proto()),
            serial: self.serial,
        }
    }

    pub fn from_proto(proto: &CounterpartiesV1) -> Option<Self> {
        Some(Self {
            our_id: HoldingIdentity::from_proto(proto.our_identity.as_ref()?),
            counterparty_id: HoldingIdentity::from_proto(proto.counterparty.as_ref()?),
            serial: proto.serial,
        })
    }
}

impl fmt::Display for CounterpartiesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} (serial {})", self.our_id, self.counterparty_id, self.serial)
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Where an established session was found.
#[derive(Debug, Clone)]
pub enum SessionDirection {
    Inbound { counterparties: CounterpartiesKey, session: Arc<Session> },
    Outbound { counterparties: CounterpartiesKey, session: Arc<Session> },
    NoSession,
}

impl SessionDirection {
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            SessionDirection::Inbound { session, .. } | SessionDirection::Outbound { session, .. } => Some(session),
            SessionDirection::NoSession => None,
        }
    }

    pub fn counterparties(&self) -> Option<&CounterpartiesKey> {
        match self {
            SessionDirection::Inbound { counterparties, .. }
            | SessionDirection::Outbound { counterparties, .. } => Some(counterparties),
            SessionDirection::NoSession => None,
        }
    }
}

// ============================================================================
// Membership
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipStatus {
    Active,
    Suspended,
    Pending,
}

/// Membership record of a group member, as published by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub holding_identity: HoldingIdentity,
    pub session_public_key: Vec<u8>,
    pub serial: u64,
    pub status: MembershipStatus,
    /// Whether the member is the group's management node.
    pub is_mgm: bool,
    pub session_certificate_chain: Vec<Vec<u8>>,
}

impl MemberInfo {
    pub fn session_key_hash(&self) -> [u8; 32] {
        public_key_hash(&self.session_public_key)
    }
}

/// Identity hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedIdentity {
    pub holding_identity: HoldingIdentity,
    pub tenant_id: String,
    pub session_public_key: Vec<u8>,
    pub session_certificate_chain: Vec<Vec<u8>>,
}

impl HostedIdentity {
    pub fn session_key_hash(&self) -> [u8; 32] {
        public_key_hash(&self.session_public_key)
    }
}

// ============================================================================
// Group policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPkiMode {
    /// Session keys are trusted through membership alone.
    NoPki,
    /// Session keys must carry a certificate chain to a trust root.
    Standard,
    StandardEv3,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Standard,
    Compatibility,
}

impl NetworkType {
    pub fn to_proto(self) -> NetworkTypeV1 {
        match self {
            NetworkType::Standard => NetworkTypeV1::Standard,
            NetworkType::Compatibility => NetworkTypeV1::Compatibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2pParameters {
    pub session_pki: SessionPkiMode,
    pub trust_roots: Vec<[u8; 32]>,
    pub protocol_modes: Vec<ProtocolMode>,
    pub network_type: NetworkType,
}
