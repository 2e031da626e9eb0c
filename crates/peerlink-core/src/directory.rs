//! Membership, group policy and hosted identity lookups.
//!
//! These are read-only views the session manager consults while routing a
//! message or validating a handshake. Lookups are synchronous: implementations
//! serve them from a local, already-synchronised copy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{HoldingIdentity, HostedIdentity, MemberInfo, P2pParameters};

/// Membership records of every group this node participates in.
pub trait MembershipDirectory: Send + Sync {
    fn lookup(&self, member: &HoldingIdentity) -> Option<MemberInfo>;

    /// Find the member of `group_id` owning the session key with this hash.
    fn lookup_by_public_key_hash(&self, group_id: &str, key_hash: &[u8; 32]) -> Option<MemberInfo>;
}

pub trait GroupPolicyProvider: Send + Sync {
    /// P2P parameters of the group policy seen by `identity`.
    fn get_p2p_parameters(&self, identity: &HoldingIdentity) -> Option<P2pParameters>;
}

/// Identities hosted on this node.
pub trait LocallyHostedIdentities: Send + Sync {
    fn get(&self, identity: &HoldingIdentity) -> Option<HostedIdentity>;

    fn find_by_session_key_hash(&self, group_id: &str, key_hash: &[u8; 32]) -> Option<HostedIdentity>;

    /// Any hosted identity of `group_id`, used before the peer has named
    /// which of our identities it wants.
    fn any_in_group(&self, group_id: &str) -> Option<HostedIdentity>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

#[derive(Default, Clone)]
pub struct InMemoryMembershipDirectory {
    members: Arc<RwLock<HashMap<HoldingIdentity, MemberInfo>>>,
}

impl InMemoryMembershipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a member record.
    pub fn upsert(&self, member: MemberInfo) {
        self.members.write().insert(member.holding_identity.clone(), member);
    }

    pub fn remove(&self, member: &HoldingIdentity) -> Option<MemberInfo> {
        self.members.write().remove(member)
    }
}

impl MembershipDirectory for InMemoryMembershipDirectory {
    fn lookup(&self, member: &HoldingIdentity) -> Option<MemberInfo> {
        self.members.read().get(member).cloned()
    }

    fn lookup_by_public_key_hash(&self, group_id: &str, key_hash: &[u8; 32]) -> Option<MemberInfo> {
        self.members
            .read()
            .values()
            .find(|m| m.holding_identity.group_id == group_id && &m.session_key_hash() == key_hash)
            .cloned()
    }
}

#[derive(Default, Clone)]
pub struct InMemoryGroupPolicies {
    policies: Arc<RwLock<HashMap<String, P2pParameters>>>,
}

impl InMemoryGroupPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the policy every member of `group_id` sees.
    pub fn set(&self, group_id: impl Into<String>, parameters: P2pParameters) {
        self.policies.write().insert(group_id.into(), parameters);
    }
}

impl GroupPolicyProvider for InMemoryGroupPolicies {
    fn get_p2p_parameters(&self, identity: &HoldingIdentity) -> Option<P2pParameters> {
        self.policies.read().get(&identity.group_id).cloned()
    }
}

#[derive(Default, Clone)]
pub struct InMemoryHostedIdentities {
    identities: Arc<RwLock<Vec<HostedIdentity>>>,
}

impl InMemoryHostedIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, identity: HostedIdentity) {
        let mut identities = self.identities.write();
        identities.retain(|i| i.holding_identity != identity.holding_identity);
        identities.push(identity);
    }
}

impl LocallyHostedIdentities for InMemoryHostedIdentities {
    fn get(&self, identity: &HoldingIdentity) -> Option<HostedIdentity> {
        self.identities
            .read()
            .iter()
            .find(|i| &i.holding_identity == identity)
            .cloned()
    }

    fn find_by_session_key_hash(&self, group_id: &str, key_hash: &[u8; 32]) -> Option<HostedIdentity> {
        self.identities
            .read()
            .iter()
            .find(|i| i.holding_identity.group_id == group_id && &i.session_key_hash() == key_hash)
            .cloned()
    }

    fn any_in_group(&self, group_id: &str) -> Option<HostedIdentity> {
        self.identities
            .read()
            .iter()
            .find(|i| i.holding_identity.group_id == group_id)
            .cloned()
    }
}
