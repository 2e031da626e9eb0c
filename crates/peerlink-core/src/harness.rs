//! Test harness for peerlink core.
//!
//! This module provides an in-memory group of nodes sharing one membership
//! directory and group policy, and helpers to drive handshakes between them
//! without a transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand_core::OsRng;

use peerlink_crypto::protocol::ProtocolMode;
use peerlink_crypto::wrapping::WrappingKey;
use peerlink_proto::v1::{LinkOutMessageV1, SessionMessageV1};

use crate::cache::RemovalCause;
use crate::clock::Clock;
use crate::config::{ConfigHandle, SessionManagerConfig};
use crate::crypto_client::{LocalCryptoOps, LocalKeyWrapper};
use crate::directory::{InMemoryGroupPolicies, InMemoryHostedIdentities, InMemoryMembershipDirectory};
use crate::messages::{AuthenticatedMessage, AuthenticatedMessageHeader};
use crate::publisher::RecordingPublisher;
use crate::revocation::StaticRevocationList;
use crate::session::{EstablishedSession, SessionEventListener, SessionManager, SessionManagerDeps};
use crate::store::InMemoryStateStore;
use crate::types::{
    HoldingIdentity, HostedIdentity, MemberInfo, MembershipStatus, NetworkType, P2pParameters, SessionId,
    SessionPkiMode,
};

/// Wall clock under test control.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_millis: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self { now_millis: AtomicU64::new(now_millis) }
    }

    pub fn set(&self, now_millis: u64) {
        self.now_millis.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_millis.load(Ordering::SeqCst)
    }
}

/// Records session lifecycle events.
#[derive(Default, Clone)]
pub struct RecordingListener {
    established: Arc<Mutex<Vec<EstablishedSession>>>,
    removed: Arc<Mutex<Vec<(SessionId, RemovalCause)>>>,
}

impl RecordingListener {
    pub fn established(&self) -> Vec<EstablishedSession> {
        self.established.lock().clone()
    }

    pub fn removed(&self) -> Vec<(SessionId, RemovalCause)> {
        self.removed.lock().clone()
    }
}

impl SessionEventListener for RecordingListener {
    fn session_established(&self, event: &EstablishedSession) {
        self.established.lock().push(event.clone());
    }

    fn session_removed(&self, session_id: &SessionId, cause: RemovalCause) {
        self.removed.lock().push((session_id.clone(), cause));
    }
}

/// Membership group shared by every node created from it.
#[derive(Clone)]
pub struct TestNetwork {
    pub group_id: String,
    pub directory: Arc<InMemoryMembershipDirectory>,
    pub policies: Arc<InMemoryGroupPolicies>,
    pub revocation: Arc<StaticRevocationList>,
    pub clock: Arc<ManualClock>,
}

impl TestNetwork {
    /// A group without session PKI offering both protocol modes.
    pub fn new(group_id: &str) -> Self {
        let network = Self {
            group_id: group_id.to_string(),
            directory: Arc::new(InMemoryMembershipDirectory::new()),
            policies: Arc::new(InMemoryGroupPolicies::new()),
            revocation: Arc::new(StaticRevocationList::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
        };
        network.set_parameters(P2pParameters {
            session_pki: SessionPkiMode::NoPki,
            trust_roots: Vec::new(),
            protocol_modes: vec![ProtocolMode::AuthenticatedEncryption, ProtocolMode::AuthenticationOnly],
            network_type: NetworkType::Standard,
        });
        network
    }

    pub fn parameters(&self) -> Option<P2pParameters> {
        use crate::directory::GroupPolicyProvider;
        self.policies
            .get_p2p_parameters(&HoldingIdentity::new("", self.group_id.as_str()))
    }

    pub fn set_parameters(&self, parameters: P2pParameters) {
        self.policies.set(self.group_id.as_str(), parameters);
    }

    pub fn update_parameters(&self, update: impl FnOnce(&mut P2pParameters)) {
        if let Some(mut parameters) = self.parameters() {
            update(&mut parameters);
            self.set_parameters(parameters);
        }
    }

    pub fn update_member(&self, identity: &HoldingIdentity, update: impl FnOnce(&mut MemberInfo)) {
        use crate::directory::MembershipDirectory;
        if let Some(mut member) = self.directory.lookup(identity) {
            update(&mut member);
            self.directory.upsert(member);
        }
    }

    pub fn node(&self, x500_name: &str) -> TestNode {
        self.node_with_config(x500_name, SessionManagerConfig::default())
    }

    /// Join a new member to the group and build its session manager.
    pub fn node_with_config(&self, x500_name: &str, config: SessionManagerConfig) -> TestNode {
        let identity = HoldingIdentity::new(x500_name, self.group_id.as_str());
        let signing_key = SigningKey::generate(&mut OsRng);
        let session_public_key = signing_key.verifying_key().to_bytes().to_vec();
        let tenant_id = hex::encode(&session_public_key[..8]);

        let hosted = Arc::new(InMemoryHostedIdentities::new());
        hosted.add(HostedIdentity {
            holding_identity: identity.clone(),
            tenant_id: tenant_id.clone(),
            session_public_key: session_public_key.clone(),
            session_certificate_chain: Vec::new(),
        });
        let crypto = Arc::new(LocalCryptoOps::new());
        crypto.add_key(tenant_id, signing_key.clone());
        self.directory.upsert(MemberInfo {
            holding_identity: identity.clone(),
            session_public_key,
            serial: 1,
            status: MembershipStatus::Active,
            is_mgm: false,
            session_certificate_chain: Vec::new(),
        });

        let parts = NodeParts {
            identity,
            signing_key,
            config: ConfigHandle::new(config),
            store: Arc::new(InMemoryStateStore::new()),
            key_wrapper: Arc::new(LocalKeyWrapper::new(WrappingKey::from_bytes(rand::random()))),
            hosted,
            crypto,
        };
        TestNode::assemble(self.clone(), parts)
    }

    /// Attach certificate `chain` to the node's session key on both sides.
    pub fn set_certificate_chain(&self, node: &TestNode, chain: Vec<Vec<u8>>) {
        use crate::directory::LocallyHostedIdentities;
        if let Some(mut ours) = node.hosted.get(&node.identity) {
            ours.session_certificate_chain = chain.clone();
            node.hosted.add(ours);
        }
        self.update_member(&node.identity, |member| member.session_certificate_chain = chain);
    }
}

/// What survives a node restart.
struct NodeParts {
    identity: HoldingIdentity,
    signing_key: SigningKey,
    config: ConfigHandle,
    store: Arc<InMemoryStateStore>,
    key_wrapper: Arc<LocalKeyWrapper>,
    hosted: Arc<InMemoryHostedIdentities>,
    crypto: Arc<LocalCryptoOps>,
}

/// One member of a [`TestNetwork`] with its own store and session manager.
pub struct TestNode {
    network: TestNetwork,
    pub identity: HoldingIdentity,
    pub signing_key: SigningKey,
    pub config: ConfigHandle,
    pub store: Arc<InMemoryStateStore>,
    pub key_wrapper: Arc<LocalKeyWrapper>,
    pub hosted: Arc<InMemoryHostedIdentities>,
    pub crypto: Arc<LocalCryptoOps>,
    pub publisher: RecordingPublisher,
    pub events: RecordingListener,
    pub manager: Arc<SessionManager>,
}

impl TestNode {
    fn assemble(network: TestNetwork, parts: NodeParts) -> Self {
        let publisher = RecordingPublisher::new();
        let events = RecordingListener::default();
        let deps = SessionManagerDeps {
            directory: network.directory.clone(),
            group_policy: network.policies.clone(),
            hosted: parts.hosted.clone(),
            crypto: parts.crypto.clone(),
            key_wrapper: parts.key_wrapper.clone(),
            revocation: network.revocation.clone(),
            store: parts.store.clone(),
            publisher: Arc::new(publisher.clone()),
            clock: network.clock.clone(),
            listener: Some(Arc::new(events.clone())),
        };
        let manager = SessionManager::new(parts.config.clone(), deps);

        Self {
            network,
            identity: parts.identity,
            signing_key: parts.signing_key,
            config: parts.config,
            store: parts.store,
            key_wrapper: parts.key_wrapper,
            hosted: parts.hosted,
            crypto: parts.crypto,
            publisher,
            events,
            manager,
        }
    }

    /// A fresh session manager over the same identity, keys and state store.
    ///
    /// Stop the current manager first.
    pub fn restart(&self) -> TestNode {
        let parts = NodeParts {
            identity: self.identity.clone(),
            signing_key: self.signing_key.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            key_wrapper: self.key_wrapper.clone(),
            hosted: self.hosted.clone(),
            crypto: self.crypto.clone(),
        };
        TestNode::assemble(self.network.clone(), parts)
    }
}

/// The session message carried by `record`.
pub fn session_message(record: &LinkOutMessageV1) -> Option<SessionMessageV1> {
    record.session_message().cloned()
}

pub fn authenticated_message(
    source: &HoldingIdentity,
    destination: &HoldingIdentity,
    message_id: &str,
    payload: &[u8],
) -> AuthenticatedMessage {
    AuthenticatedMessage {
        header: AuthenticatedMessageHeader {
            destination: destination.clone(),
            source: source.clone(),
            message_id: message_id.to_string(),
            subsystem: "test".to_string(),
        },
        payload: payload.to_vec(),
    }
}

/// Run the rest of a handshake that `initiator` started with `hello`.
///
/// Each message goes straight to the other node's session manager:
/// 1. Responder answers the initiator hello
/// 2. Initiator sends its handshake
/// 3. Responder validates it and sends its own handshake
/// 4. Initiator validates that and establishes the session
pub async fn run_handshake(
    initiator: &TestNode,
    responder: &TestNode,
    hello: &LinkOutMessageV1,
) -> anyhow::Result<EstablishedSession> {
    let hello = session_message(hello).context("hello record carries no session message")?;

    let responder_hello = responder
        .manager
        .process_session_message(&hello)
        .await
        .reply
        .context("responder did not answer the initiator hello")?;
    let initiator_handshake = initiator
        .manager
        .process_session_message(&session_message(&responder_hello).context("responder hello")?)
        .await
        .reply
        .context("initiator did not send its handshake")?;
    let inbound = responder
        .manager
        .process_session_message(&session_message(&initiator_handshake).context("initiator handshake")?)
        .await;
    let (Some(responder_handshake), Some(_)) = (inbound.reply, inbound.established) else {
        bail!("responder rejected the initiator handshake");
    };
    initiator
        .manager
        .process_session_message(&session_message(&responder_handshake).context("responder handshake")?)
        .await
        .established
        .context("initiator rejected the responder handshake")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_flow() {
        let network = TestNetwork::new("group");
        let alice = network.node("O=Alice");
        let bob = network.node("O=Bob");
        let hello = match alice
            .manager
            .process_outbound_message(authenticated_message(&alice.identity, &bob.identity, "m1", b"hi"))
            .await
            .expect("outbound message")
        {
            crate::session::OutboundSessionState::NewSessionsNeeded { messages, .. } => messages[0].1.clone(),
            other => panic!("expected a new negotiation, got {:?}", other),
        };

        let established = run_handshake(&alice, &bob, &hello)
            .await
            .expect("handshake should succeed");
        assert_eq!(established.counterparties.counterparty_id, bob.identity);
        assert_eq!(bob.events.established().len(), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_millis(), 15);
        clock.set(3);
        assert_eq!(clock.now_millis(), 3);
    }
}
