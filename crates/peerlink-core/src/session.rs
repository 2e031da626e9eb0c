//! Session manager.
//!
//! This module drives the four-message handshake for both roles and owns the
//! bookkeeping around it:
//! - Outbound application messages are sent on an active session from the
//!   [`OutboundSessionPool`], or queued while new negotiations are started
//! - Handshake messages advance the matching protocol object; the peer is
//!   resolved through the membership directory, its certificate is checked
//!   against group policy and our signatures come from the crypto service
//! - Established sessions go to the pool and the [`SessionCache`], and
//!   queued messages for the pair are released
//! - Every handshake step is persisted, keyed by session id, and handed to
//!   the expiry scheduler
//!
//! Failures are local to the message being processed: it is discarded with
//! a warning and counted in [`SessionManagerStats`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use peerlink_crypto::protocol::{InitiatorProtocol, ResponderProtocol, Role};
use peerlink_crypto::session::Session;
use peerlink_crypto::signature::SignatureSpec;
use peerlink_proto::v1::{
    session_message_v1, CommonHeaderV1, InitiatorHandshakeV1, InitiatorHelloV1, LinkOutMessageV1,
    ResponderHandshakeV1, ResponderHelloV1, SessionMessageV1, Step2V1,
};
use peerlink_proto::validation::Validate;

use crate::cache::{RemovalCause, SessionCache, SessionRemovalListener};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::crypto_client::{CryptoOpsClient, KeyWrapper};
use crate::dead_session::DeadSessionMonitor;
use crate::directory::{GroupPolicyProvider, LocallyHostedIdentities, MembershipDirectory};
use crate::errors::CoreError;
use crate::expiry::{SessionExpiryScheduler, StateEvictor};
use crate::messages::{
    link_out_from_authenticated_message, link_out_from_session_message, open_data_message, AuthenticatedMessage,
    InboundMessage,
};
use crate::pending_queue::PendingSessionMessageQueues;
use crate::pool::{NextSession, OutboundSessionPool, PooledSession};
use crate::protocol_factory::{DefaultProtocolFactory, ProtocolFactory};
use crate::publisher::Publisher;
use crate::revocation::{CertificateCheckMode, CertificateValidator, RevocationChecker};
use crate::state::{SessionState, StateConvertor, StatePersistence};
use crate::stats::{SessionManagerStats, SessionManagerStatsSnapshot};
use crate::store::{SessionStatus, StateDirection, StateMetadata, StateStore};
use crate::types::{
    CounterpartiesKey, HoldingIdentity, HostedIdentity, MemberInfo, MembershipStatus, P2pParameters,
    SessionDirection, SessionId,
};

// ============================================================================
// Collaborators and results
// ============================================================================

/// Capabilities the session manager is built on.
pub struct SessionManagerDeps {
    pub directory: Arc<dyn MembershipDirectory>,
    pub group_policy: Arc<dyn GroupPolicyProvider>,
    pub hosted: Arc<dyn LocallyHostedIdentities>,
    pub crypto: Arc<dyn CryptoOpsClient>,
    pub key_wrapper: Arc<dyn KeyWrapper>,
    pub revocation: Arc<dyn RevocationChecker>,
    pub store: Arc<dyn StateStore>,
    pub publisher: Arc<dyn Publisher>,
    pub clock: Arc<dyn Clock>,
    pub listener: Option<Arc<dyn SessionEventListener>>,
}

/// Hook for session lifecycle events.
pub trait SessionEventListener: Send + Sync {
    fn session_established(&self, _event: &EstablishedSession) {}

    fn session_removed(&self, _session_id: &SessionId, _cause: RemovalCause) {}
}

/// A handshake that just completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedSession {
    pub session_id: SessionId,
    pub counterparties: CounterpartiesKey,
    pub direction: StateDirection,
    /// Queued messages published on the new session.
    pub released: usize,
}

/// Result of [`SessionManager::process_outbound_message`].
#[derive(Debug, Clone)]
pub enum OutboundSessionState {
    /// Negotiations were started; the hellos must be sent to the peer. The
    /// message is queued until one of them completes.
    NewSessionsNeeded {
        counterparties: CounterpartiesKey,
        messages: Vec<(SessionId, LinkOutMessageV1)>,
    },
    /// A negotiation is already running; the message is queued.
    SessionAlreadyPending { counterparties: CounterpartiesKey },
    /// The message was protected with an active session.
    SessionEstablished {
        session: Arc<Session>,
        record: LinkOutMessageV1,
    },
    CannotEstablishSession,
}

/// Result of processing one handshake message.
#[derive(Debug, Clone, Default)]
pub struct SessionMessageOutcome {
    /// Handshake message to send back to the peer.
    pub reply: Option<LinkOutMessageV1>,
    pub established: Option<EstablishedSession>,
}

impl SessionMessageOutcome {
    fn reply(record: LinkOutMessageV1) -> Self {
        Self { reply: Some(record), established: None }
    }

    pub fn is_empty(&self) -> bool {
        self.reply.is_none() && self.established.is_none()
    }
}

/// An application message received on an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub counterparties: CounterpartiesKey,
    pub message: InboundMessage,
}

struct PendingInbound {
    protocol: Arc<AsyncMutex<ResponderProtocol>>,
    /// Our responder hello, resent if the initiator hello is repeated.
    last_reply: Option<LinkOutMessageV1>,
}

enum ResponderLookup {
    Pending(Arc<AsyncMutex<ResponderProtocol>>),
    /// Handshake already answered; resend the answer.
    Completed(LinkOutMessageV1),
}

/// What an outbound negotiation needs to know about both ends.
struct OutboundPeers {
    counterparties: CounterpartiesKey,
    ours: HostedIdentity,
    peer: MemberInfo,
    parameters: P2pParameters,
}

fn session_id_of(header: &Option<CommonHeaderV1>) -> Result<SessionId, CoreError> {
    header
        .as_ref()
        .map(|h| SessionId::from(h.session_id.as_str()))
        .ok_or_else(|| CoreError::ProtocolViolation("handshake message has no header".into()))
}

fn signature_spec(public_key: &[u8]) -> Result<SignatureSpec, CoreError> {
    SignatureSpec::for_public_key(public_key)
        .ok_or_else(|| CoreError::ProtocolViolation("unsupported session key type".into()))
}

fn initiator_state(
    session_id: &SessionId,
    counterparties: &CounterpartiesKey,
    protocol: &InitiatorProtocol,
    status: SessionStatus,
    record: &LinkOutMessageV1,
) -> SessionState {
    SessionState {
        role: Role::Initiator,
        status,
        session_id: session_id.clone(),
        counterparties: Some(counterparties.clone()),
        protocol: Some(protocol.snapshot()),
        session_keys: None,
        last_message: Some(record.clone()),
    }
}

// ============================================================================
// Session manager
// ============================================================================

pub struct SessionManager {
    config: ConfigHandle,
    directory: Arc<dyn MembershipDirectory>,
    group_policy: Arc<dyn GroupPolicyProvider>,
    hosted: Arc<dyn LocallyHostedIdentities>,
    crypto: Arc<dyn CryptoOpsClient>,
    key_wrapper: Arc<dyn KeyWrapper>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    listener: Option<Arc<dyn SessionEventListener>>,
    factory: Arc<dyn ProtocolFactory>,
    pool: OutboundSessionPool,
    cache: Arc<SessionCache>,
    scheduler: Arc<SessionExpiryScheduler>,
    dead_sessions: Arc<DeadSessionMonitor>,
    dead_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    pending_messages: PendingSessionMessageQueues,
    persistence: Arc<StatePersistence>,
    validator: CertificateValidator,
    pending_inbound: DashMap<SessionId, PendingInbound>,
    stats: SessionManagerStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<Self>,
}

impl SessionManager {
    pub fn new(config: ConfigHandle, deps: SessionManagerDeps) -> Arc<Self> {
        Self::with_factory(config, deps, Arc::new(DefaultProtocolFactory))
    }

    pub fn with_factory(
        config: ConfigHandle,
        deps: SessionManagerDeps,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Arc<Self> {
        let current = config.current();
        let scheduler = SessionExpiryScheduler::new(deps.store.clone(), deps.clock.clone());
        let cache = SessionCache::new(current.session_cache_capacity, scheduler.clone(), deps.clock.clone());
        let (dead_sessions, dead_rx) = DeadSessionMonitor::new();
        dead_sessions.on_configuration_change(current.session_inactivity_limit());
        let pool = OutboundSessionPool::new(dead_sessions.clone());
        let pending_messages =
            PendingSessionMessageQueues::new(deps.publisher.clone(), dead_sessions.clone(), deps.clock.clone());
        let persistence = StatePersistence::new(
            deps.store.clone(),
            StateConvertor::new(deps.key_wrapper.clone()),
            scheduler.clone(),
        );

        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let listener: Weak<dyn SessionRemovalListener> = self_ref.clone();
            cache.add_removal_listener(listener);
            let evictor: Weak<dyn StateEvictor> = self_ref.clone();
            scheduler.register_evictor(evictor);

            Self {
                config,
                directory: deps.directory,
                group_policy: deps.group_policy,
                hosted: deps.hosted,
                crypto: deps.crypto,
                key_wrapper: deps.key_wrapper,
                publisher: deps.publisher,
                clock: deps.clock,
                listener: deps.listener,
                factory,
                pool,
                cache,
                scheduler,
                dead_sessions,
                dead_rx: Mutex::new(Some(dead_rx)),
                pending_messages,
                persistence,
                validator: CertificateValidator::new(deps.revocation),
                pending_inbound: DashMap::new(),
                stats: SessionManagerStats::new(),
                tasks: Mutex::new(Vec::new()),
                self_ref: self_ref.clone(),
            }
        })
    }

    /// Start consuming dead-session reports and configuration updates.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        if let Some(mut dead_rx) = self.dead_rx.lock().take() {
            let manager = self.self_ref.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(session_id) = dead_rx.recv().await {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.handle_dead_session(&session_id).await;
                }
            }));
        }

        let mut config_rx = self.config.subscribe();
        let dead_sessions = self.dead_sessions.clone();
        tasks.push(tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let limit = config_rx.borrow_and_update().session_inactivity_limit();
                dead_sessions.on_configuration_change(limit);
            }
        }));

        info!("Session manager started");
    }

    /// Stop background tasks and timers and drop queued messages.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.scheduler.stop();
        self.dead_sessions.stop();
        self.pending_messages.destroy_all_queues();
        info!("Session manager stopped");
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn stats(&self) -> SessionManagerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool(&self) -> &OutboundSessionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<SessionExpiryScheduler> {
        &self.scheduler
    }

    pub fn dead_sessions(&self) -> &Arc<DeadSessionMonitor> {
        &self.dead_sessions
    }

    pub fn pending_messages(&self) -> &PendingSessionMessageQueues {
        &self.pending_messages
    }

    /// Number of inbound negotiations waiting for the initiator handshake.
    pub fn pending_inbound_len(&self) -> usize {
        self.pending_inbound.len()
    }

    fn expiry_after(&self, ttl: Duration) -> u64 {
        self.clock.now_millis().saturating_add(ttl.as_millis() as u64)
    }

    fn parameters_for(&self, identity: &HoldingIdentity) -> Result<P2pParameters, CoreError> {
        self.group_policy
            .get_p2p_parameters(identity)
            .ok_or_else(|| CoreError::Lookup(format!("no group policy for {}", identity)))
    }

    fn member(&self, identity: &HoldingIdentity) -> Result<MemberInfo, CoreError> {
        self.directory
            .lookup(identity)
            .ok_or_else(|| CoreError::Lookup(format!("{} is not a known member", identity)))
    }

    fn member_by_key_hash(&self, group_id: &str, key_hash: &[u8; 32]) -> Result<MemberInfo, CoreError> {
        self.directory
            .lookup_by_public_key_hash(group_id, key_hash)
            .ok_or_else(|| CoreError::Lookup(format!("no member of {} holds session key {}", group_id, hex::encode(key_hash))))
    }

    async fn sign(&self, ours: &HostedIdentity, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        let spec = signature_spec(&ours.session_public_key)?;
        self.crypto
            .sign(&ours.tenant_id, &ours.session_public_key, spec, data)
            .await
            .map_err(|e| CoreError::Crypto(e.to_string()))
    }

    async fn persist(&self, state: SessionState, direction: StateDirection, expiry_millis: u64) {
        let metadata = StateMetadata { expiry_millis, direction, status: state.status };
        if let Err(e) = self.persistence.save(state.session_id.as_str(), metadata, &state).await {
            warn!(session_id = %state.session_id, error = %e, "Failed to persist session state");
        }
    }

    fn track_send(&self, session_id: &SessionId) {
        if let Err(e) = self.dead_sessions.message_sent(session_id) {
            warn!(session_id = %session_id, error = %e, "Cannot track send");
        }
    }

    fn notify_established(&self, event: &EstablishedSession) {
        if let Some(listener) = &self.listener {
            listener.session_established(event);
        }
    }

    fn notify_removed(&self, session_id: &SessionId, cause: RemovalCause) {
        if let Some(listener) = &self.listener {
            listener.session_removed(session_id, cause);
        }
    }

    // ========================================================================
    // Outbound messages
    // ========================================================================

    /// Send `message` on an active session, or queue it and start negotiating.
    ///
    /// # Returns
    /// The outcome for the pair; an error only if an active session exists
    /// but cannot carry the message.
    pub async fn process_outbound_message(
        &self,
        message: AuthenticatedMessage,
    ) -> Result<OutboundSessionState, CoreError> {
        let Some(peers) = self.resolve_outbound(&message.header.source, &message.header.destination) else {
            return Ok(OutboundSessionState::CannotEstablishSession);
        };
        let counterparties = peers.counterparties.clone();
        let network_type = peers.parameters.network_type;

        match self.pool.get_next_session(&counterparties) {
            NextSession::SessionActive(session) => {
                // Left over from a failed release.
                if self.pending_messages.queued_len(&counterparties) > 0 {
                    let released = self
                        .pending_messages
                        .session_negotiated(&counterparties, &session, network_type)
                        .await;
                    SessionManagerStats::add(&self.stats.messages_released, released);
                }
                let record =
                    link_out_from_authenticated_message(&message, &session, network_type, self.clock.now_millis())
                        .map_err(|e| {
                            warn!(message_id = %message.header.message_id, error = %e, "Cannot send message");
                            self.stats.record_discard(e.kind());
                            e
                        })?;
                self.record_message_sent(&SessionId::from(session.session_id()))?;
                Ok(OutboundSessionState::SessionEstablished { session, record })
            }
            NextSession::SessionPending => {
                self.queue_message(&counterparties, message, &peers).await;
                Ok(OutboundSessionState::SessionAlreadyPending { counterparties })
            }
            NextSession::NewSessionsNeeded => {
                let started = self.start_negotiations(&peers).await;
                self.queue_message(&counterparties, message, &peers).await;
                Ok(match started {
                    Some(messages) => OutboundSessionState::NewSessionsNeeded { counterparties, messages },
                    None => OutboundSessionState::SessionAlreadyPending { counterparties },
                })
            }
        }
    }

    fn resolve_outbound(&self, source: &HoldingIdentity, destination: &HoldingIdentity) -> Option<OutboundPeers> {
        let Some(ours) = self.hosted.get(source) else {
            warn!(source = %source, "Source is not hosted locally, cannot establish session");
            return None;
        };
        let Some(peer) = self.directory.lookup(destination) else {
            warn!(destination = %destination, "Destination is not a known member, cannot establish session");
            return None;
        };
        if peer.status != MembershipStatus::Active {
            warn!(destination = %destination, status = ?peer.status, "Destination is not active, cannot establish session");
            return None;
        }
        let Some(parameters) = self.group_policy.get_p2p_parameters(source) else {
            warn!(source = %source, "No group policy, cannot establish session");
            return None;
        };
        Some(OutboundPeers {
            counterparties: CounterpartiesKey::new(source.clone(), destination.clone(), peer.serial),
            ours,
            peer,
            parameters,
        })
    }

    async fn queue_message(&self, counterparties: &CounterpartiesKey, message: AuthenticatedMessage, peers: &OutboundPeers) {
        self.pending_messages.queue_message(counterparties, message);
        SessionManagerStats::inc(&self.stats.messages_queued);

        // A negotiation may have completed between the pool lookup and the queueing.
        if let NextSession::SessionActive(session) = self.pool.get_next_session(counterparties) {
            let released = self
                .pending_messages
                .session_negotiated(counterparties, &session, peers.parameters.network_type)
                .await;
            SessionManagerStats::add(&self.stats.messages_released, released);
        }
    }

    fn initiator_hello(
        &self,
        session_id: &SessionId,
        peers: &OutboundPeers,
        max_message_size: u32,
    ) -> Result<(InitiatorProtocol, LinkOutMessageV1), CoreError> {
        let mut protocol = self.factory.create_initiator(
            session_id,
            peers.parameters.protocol_modes.clone(),
            max_message_size,
            &peers.ours.session_public_key,
            &peers.counterparties.our_id.group_id,
        );
        let hello = protocol.generate_initiator_hello()?;
        let record = link_out_from_session_message(
            hello.into(),
            &peers.counterparties.our_id,
            &peers.counterparties.counterparty_id,
            peers.parameters.network_type,
        );
        Ok((protocol, record))
    }

    /// Start the configured number of negotiations towards the peer.
    ///
    /// # Returns
    /// The hellos to send, or `None` if a concurrent send started
    /// negotiating first.
    async fn start_negotiations(&self, peers: &OutboundPeers) -> Option<Vec<(SessionId, LinkOutMessageV1)>> {
        let config = self.config.current();
        let count = config.sessions_per_peer(peers.peer.is_mgm);
        let expiry = self.expiry_after(config.pending_session_ttl());

        let mut protocols = Vec::with_capacity(count);
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let session_id = SessionId::random();
            let (protocol, record) = match self.initiator_hello(&session_id, peers, config.max_message_size) {
                Ok(created) => created,
                Err(e) => {
                    warn!(counterparties = %peers.counterparties, error = %e, "Cannot start negotiation");
                    continue;
                }
            };
            let state = initiator_state(
                &session_id,
                &peers.counterparties,
                &protocol,
                SessionStatus::SentInitiatorHello,
                &record,
            );
            self.persist(state, StateDirection::Outbound, expiry).await;
            protocols.push(protocol);
            messages.push((session_id, record));
        }

        if self.pool.try_add_pending_sessions(&peers.counterparties, protocols).is_err() {
            debug!(counterparties = %peers.counterparties, "Negotiations already started elsewhere");
            for (session_id, _) in &messages {
                if let Err(e) = self.persistence.delete(session_id.as_str()).await {
                    warn!(session_id = %session_id, error = %e, "Failed to delete unused negotiation state");
                }
            }
            return None;
        }
        for (session_id, _) in &messages {
            self.track_send(session_id);
        }
        debug!(counterparties = %peers.counterparties, count = messages.len(), "Started negotiations");
        Some(messages)
    }

    // ========================================================================
    // Handshake messages
    // ========================================================================

    /// Advance the handshake `message` belongs to.
    pub async fn process_session_message(&self, message: &SessionMessageV1) -> SessionMessageOutcome {
        use session_message_v1::Payload;

        SessionManagerStats::inc(&self.stats.session_messages);
        let result = match &message.payload {
            Some(Payload::InitiatorHello(hello)) => {
                self.process_initiator_hello(hello).await.map(SessionMessageOutcome::reply)
            }
            Some(Payload::ResponderHello(hello)) => {
                self.process_responder_hello(hello).await.map(SessionMessageOutcome::reply)
            }
            Some(Payload::InitiatorHandshake(handshake)) => self.process_initiator_handshake(handshake).await,
            Some(Payload::ResponderHandshake(handshake)) => self.process_responder_handshake(handshake).await,
            Some(Payload::Step2(step2)) => self.process_step2(step2).await.map(|()| SessionMessageOutcome::default()),
            None => Err(CoreError::ProtocolViolation("session message has no payload".into())),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    kind = message.kind(),
                    session_id = message.session_id().unwrap_or("-"),
                    error = %e,
                    "Discarding session message"
                );
                self.stats.record_discard(e.kind());
                SessionMessageOutcome::default()
            }
        }
    }

    /// Process a batch; a failing message does not affect the others.
    pub async fn process_session_messages(
        &self,
        messages: Vec<SessionMessageV1>,
    ) -> Vec<(SessionMessageV1, SessionMessageOutcome)> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            let outcome = self.process_session_message(&message).await;
            results.push((message, outcome));
        }
        results
    }

    async fn process_initiator_hello(&self, hello: &InitiatorHelloV1) -> Result<LinkOutMessageV1, CoreError> {
        let session_id = session_id_of(&hello.header)?;
        if let Some(pending) = self.pending_inbound.get(&session_id) {
            debug!(session_id = %session_id, "Repeated initiator hello");
            return pending
                .last_reply
                .clone()
                .ok_or_else(|| CoreError::ProtocolViolation(format!("session {} is already negotiating", session_id)));
        }
        if let Some((_, stored)) = self.persistence.load(session_id.as_str()).await? {
            return match (stored.role, stored.status, stored.last_message) {
                (Role::Responder, SessionStatus::SentResponderHello, Some(record)) => {
                    debug!(session_id = %session_id, "Repeated initiator hello, resending stored answer");
                    Ok(record)
                }
                (_, SessionStatus::SessionReady, _) => Err(CoreError::ProtocolViolation(format!(
                    "initiator hello for established session {}",
                    session_id
                ))),
                _ => Err(CoreError::ProtocolViolation(format!("session {} is already negotiating", session_id))),
            };
        }

        let config = self.config.current();
        let mut protocol = self.factory.create_responder(&session_id, config.max_message_size);
        protocol.receive_initiator_hello(hello)?;
        let initiator = protocol.initiator_identity()?;
        let peer = self.member_by_key_hash(&initiator.group_id, &initiator.public_key_hash)?;
        let ours = self
            .hosted
            .any_in_group(&initiator.group_id)
            .ok_or_else(|| CoreError::Lookup(format!("no identity hosted in group {}", initiator.group_id)))?;
        let parameters = self.parameters_for(&ours.holding_identity)?;

        let reply = protocol.generate_responder_hello(&parameters.protocol_modes)?;
        let record = link_out_from_session_message(
            reply.into(),
            &ours.holding_identity,
            &peer.holding_identity,
            parameters.network_type,
        );

        let state = SessionState {
            role: Role::Responder,
            status: SessionStatus::SentResponderHello,
            session_id: session_id.clone(),
            counterparties: None,
            protocol: Some(protocol.snapshot()),
            session_keys: None,
            last_message: Some(record.clone()),
        };
        self.persist(state, StateDirection::Inbound, self.expiry_after(config.pending_session_ttl()))
            .await;
        self.pending_inbound.insert(
            session_id.clone(),
            PendingInbound { protocol: Arc::new(AsyncMutex::new(protocol)), last_reply: Some(record.clone()) },
        );

        debug!(session_id = %session_id, peer = %peer.holding_identity, "Answered initiator hello");
        Ok(record)
    }

    fn pending_outbound(
        &self,
        session_id: &SessionId,
    ) -> Result<(CounterpartiesKey, Arc<AsyncMutex<InitiatorProtocol>>), CoreError> {
        match self.pool.get_session(session_id) {
            Some(PooledSession::Pending { counterparties, protocol }) => Ok((counterparties, protocol)),
            Some(PooledSession::Active { .. }) => Err(CoreError::ProtocolViolation(format!(
                "session {} is already established",
                session_id
            ))),
            None => Err(CoreError::Lookup(format!("no outbound negotiation for session {}", session_id))),
        }
    }

    async fn process_responder_hello(&self, hello: &ResponderHelloV1) -> Result<LinkOutMessageV1, CoreError> {
        let session_id = session_id_of(&hello.header)?;
        let (counterparties, protocol) = self.pending_outbound(&session_id)?;
        let ours = self
            .hosted
            .get(&counterparties.our_id)
            .ok_or_else(|| CoreError::Lookup(format!("{} is no longer hosted", counterparties.our_id)))?;
        let peer = self.member(&counterparties.counterparty_id)?;
        let parameters = self.parameters_for(&counterparties.our_id)?;
        let config = self.config.current();

        let mut protocol = protocol.lock().await;
        let mode = protocol.receive_responder_hello(hello)?;
        let signing_data = protocol.handshake_signing_data(&peer.session_public_key)?;
        let signature = self.sign(&ours, &signing_data).await?;
        let handshake = protocol.generate_our_handshake_message(
            &peer.session_public_key,
            ours.session_certificate_chain.clone(),
            signature,
        )?;
        let record = link_out_from_session_message(
            handshake.into(),
            &counterparties.our_id,
            &counterparties.counterparty_id,
            parameters.network_type,
        );
        let state = initiator_state(
            &session_id,
            &counterparties,
            &protocol,
            SessionStatus::SentInitiatorHandshake,
            &record,
        );
        drop(protocol);

        self.dead_sessions.ack_received(&session_id);
        self.persist(state, StateDirection::Outbound, self.expiry_after(config.pending_session_ttl()))
            .await;
        self.track_send(&session_id);

        debug!(session_id = %session_id, ?mode, "Sent initiator handshake");
        Ok(record)
    }

    async fn pending_responder(&self, session_id: &SessionId) -> Result<ResponderLookup, CoreError> {
        if let Some(protocol) = self.pending_inbound.get(session_id).map(|p| p.protocol.clone()) {
            return Ok(ResponderLookup::Pending(protocol));
        }

        let unknown = || CoreError::Lookup(format!("no inbound negotiation for session {}", session_id));
        let Some((_, state)) = self.persistence.load(session_id.as_str()).await? else {
            return Err(unknown());
        };
        if state.role != Role::Responder {
            return Err(unknown());
        }
        match (state.status, state.protocol, state.last_message) {
            (SessionStatus::SessionReady, _, Some(record)) => Ok(ResponderLookup::Completed(record)),
            (SessionStatus::SentResponderHello, Some(snapshot), last_reply) => {
                let protocol = Arc::new(AsyncMutex::new(ResponderProtocol::restore(&snapshot)?));
                debug!(session_id = %session_id, "Resumed inbound negotiation from the state store");
                let pending = self
                    .pending_inbound
                    .entry(session_id.clone())
                    .or_insert(PendingInbound { protocol, last_reply });
                Ok(ResponderLookup::Pending(pending.protocol.clone()))
            }
            _ => Err(unknown()),
        }
    }

    async fn process_initiator_handshake(
        &self,
        handshake: &InitiatorHandshakeV1,
    ) -> Result<SessionMessageOutcome, CoreError> {
        let session_id = session_id_of(&handshake.header)?;
        let protocol = match self.pending_responder(&session_id).await? {
            ResponderLookup::Pending(protocol) => protocol,
            ResponderLookup::Completed(record) => {
                debug!(session_id = %session_id, "Repeated initiator handshake, resending our handshake");
                return Ok(SessionMessageOutcome::reply(record));
            }
        };
        let config = self.config.current();

        let mut protocol = protocol.lock().await;
        let initiator = protocol.initiator_identity()?;
        let peer = self.member_by_key_hash(&initiator.group_id, &initiator.public_key_hash)?;
        let spec = signature_spec(&peer.session_public_key)?;
        let identity = protocol.validate_peer_handshake_message(handshake, &peer.session_public_key, spec)?;
        let ours = self
            .hosted
            .find_by_session_key_hash(&identity.group_id, &identity.responder_public_key_hash)
            .ok_or_else(|| CoreError::Lookup("the handshake names a session key that is not hosted here".into()))?;
        let parameters = self.parameters_for(&ours.holding_identity)?;
        let check = CertificateCheckMode::from_parameters(&parameters, config.revocation_check_mode)?;
        self.validator
            .validate(
                &check,
                &identity.certificate_chain,
                &peer.session_public_key,
                config.revocation_check_timeout(),
            )
            .await?;

        let signing_data = protocol.handshake_signing_data(&ours.session_public_key)?;
        let signature = self.sign(&ours, &signing_data).await?;
        let reply = protocol.generate_our_handshake_message(
            &ours.session_public_key,
            ours.session_certificate_chain.clone(),
            signature,
        )?;
        let session = Arc::new(protocol.get_session()?);
        drop(protocol);

        let counterparties =
            CounterpartiesKey::new(ours.holding_identity.clone(), peer.holding_identity.clone(), peer.serial);
        let record = link_out_from_session_message(
            reply.into(),
            &ours.holding_identity,
            &peer.holding_identity,
            parameters.network_type,
        );
        let expiry = self.expiry_after(config.session_refresh_threshold());
        let state = SessionState {
            role: Role::Responder,
            status: SessionStatus::SessionReady,
            session_id: session_id.clone(),
            counterparties: Some(counterparties.clone()),
            protocol: None,
            session_keys: Some(session.keys()),
            last_message: Some(record.clone()),
        };
        self.persist(state, StateDirection::Inbound, expiry).await;
        self.pending_inbound.remove(&session_id);
        self.cache.put_inbound(counterparties.clone(), session, expiry);
        SessionManagerStats::inc(&self.stats.inbound_established);

        info!(session_id = %session_id, counterparties = %counterparties, "Inbound session established");
        let event = EstablishedSession {
            session_id,
            counterparties,
            direction: StateDirection::Inbound,
            released: 0,
        };
        self.notify_established(&event);
        Ok(SessionMessageOutcome { reply: Some(record), established: Some(event) })
    }

    async fn process_responder_handshake(
        &self,
        handshake: &ResponderHandshakeV1,
    ) -> Result<SessionMessageOutcome, CoreError> {
        let session_id = session_id_of(&handshake.header)?;
        let (counterparties, protocol) = self.pending_outbound(&session_id)?;
        let peer = self.member(&counterparties.counterparty_id)?;
        let parameters = self.parameters_for(&counterparties.our_id)?;
        let config = self.config.current();
        let check = CertificateCheckMode::from_parameters(&parameters, config.revocation_check_mode)?;

        let mut protocol = protocol.lock().await;
        let spec = signature_spec(&peer.session_public_key)?;
        let peer_data = protocol.validate_peer_handshake_message(handshake, &peer.session_public_key, spec)?;
        self.validator
            .validate(
                &check,
                &peer_data.certificate_chain,
                &peer.session_public_key,
                config.revocation_check_timeout(),
            )
            .await?;
        let session = Arc::new(protocol.get_session()?);
        drop(protocol);

        self.dead_sessions.ack_received(&session_id);
        if self.pool.update_after_session_established(session.clone()).is_none() {
            warn!(session_id = %session_id, "Negotiation left the pool before it completed");
        }
        let expiry = self.expiry_after(config.session_refresh_threshold());
        let state = SessionState {
            role: Role::Initiator,
            status: SessionStatus::SessionReady,
            session_id: session_id.clone(),
            counterparties: Some(counterparties.clone()),
            protocol: None,
            session_keys: Some(session.keys()),
            last_message: None,
        };
        self.persist(state, StateDirection::Outbound, expiry).await;
        self.cache.put_outbound(counterparties.clone(), session.clone(), expiry);
        SessionManagerStats::inc(&self.stats.outbound_established);

        let released = self
            .pending_messages
            .session_negotiated(&counterparties, &session, parameters.network_type)
            .await;
        SessionManagerStats::add(&self.stats.messages_released, released);

        info!(session_id = %session_id, counterparties = %counterparties, released, "Outbound session established");
        let event = EstablishedSession {
            session_id,
            counterparties,
            direction: StateDirection::Outbound,
            released,
        };
        self.notify_established(&event);
        Ok(SessionMessageOutcome { reply: None, established: Some(event) })
    }

    /// Take over a negotiation whose hellos were exchanged elsewhere.
    async fn process_step2(&self, step2: &Step2V1) -> Result<(), CoreError> {
        step2.validate()?;
        let (Some(initiator_hello), Some(responder_hello)) = (&step2.initiator_hello, &step2.responder_hello) else {
            return Err(CoreError::ProtocolViolation("step2 without both hellos".into()));
        };
        let session_id = session_id_of(&initiator_hello.header)?;
        if self.pending_inbound.contains_key(&session_id)
            || self.persistence.load(session_id.as_str()).await?.is_some()
        {
            return Err(CoreError::ProtocolViolation(format!("session {} is already negotiating", session_id)));
        }

        let unwrapped = Zeroizing::new(
            self.key_wrapper
                .unwrap(&step2.wrapped_responder_ephemeral_key)
                .await
                .map_err(|e| CoreError::Crypto(e.to_string()))?,
        );
        let secret = Zeroizing::new(
            <[u8; 32]>::try_from(unwrapped.as_slice())
                .map_err(|_| CoreError::ProtocolViolation("wrapped ephemeral key has the wrong size".into()))?,
        );

        let config = self.config.current();
        let protocol =
            ResponderProtocol::from_step2(initiator_hello, responder_hello, *secret, config.max_message_size)?;
        let initiator = protocol.initiator_identity()?;
        let peer = self.member_by_key_hash(&initiator.group_id, &initiator.public_key_hash)?;

        let state = SessionState {
            role: Role::Responder,
            status: SessionStatus::SentResponderHello,
            session_id: session_id.clone(),
            counterparties: None,
            protocol: Some(protocol.snapshot()),
            session_keys: None,
            last_message: None,
        };
        self.persist(state, StateDirection::Inbound, self.expiry_after(config.pending_session_ttl()))
            .await;
        self.pending_inbound.insert(
            session_id.clone(),
            PendingInbound { protocol: Arc::new(AsyncMutex::new(protocol)), last_reply: None },
        );

        debug!(session_id = %session_id, peer = %peer.holding_identity, "Took over negotiation from step2");
        Ok(())
    }

    // ========================================================================
    // Data messages and session lookup
    // ========================================================================

    /// Authenticate or decrypt a data record received from a peer.
    pub async fn process_inbound_data_message(&self, record: &LinkOutMessageV1) -> Option<ReceivedMessage> {
        match self.open_inbound(record).await {
            Ok(received) => Some(received),
            Err(e) => {
                warn!(session_id = record.session_id().unwrap_or("-"), error = %e, "Discarding data message");
                self.stats.record_discard(e.kind());
                None
            }
        }
    }

    async fn open_inbound(&self, record: &LinkOutMessageV1) -> Result<ReceivedMessage, CoreError> {
        let payload = record
            .payload
            .as_ref()
            .ok_or_else(|| CoreError::ProtocolViolation("record has no payload".into()))?;
        let session_id = record
            .session_id()
            .map(SessionId::from)
            .ok_or_else(|| CoreError::ProtocolViolation("record has no session id".into()))?;

        let direction = self.get_session_by_id(&session_id).await;
        let (Some(session), Some(counterparties)) = (direction.session(), direction.counterparties()) else {
            return Err(CoreError::Lookup(format!("no session {}", session_id)));
        };
        let message = open_data_message(payload, session)?;
        if message.header.destination != counterparties.our_id || message.header.source != counterparties.counterparty_id
        {
            return Err(CoreError::ProtocolViolation(format!(
                "message {} does not travel between the parties of session {}",
                message.header.message_id, session_id
            )));
        }

        Ok(ReceivedMessage {
            counterparties: counterparties.clone(),
            message: InboundMessage { session_id: session_id.to_string(), message },
        })
    }

    /// Find an established session: cache, then pool, then the state store.
    pub async fn get_session_by_id(&self, session_id: &SessionId) -> SessionDirection {
        let cached = self.cache.get_by_session_id(session_id);
        if !matches!(cached, SessionDirection::NoSession) {
            return cached;
        }
        if let Some(PooledSession::Active { counterparties, session }) = self.pool.get_session(session_id) {
            return SessionDirection::Outbound { counterparties, session };
        }
        self.restore_session(session_id).await.unwrap_or(SessionDirection::NoSession)
    }

    async fn restore_session(&self, session_id: &SessionId) -> Option<SessionDirection> {
        let (record, state) = match self.persistence.load(session_id.as_str()).await {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read session state");
                return None;
            }
        };
        if state.status != SessionStatus::SessionReady {
            return None;
        }
        let (Some(keys), Some(counterparties)) = (state.session_keys.as_ref(), state.counterparties.clone()) else {
            warn!(session_id = %session_id, "Ready session state without keys");
            return None;
        };

        let session = Arc::new(Session::from_keys(keys));
        let expiry = record.metadata.expiry_millis;
        debug!(session_id = %session_id, "Restored session from the state store");
        Some(match record.metadata.direction {
            StateDirection::Inbound => {
                self.cache.put_inbound(counterparties.clone(), session.clone(), expiry);
                SessionDirection::Inbound { counterparties, session }
            }
            StateDirection::Outbound => {
                self.cache.put_outbound(counterparties.clone(), session.clone(), expiry);
                SessionDirection::Outbound { counterparties, session }
            }
        })
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// The peer acknowledged traffic on `session_id`.
    pub fn process_ack(&self, session_id: &SessionId) {
        self.dead_sessions.ack_received(session_id);
    }

    /// A record was sent on `session_id` and now awaits an ack.
    pub fn record_message_sent(&self, session_id: &SessionId) -> Result<(), CoreError> {
        self.dead_sessions.message_sent(session_id)
    }

    /// Restart a stalled outbound negotiation under a new session id.
    ///
    /// # Returns
    /// The new initiator hello, or `None` if `session_id` is not a pending
    /// outbound negotiation.
    pub async fn refresh_outbound_session(&self, session_id: &SessionId) -> Option<LinkOutMessageV1> {
        let Some(PooledSession::Pending { counterparties, .. }) = self.pool.get_session(session_id) else {
            debug!(session_id = %session_id, "Not a pending outbound negotiation");
            return None;
        };
        let resolved = self.resolve_outbound(&counterparties.our_id, &counterparties.counterparty_id)?;
        let peers = OutboundPeers { counterparties, ..resolved };
        let config = self.config.current();

        let new_id = SessionId::random();
        let (protocol, record) = match self.initiator_hello(&new_id, &peers, config.max_message_size) {
            Ok(created) => created,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Cannot restart negotiation");
                return None;
            }
        };
        let state = initiator_state(
            &new_id,
            &peers.counterparties,
            &protocol,
            SessionStatus::SentInitiatorHello,
            &record,
        );
        if !self.pool.replace_session(session_id, protocol) {
            debug!(session_id = %session_id, "Negotiation completed or left the pool meanwhile");
            return None;
        }

        self.dead_sessions.session_removed(session_id);
        if let Err(e) = self.persistence.delete(session_id.as_str()).await {
            warn!(session_id = %session_id, error = %e, "Failed to delete stalled session state");
        }
        self.persist(state, StateDirection::Outbound, self.expiry_after(config.pending_session_ttl()))
            .await;
        self.track_send(&new_id);
        SessionManagerStats::inc(&self.stats.sessions_refreshed);

        info!(old_session_id = %session_id, session_id = %new_id, "Restarted stalled negotiation");
        Some(record)
    }

    /// React to a session that went unacknowledged for too long.
    ///
    /// Pending negotiations are restarted and the new hello is published;
    /// established sessions are removed so the next send renegotiates.
    pub async fn handle_dead_session(&self, session_id: &SessionId) {
        SessionManagerStats::inc(&self.stats.dead_sessions);

        if matches!(self.pool.get_session(session_id), Some(PooledSession::Pending { .. })) {
            if let Some(hello) = self.refresh_outbound_session(session_id).await {
                if let Err(e) = self.publisher.publish(vec![hello]).await {
                    warn!(session_id = %session_id, error = %e, "Failed to publish restarted hello");
                }
            }
            return;
        }

        warn!(session_id = %session_id, "No ack within the inactivity limit, removing session");
        if !self.cache.invalidate_and_remove_from_scheduler(session_id) && self.pool.remove_session(session_id).is_some()
        {
            self.notify_removed(session_id, RemovalCause::Invalidated);
        }
        if let Err(e) = self.persistence.delete(session_id.as_str()).await {
            warn!(session_id = %session_id, error = %e, "Failed to delete dead session state");
        }
    }
}

impl SessionRemovalListener for SessionManager {
    fn session_removed(&self, session_id: &SessionId, counterparties: &CounterpartiesKey, cause: RemovalCause) {
        self.pool.remove_session(session_id);
        self.dead_sessions.session_removed(session_id);
        debug!(session_id = %session_id, counterparties = %counterparties, ?cause, "Session removed");

        if cause == RemovalCause::Evicted {
            // Evicted sessions are renegotiated; their state goes with them.
            let manager = self.self_ref.clone();
            let key = session_id.to_string();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Some(manager) = manager.upgrade() {
                        if let Err(e) = manager.persistence.delete(&key).await {
                            warn!(session_id = %key, error = %e, "Failed to delete evicted session state");
                        }
                    }
                });
            }
        }
        self.notify_removed(session_id, cause);
    }
}

impl StateEvictor for SessionManager {
    fn evict(&self, key: &str) {
        let session_id = SessionId::from(key);
        if self.pending_inbound.remove(&session_id).is_some() {
            debug!(session_id = %session_id, "Inbound negotiation expired");
        }
        if matches!(self.pool.get_session(&session_id), Some(PooledSession::Pending { .. })) {
            self.pool.remove_session(&session_id);
            self.dead_sessions.session_removed(&session_id);
            debug!(session_id = %session_id, "Outbound negotiation expired");
        }
    }
}
