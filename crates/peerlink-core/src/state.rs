//! Session state persistence.
//!
//! This module implements:
//! - [`StateConvertor`]: domain session state to and from the
//!   `SessionStateBlobV1` encoding, with every secret wrapped by the
//!   [`KeyWrapper`] on the way out and unwrapped on the way in
//! - [`StatePersistence`]: create-or-update writes against the versioned
//!   store, retried once against the latest version on a conflict, with
//!   every written or read state handed to the expiry scheduler; expired
//!   keys are forgotten through the scheduler's eviction hook

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use prost::Message;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use peerlink_crypto::protocol::{ProtocolMode, ProtocolSnapshot, Role, Step};
use peerlink_crypto::session::SessionKeys;
use peerlink_proto::v1::{LinkOutMessageV1, ProtocolStateV1, SessionKeysV1, SessionStateBlobV1};

use crate::crypto_client::KeyWrapper;
use crate::errors::CoreError;
use crate::expiry::{SessionExpiryScheduler, StateEvictor};
use crate::store::{delete_latest, PersistedState, SessionStatus, StateMetadata, StateStore, StoreError};
use crate::types::{CounterpartiesKey, SessionId};

/// Everything needed to resume or serve a session after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub role: Role,
    pub status: SessionStatus,
    pub session_id: SessionId,
    pub counterparties: Option<CounterpartiesKey>,
    /// Present while the handshake is running.
    pub protocol: Option<ProtocolSnapshot>,
    /// Present once the session is ready.
    pub session_keys: Option<SessionKeys>,
    /// Last handshake message sent.
    pub last_message: Option<LinkOutMessageV1>,
}

// ============================================================================
// Convertor
// ============================================================================

pub struct StateConvertor {
    wrapper: Arc<dyn KeyWrapper>,
}

fn convert_err(what: &str) -> CoreError {
    CoreError::Convert(what.to_string())
}

fn to_array(bytes: &[u8], what: &str) -> Result<[u8; 32], CoreError> {
    bytes.try_into().map_err(|_| convert_err(what))
}

fn optional_hash(bytes: &[u8], what: &str) -> Result<Option<[u8; 32]>, CoreError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        to_array(bytes, what).map(Some)
    }
}

impl StateConvertor {
    pub fn new(wrapper: Arc<dyn KeyWrapper>) -> Self {
        Self { wrapper }
    }

    async fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>, CoreError> {
        self.wrapper
            .wrap(secret)
            .await
            .map_err(|e| CoreError::Crypto(e.to_string()))
    }

    async fn unwrap_key(&self, wrapped: &[u8], what: &str) -> Result<[u8; 32], CoreError> {
        let secret = Zeroizing::new(
            self.wrapper
                .unwrap(wrapped)
                .await
                .map_err(|e| CoreError::Crypto(e.to_string()))?,
        );
        to_array(&secret, what)
    }

    pub async fn to_bytes(&self, state: &SessionState) -> Result<Vec<u8>, CoreError> {
        let protocol_state = match &state.protocol {
            Some(p) => Some(ProtocolStateV1 {
                role: p.role.to_proto() as i32,
                step: p.step.to_proto() as i32,
                session_id: p.session_id.clone(),
                our_max_message_size: p.our_max_message_size,
                supported_modes: p.supported_modes.iter().map(|m| m.to_proto() as i32).collect(),
                wrapped_ephemeral_key: self.wrap(&p.ephemeral_secret).await?,
                initiator_hello: p.initiator_hello.clone(),
                responder_hello: p.responder_hello.clone(),
                initiator_handshake: p.initiator_handshake.clone(),
                peer_max_message_size: p.peer_max_message_size,
                our_public_key_hash: p.our_public_key_hash.map(|h| h.to_vec()).unwrap_or_default(),
                peer_public_key_hash: p.peer_public_key_hash.map(|h| h.to_vec()).unwrap_or_default(),
                group_id: p.group_id.clone(),
            }),
            None => None,
        };

        let session_keys = match &state.session_keys {
            Some(k) => Some(SessionKeysV1 {
                session_id: k.session_id.clone(),
                mode: k.mode.to_proto() as i32,
                wrapped_outbound_key: self.wrap(&k.outbound_key).await?,
                wrapped_inbound_key: self.wrap(&k.inbound_key).await?,
                max_message_size: k.max_message_size,
            }),
            None => None,
        };

        let blob = SessionStateBlobV1 {
            role: state.role.to_proto() as i32,
            status: state.status.to_proto() as i32,
            session_id: state.session_id.to_string(),
            counterparties: state.counterparties.as_ref().map(CounterpartiesKey::to_proto),
            protocol_state,
            session_keys,
            last_message: state.last_message.clone(),
        };
        Ok(blob.encode_to_vec())
    }

    pub async fn from_bytes(&self, bytes: &[u8]) -> Result<SessionState, CoreError> {
        let blob = SessionStateBlobV1::decode(bytes).map_err(|e| CoreError::Convert(e.to_string()))?;

        let protocol = match &blob.protocol_state {
            Some(p) => Some(ProtocolSnapshot {
                role: Role::from_proto(p.role).ok_or_else(|| convert_err("protocol role"))?,
                step: Step::from_proto(p.step).ok_or_else(|| convert_err("protocol step"))?,
                session_id: p.session_id.clone(),
                supported_modes: p
                    .supported_modes
                    .iter()
                    .map(|m| ProtocolMode::from_proto(*m).ok_or_else(|| convert_err("protocol mode")))
                    .collect::<Result<_, _>>()?,
                our_max_message_size: p.our_max_message_size,
                ephemeral_secret: self.unwrap_key(&p.wrapped_ephemeral_key, "ephemeral key").await?,
                initiator_hello: p.initiator_hello.clone(),
                responder_hello: p.responder_hello.clone(),
                initiator_handshake: p.initiator_handshake.clone(),
                peer_max_message_size: p.peer_max_message_size,
                our_public_key_hash: optional_hash(&p.our_public_key_hash, "our public key hash")?,
                peer_public_key_hash: optional_hash(&p.peer_public_key_hash, "peer public key hash")?,
                group_id: p.group_id.clone(),
            }),
            None => None,
        };

        let session_keys = match &blob.session_keys {
            Some(k) => Some(SessionKeys {
                session_id: k.session_id.clone(),
                mode: ProtocolMode::from_proto(k.mode).ok_or_else(|| convert_err("session mode"))?,
                outbound_key: self.unwrap_key(&k.wrapped_outbound_key, "outbound key").await?,
                inbound_key: self.unwrap_key(&k.wrapped_inbound_key, "inbound key").await?,
                max_message_size: k.max_message_size,
            }),
            None => None,
        };

        Ok(SessionState {
            role: Role::from_proto(blob.role).ok_or_else(|| convert_err("session role"))?,
            status: SessionStatus::from_proto(blob.status).ok_or_else(|| convert_err("session status"))?,
            session_id: SessionId::from(blob.session_id),
            counterparties: match &blob.counterparties {
                Some(c) => Some(CounterpartiesKey::from_proto(c).ok_or_else(|| convert_err("counterparties"))?),
                None => None,
            },
            protocol,
            session_keys,
            last_message: blob.last_message,
        })
    }

    /// Decode a persisted state; undecodable states are logged and skipped.
    pub async fn from_persisted(&self, state: &PersistedState) -> Option<SessionState> {
        match self.from_bytes(&state.value).await {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key = %state.key, error = %e, "Discarding undecodable session state");
                None
            }
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

pub struct StatePersistence {
    store: Arc<dyn StateStore>,
    convertor: StateConvertor,
    scheduler: Arc<SessionExpiryScheduler>,
    /// Last version seen per key.
    versions: DashMap<String, u32>,
}

fn is_conflict(error: &StoreError) -> bool {
    matches!(
        error,
        StoreError::VersionMismatch { .. } | StoreError::AlreadyExists(_) | StoreError::NotFound(_)
    )
}

impl StatePersistence {
    pub fn new(
        store: Arc<dyn StateStore>,
        convertor: StateConvertor,
        scheduler: Arc<SessionExpiryScheduler>,
    ) -> Arc<Self> {
        let persistence = Arc::new(Self { store, convertor, scheduler, versions: DashMap::new() });
        let evictor: Weak<dyn StateEvictor> = Arc::downgrade(&persistence) as Weak<dyn StateEvictor>;
        persistence.scheduler.register_evictor(evictor);
        persistence
    }

    pub fn convertor(&self) -> &StateConvertor {
        &self.convertor
    }

    /// Create or update the state stored under `key`.
    ///
    /// # Returns
    /// The record as written, carrying its new version.
    pub async fn save(&self, key: &str, metadata: StateMetadata, state: &SessionState) -> Result<PersistedState, CoreError> {
        let mut record = PersistedState {
            key: key.to_string(),
            value: self.convertor.to_bytes(state).await?,
            version: 0,
            metadata,
        };

        match self.write(&mut record).await {
            Ok(()) => {}
            Err(e) if is_conflict(&e) => {
                debug!(key, error = %e, "Retrying state write against the latest version");
                match self.store.get(&[key.to_string()]).await?.into_iter().next() {
                    Some(latest) => {
                        self.versions.insert(key.to_string(), latest.version);
                    }
                    None => {
                        self.versions.remove(key);
                    }
                }
                if let Err(e) = self.write(&mut record).await {
                    warn!(key, error = %e, "State write failed twice");
                    return Err(CoreError::PersistenceConflict { key: key.to_string() });
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.scheduler
            .check_states_validate_and_remember(vec![record.clone()])
            .await;
        Ok(record)
    }

    async fn write(&self, record: &mut PersistedState) -> Result<(), StoreError> {
        let known = self.versions.get(&record.key).map(|v| *v);
        let mut failures = match known {
            Some(version) => {
                record.version = version;
                self.store.update(vec![record.clone()]).await
            }
            None => self.store.create(vec![record.clone()]).await,
        };
        if let Some(e) = failures.remove(&record.key) {
            return Err(e);
        }
        record.version = known.map_or(0, |v| v + 1);
        self.versions.insert(record.key.clone(), record.version);
        Ok(())
    }

    /// Read and decode the state stored under `key`, if it is still valid.
    pub async fn load(&self, key: &str) -> Result<Option<(PersistedState, SessionState)>, CoreError> {
        let states = self.store.get(&[key.to_string()]).await?;
        let valid = self.scheduler.check_states_validate_and_remember(states).await;
        let Some(record) = valid.into_iter().next() else {
            return Ok(None);
        };
        self.versions.insert(record.key.clone(), record.version);
        Ok(self.convertor.from_persisted(&record).await.map(|state| (record, state)))
    }

    /// Delete the state stored under `key` and stop its expiry timer.
    pub async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.scheduler.cancel(key);
        let version = self.versions.remove(key).map_or(0, |(_, v)| v);
        delete_latest(self.store.as_ref(), key, version).await?;
        Ok(())
    }
}

impl StateEvictor for StatePersistence {
    fn evict(&self, key: &str) {
        self.versions.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto_client::{CryptoClientError, LocalKeyWrapper};
    use crate::harness::ManualClock;
    use crate::store::{InMemoryStateStore, StateDirection};
    use crate::types::HoldingIdentity;
    use async_trait::async_trait;
    use peerlink_crypto::protocol::InitiatorProtocol;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const FAR_EXPIRY: u64 = 100_000_000;

    struct BrokenWrapper;

    #[async_trait]
    impl KeyWrapper for BrokenWrapper {
        async fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoClientError> {
            Ok(secret.to_vec())
        }

        async fn unwrap(&self, _wrapped: &[u8]) -> Result<Vec<u8>, CryptoClientError> {
            Err(CryptoClientError::Unavailable("offline".into()))
        }
    }

    fn pending_state() -> SessionState {
        let mut protocol = InitiatorProtocol::new(
            "s1",
            vec![ProtocolMode::AuthenticatedEncryption],
            10_000,
            &[4u8; 32],
            "group",
        );
        protocol.generate_initiator_hello().unwrap();
        SessionState {
            role: Role::Initiator,
            status: SessionStatus::SentInitiatorHello,
            session_id: SessionId::from("s1"),
            counterparties: Some(CounterpartiesKey::new(
                HoldingIdentity::new("O=Alice", "group"),
                HoldingIdentity::new("O=Bob", "group"),
                2,
            )),
            protocol: Some(protocol.snapshot()),
            session_keys: None,
            last_message: Some(LinkOutMessageV1::default()),
        }
    }

    fn ready_state() -> SessionState {
        SessionState {
            role: Role::Responder,
            status: SessionStatus::SessionReady,
            session_id: SessionId::from("s2"),
            counterparties: None,
            protocol: None,
            session_keys: Some(SessionKeys {
                session_id: "s2".into(),
                mode: ProtocolMode::AuthenticationOnly,
                outbound_key: [7u8; 32],
                inbound_key: [8u8; 32],
                max_message_size: 500,
            }),
            last_message: None,
        }
    }

    fn metadata(expiry_millis: u64) -> StateMetadata {
        StateMetadata {
            expiry_millis,
            direction: StateDirection::Outbound,
            status: SessionStatus::SentInitiatorHello,
        }
    }

    fn persistence(store: Arc<InMemoryStateStore>) -> Arc<StatePersistence> {
        let clock = Arc::new(ManualClock::new(1_000));
        let scheduler = SessionExpiryScheduler::new(store.clone(), clock);
        let wrapper = Arc::new(LocalKeyWrapper::generate().unwrap());
        StatePersistence::new(store, StateConvertor::new(wrapper), scheduler)
    }

    #[tokio::test]
    async fn test_round_trip_preserves_state() {
        let convertor = StateConvertor::new(Arc::new(LocalKeyWrapper::generate().unwrap()));
        for state in [pending_state(), ready_state()] {
            let bytes = convertor.to_bytes(&state).await.unwrap();
            assert_eq!(convertor.from_bytes(&bytes).await.unwrap(), state);
        }
    }

    #[tokio::test]
    async fn test_secrets_are_not_stored_in_clear() {
        let convertor = StateConvertor::new(Arc::new(LocalKeyWrapper::generate().unwrap()));
        let bytes = convertor.to_bytes(&ready_state()).await.unwrap();
        assert!(!bytes.windows(32).any(|w| w == [7u8; 32]));
        assert!(!bytes.windows(32).any(|w| w == [8u8; 32]));
    }

    #[tokio::test]
    async fn test_failed_unwrap_yields_none() {
        let convertor = StateConvertor::new(Arc::new(BrokenWrapper));
        let record = PersistedState {
            key: "s2".into(),
            value: convertor.to_bytes(&ready_state()).await.unwrap(),
            version: 0,
            metadata: metadata(10_000),
        };
        assert!(convertor.from_persisted(&record).await.is_none());

        let garbage = PersistedState { value: vec![0xff, 0xff, 0xff], ..record };
        assert!(convertor.from_persisted(&garbage).await.is_none());
    }

    #[tokio::test]
    async fn test_save_creates_then_updates() {
        let store = InMemoryStateStore::new_shared();
        let persistence = persistence(store.clone());

        let first = persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();
        assert_eq!(first.version, 0);
        let second = persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();
        assert_eq!(second.version, 1);

        let (record, state) = persistence.load("s1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(state, pending_state());
    }

    #[tokio::test]
    async fn test_conflicting_writer_is_retried_once() {
        let store = InMemoryStateStore::new_shared();
        let persistence = persistence(store.clone());
        let first = persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();

        // Another worker moves the state on.
        assert!(store.update(vec![first.clone()]).await.is_empty());

        let saved = persistence.save("s1", metadata(FAR_EXPIRY), &ready_state()).await.unwrap();
        assert_eq!(saved.version, 2);
    }

    #[tokio::test]
    async fn test_save_recreates_deleted_state() {
        let store = InMemoryStateStore::new_shared();
        let persistence = persistence(store.clone());
        let first = persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();
        store.delete(vec![first]).await;

        let saved = persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();
        assert_eq!(saved.version, 0);
        assert!(store.contains("s1").await);
    }

    #[tokio::test]
    async fn test_delete_removes_state() {
        let store = InMemoryStateStore::new_shared();
        let persistence = persistence(store.clone());
        persistence.save("s1", metadata(FAR_EXPIRY), &pending_state()).await.unwrap();
        persistence.delete("s1").await.unwrap();
        assert!(store.is_empty().await);
        assert!(persistence.load("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_states_are_forgotten() {
        let store = InMemoryStateStore::new_shared();
        let clock = Arc::new(ManualClock::new(1_000));
        let scheduler =
            SessionExpiryScheduler::with_jitter(store.clone(), clock, Duration::ZERO, StdRng::seed_from_u64(7));
        let wrapper = Arc::new(LocalKeyWrapper::generate().unwrap());
        let persistence = StatePersistence::new(store.clone(), StateConvertor::new(wrapper), scheduler);

        for i in 0..20 {
            persistence
                .save(&format!("s{}", i), metadata(2_000), &pending_state())
                .await
                .unwrap();
        }
        assert_eq!(persistence.versions.len(), 20);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.is_empty().await);
        assert!(persistence.versions.is_empty());
    }
}
