//! Session state store abstraction.
//!
//! This module defines the `StateStore` trait consumed by the session manager
//! and an in-memory implementation for tests and single-process use.
//!
//! Writes use optimistic concurrency: a state carries the version the writer
//! last saw, `create` stores version 0, and every successful `update` bumps
//! the version by one. Batch operations report failures per key instead of
//! failing the whole batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use peerlink_proto::v1::SessionStatusV1;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("state not found: {0}")]
    NotFound(String),

    #[error("state already exists: {0}")]
    AlreadyExists(String),

    #[error("version mismatch on {key}: wrote against {expected}, store has {actual}")]
    VersionMismatch { key: String, expected: u32, actual: u32 },

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

// ============================================================================
// Data Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateDirection {
    Inbound,
    Outbound,
}

/// Last handshake message sent for a session, or ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    SentInitiatorHello,
    SentResponderHello,
    SentInitiatorHandshake,
    SentResponderHandshake,
    SessionReady,
}

impl SessionStatus {
    pub fn to_proto(self) -> SessionStatusV1 {
        match self {
            SessionStatus::SentInitiatorHello => SessionStatusV1::SentInitiatorHello,
            SessionStatus::SentResponderHello => SessionStatusV1::SentResponderHello,
            SessionStatus::SentInitiatorHandshake => SessionStatusV1::SentInitiatorHandshake,
            SessionStatus::SentResponderHandshake => SessionStatusV1::SentResponderHandshake,
            SessionStatus::SessionReady => SessionStatusV1::SessionReady,
        }
    }

    pub fn from_proto(value: i32) -> Option<Self> {
        Some(match SessionStatusV1::try_from(value).ok()? {
            SessionStatusV1::SentInitiatorHello => SessionStatus::SentInitiatorHello,
            SessionStatusV1::SentResponderHello => SessionStatus::SentResponderHello,
            SessionStatusV1::SentInitiatorHandshake => SessionStatus::SentInitiatorHandshake,
            SessionStatusV1::SentResponderHandshake => SessionStatus::SentResponderHandshake,
            SessionStatusV1::SessionReady => SessionStatus::SessionReady,
            SessionStatusV1::Unspecified => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMetadata {
    /// Wall-clock expiry in milliseconds since the Unix epoch.
    pub expiry_millis: u64,
    pub direction: StateDirection,
    pub status: SessionStatus,
}

/// A versioned record in the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u32,
    pub metadata: StateMetadata,
}

// ============================================================================
// Store Trait
// ============================================================================

/// Versioned key-value store for session state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create new states.
    ///
    /// # Returns
    /// Failures keyed by state key; an empty map means every state was created.
    async fn create(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError>;

    /// Update existing states; each state's version must match the stored one.
    ///
    /// # Returns
    /// Failures keyed by state key.
    async fn update(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError>;

    /// Delete states; each state's version must match the stored one.
    ///
    /// # Returns
    /// Failures keyed by state key.
    async fn delete(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError>;

    /// Fetch the latest version of each existing key.
    async fn get(&self, keys: &[String]) -> Result<Vec<PersistedState>, StoreError>;
}

/// Delete `key`, retrying once against the latest version on a conflict.
///
/// A key that no longer exists counts as deleted.
pub async fn delete_latest(store: &dyn StateStore, key: &str, version: u32) -> Result<(), StoreError> {
    let attempt = |version: u32| PersistedState {
        key: key.to_string(),
        value: Vec::new(),
        version,
        metadata: StateMetadata {
            expiry_millis: 0,
            direction: StateDirection::Inbound,
            status: SessionStatus::SessionReady,
        },
    };

    let mut failures = store.delete(vec![attempt(version)]).await;
    match failures.remove(key) {
        None | Some(StoreError::NotFound(_)) => Ok(()),
        Some(StoreError::VersionMismatch { .. }) => {
            let latest = store.get(&[key.to_string()]).await?;
            let Some(latest) = latest.into_iter().next() else {
                return Ok(());
            };
            match store.delete(vec![attempt(latest.version)]).await.remove(key) {
                None | Some(StoreError::NotFound(_)) => Ok(()),
                Some(e) => Err(e),
            }
        }
        Some(e) => Err(e),
    }
}

// ============================================================================
// In-Memory Store Implementation
// ============================================================================

/// Thread-safe in-memory state store.
#[derive(Default, Clone)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, PersistedState>>>,
}

impl InMemoryStateStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.states.read().await.contains_key(key)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError> {
        let mut stored = self.states.write().await;
        let mut failures = HashMap::new();
        for mut state in states {
            if stored.contains_key(&state.key) {
                failures.insert(state.key.clone(), StoreError::AlreadyExists(state.key));
                continue;
            }
            state.version = 0;
            stored.insert(state.key.clone(), state);
        }
        failures
    }

    async fn update(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError> {
        let mut stored = self.states.write().await;
        let mut failures = HashMap::new();
        for mut state in states {
            match stored.get(&state.key) {
                None => {
                    failures.insert(state.key.clone(), StoreError::NotFound(state.key));
                }
                Some(existing) if existing.version != state.version => {
                    failures.insert(
                        state.key.clone(),
                        StoreError::VersionMismatch {
                            key: state.key.clone(),
                            expected: state.version,
                            actual: existing.version,
                        },
                    );
                }
                Some(_) => {
                    state.version += 1;
                    stored.insert(state.key.clone(), state);
                }
            }
        }
        failures
    }

    async fn delete(&self, states: Vec<PersistedState>) -> HashMap<String, StoreError> {
        let mut stored = self.states.write().await;
        let mut failures = HashMap::new();
        for state in states {
            match stored.get(&state.key) {
                None => {
                    failures.insert(state.key.clone(), StoreError::NotFound(state.key));
                }
                Some(existing) if existing.version != state.version => {
                    failures.insert(
                        state.key.clone(),
                        StoreError::VersionMismatch {
                            key: state.key.clone(),
                            expected: state.version,
                            actual: existing.version,
                        },
                    );
                }
                Some(_) => {
                    stored.remove(&state.key);
                }
            }
        }
        failures
    }

    async fn get(&self, keys: &[String]) -> Result<Vec<PersistedState>, StoreError> {
        let stored = self.states.read().await;
        Ok(keys.iter().filter_map(|k| stored.get(k).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(key: &str, version: u32) -> PersistedState {
        PersistedState {
            key: key.to_string(),
            value: vec![1, 2, 3],
            version,
            metadata: StateMetadata {
                expiry_millis: 1_000,
                direction: StateDirection::Outbound,
                status: SessionStatus::SentInitiatorHello,
            },
        }
    }

    #[tokio::test]
    async fn test_create_then_update_bumps_version() {
        let store = InMemoryStateStore::new();
        assert!(store.create(vec![state("a", 7)]).await.is_empty());
        assert_eq!(store.get(&["a".into()]).await.unwrap()[0].version, 0);

        assert!(store.update(vec![state("a", 0)]).await.is_empty());
        assert_eq!(store.get(&["a".into()]).await.unwrap()[0].version, 1);
    }

    #[tokio::test]
    async fn test_stale_update_is_reported() {
        let store = InMemoryStateStore::new();
        store.create(vec![state("a", 0)]).await;
        store.update(vec![state("a", 0)]).await;

        let failures = store.update(vec![state("a", 0), state("missing", 0)]).await;
        assert_eq!(
            failures.get("a"),
            Some(&StoreError::VersionMismatch { key: "a".into(), expected: 0, actual: 1 })
        );
        assert_eq!(failures.get("missing"), Some(&StoreError::NotFound("missing".into())));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryStateStore::new();
        store.create(vec![state("a", 0)]).await;
        let failures = store.create(vec![state("a", 0), state("b", 0)]).await;
        assert_eq!(failures.len(), 1);
        assert!(store.contains("b").await);
    }

    #[tokio::test]
    async fn test_delete_latest_retries_on_conflict() {
        let store = InMemoryStateStore::new();
        store.create(vec![state("a", 0)]).await;
        store.update(vec![state("a", 0)]).await;
        store.update(vec![state("a", 1)]).await;

        delete_latest(&store, "a", 0).await.unwrap();
        assert!(store.is_empty().await);

        // Already gone.
        delete_latest(&store, "a", 0).await.unwrap();
    }

    #[test]
    fn test_status_proto_mapping() {
        for status in [
            SessionStatus::SentInitiatorHello,
            SessionStatus::SentResponderHello,
            SessionStatus::SentInitiatorHandshake,
            SessionStatus::SentResponderHandshake,
            SessionStatus::SessionReady,
        ] {
            assert_eq!(SessionStatus::from_proto(status.to_proto() as i32), Some(status));
        }
        assert_eq!(SessionStatus::from_proto(0), None);
    }
}
