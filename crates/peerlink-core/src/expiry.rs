//! Session state expiry.
//!
//! Every persisted session state carries a wall-clock expiry. The scheduler
//! keeps one timer per state key and, when it fires, deletes the state from
//! the store and tells every registered [`StateEvictor`] to drop what it has
//! cached for that key.
//!
//! Timers fire up to [`MAX_EXPIRY_JITTER`] early, chosen uniformly per
//! schedule, so that states created together do not all expire together.
//! Rescheduling a key replaces its timer only when the expiry or the version
//! changed; the latest timer always wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::{delete_latest, PersistedState, StateStore};

/// Upper bound of the random amount by which a timer fires early.
pub const MAX_EXPIRY_JITTER: Duration = Duration::from_secs(20 * 60);

/// Something caching data derived from persisted session states.
pub trait StateEvictor: Send + Sync {
    /// Drop everything cached for the state stored under `key`.
    fn evict(&self, key: &str);
}

struct ScheduledExpiry {
    expiry_millis: u64,
    version: u32,
    generation: u64,
    task: JoinHandle<()>,
}

pub struct SessionExpiryScheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    max_jitter: Duration,
    rng: Mutex<StdRng>,
    scheduled: DashMap<String, ScheduledExpiry>,
    generation: AtomicU64,
    evictors: RwLock<Vec<Weak<dyn StateEvictor>>>,
    self_ref: Weak<Self>,
}

impl SessionExpiryScheduler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_jitter(store, clock, MAX_EXPIRY_JITTER, StdRng::from_entropy())
    }

    pub fn with_jitter(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        max_jitter: Duration,
        rng: StdRng,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            clock,
            max_jitter,
            rng: Mutex::new(rng),
            scheduled: DashMap::new(),
            generation: AtomicU64::new(0),
            evictors: RwLock::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn register_evictor(&self, evictor: Weak<dyn StateEvictor>) {
        self.evictors.write().push(evictor);
    }

    /// Schedule expiry for every state read from or written to the store.
    ///
    /// States already past their expiry are deleted and evicted right away.
    ///
    /// # Returns
    /// The states that are still valid.
    pub async fn check_states_validate_and_remember(&self, states: Vec<PersistedState>) -> Vec<PersistedState> {
        let now = self.clock.now_millis();
        let mut valid = Vec::with_capacity(states.len());
        for state in states {
            if state.metadata.expiry_millis <= now {
                debug!(key = %state.key, "State already expired");
                self.cancel(&state.key);
                self.forget_expired(&state.key, state.version).await;
                continue;
            }
            self.schedule(&state, now);
            valid.push(state);
        }
        valid
    }

    fn schedule(&self, state: &PersistedState, now: u64) {
        let jitter_millis = {
            let max = self.max_jitter.as_millis() as u64;
            self.rng.lock().gen_range(0..=max)
        };
        let delay = Duration::from_millis(
            state
                .metadata
                .expiry_millis
                .saturating_sub(now)
                .saturating_sub(jitter_millis),
        );

        match self.scheduled.entry(state.key.clone()) {
            Entry::Occupied(existing)
                if existing.get().expiry_millis == state.metadata.expiry_millis
                    && existing.get().version == state.version => {}
            Entry::Occupied(mut existing) => {
                let replacement = self.spawn_timer(&state.key, state, delay);
                existing.insert(replacement).task.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.spawn_timer(&state.key, state, delay));
            }
        }
    }

    fn spawn_timer(&self, key: &str, state: &PersistedState, delay: Duration) -> ScheduledExpiry {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.self_ref.clone();
        let key = key.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.expire(&key, generation).await;
            }
        });
        ScheduledExpiry {
            expiry_millis: state.metadata.expiry_millis,
            version: state.version,
            generation,
            task,
        }
    }

    async fn expire(&self, key: &str, generation: u64) {
        let Some((_, expired)) = self.scheduled.remove_if(key, |_, s| s.generation == generation) else {
            return;
        };
        debug!(key, "Session state expired");
        self.forget_expired(key, expired.version).await;
    }

    async fn forget_expired(&self, key: &str, version: u32) {
        if let Err(e) = delete_latest(self.store.as_ref(), key, version).await {
            warn!(key, error = %e, "Failed to delete expired session state");
        }
        self.evict(key);
    }

    fn evict(&self, key: &str) {
        let evictors: Vec<Arc<dyn StateEvictor>> = {
            let mut evictors = self.evictors.write();
            evictors.retain(|e| e.strong_count() > 0);
            evictors.iter().filter_map(Weak::upgrade).collect()
        };
        for evictor in evictors {
            evictor.evict(key);
        }
    }

    /// Stop tracking `key` without touching the store.
    pub fn cancel(&self, key: &str) {
        if let Some((_, scheduled)) = self.scheduled.remove(key) {
            scheduled.task.abort();
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.scheduled.contains_key(key)
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    /// Abort every pending timer.
    pub fn stop(&self) {
        self.scheduled.retain(|_, scheduled| {
            scheduled.task.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ManualClock;
    use crate::store::{InMemoryStateStore, SessionStatus, StateDirection, StateMetadata};

    const HOUR_MILLIS: u64 = 60 * 60 * 1000;

    struct RecordingEvictor(Mutex<Vec<String>>);

    impl StateEvictor for RecordingEvictor {
        fn evict(&self, key: &str) {
            self.0.lock().push(key.to_string());
        }
    }

    fn state(key: &str, expiry_millis: u64) -> PersistedState {
        PersistedState {
            key: key.to_string(),
            value: vec![1],
            version: 0,
            metadata: StateMetadata {
                expiry_millis,
                direction: StateDirection::Inbound,
                status: SessionStatus::SessionReady,
            },
        }
    }

    async fn setup(seed: u64) -> (Arc<InMemoryStateStore>, Arc<SessionExpiryScheduler>, Arc<RecordingEvictor>) {
        let store = InMemoryStateStore::new_shared();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let scheduler = SessionExpiryScheduler::with_jitter(
            store.clone(),
            clock,
            MAX_EXPIRY_JITTER,
            StdRng::seed_from_u64(seed),
        );
        let evictor = Arc::new(RecordingEvictor(Mutex::new(Vec::new())));
        let weak: Weak<dyn StateEvictor> = Arc::downgrade(&evictor) as Weak<dyn StateEvictor>;
        scheduler.register_evictor(weak);
        (store, scheduler, evictor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_within_jitter_window() {
        for seed in 0..5 {
            let (store, scheduler, evictor) = setup(seed).await;
            store.create(vec![state("s", 1_000_000 + HOUR_MILLIS)]).await;
            let valid = scheduler
                .check_states_validate_and_remember(vec![state("s", 1_000_000 + HOUR_MILLIS)])
                .await;
            assert_eq!(valid.len(), 1);

            tokio::time::sleep(Duration::from_secs(40 * 60 - 1)).await;
            assert!(store.contains("s").await, "expired before the jitter window");

            tokio::time::sleep(Duration::from_secs(20 * 60 + 2)).await;
            assert!(!store.contains("s").await, "not expired at the expiry time");
            assert_eq!(*evictor.0.lock(), vec!["s".to_string()]);
            assert!(!scheduler.is_scheduled("s"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_keeps_one_timer() {
        let (store, scheduler, evictor) = setup(1).await;
        store.create(vec![state("s", 1_000_000 + HOUR_MILLIS)]).await;
        for _ in 0..3 {
            scheduler
                .check_states_validate_and_remember(vec![state("s", 1_000_000 + HOUR_MILLIS)])
                .await;
        }
        assert_eq!(scheduler.scheduled_len(), 1);

        tokio::time::sleep(Duration::from_millis(HOUR_MILLIS + 1_000)).await;
        assert_eq!(evictor.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_expiry_wins() {
        let (store, scheduler, _) = setup(2).await;
        store.create(vec![state("s", 1_000_000 + HOUR_MILLIS)]).await;
        scheduler
            .check_states_validate_and_remember(vec![state("s", 1_000_000 + HOUR_MILLIS)])
            .await;
        let mut later = state("s", 1_000_000 + 3 * HOUR_MILLIS);
        later.version = 1;
        scheduler.check_states_validate_and_remember(vec![later]).await;
        assert_eq!(scheduler.scheduled_len(), 1);

        tokio::time::sleep(Duration::from_millis(HOUR_MILLIS + 1_000)).await;
        assert!(store.contains("s").await);
        assert!(scheduler.is_scheduled("s"));
    }

    #[tokio::test]
    async fn test_expired_state_is_deleted_immediately() {
        let (store, scheduler, evictor) = setup(3).await;
        store.create(vec![state("old", 10)]).await;
        let valid = scheduler.check_states_validate_and_remember(vec![state("old", 10)]).await;

        assert!(valid.is_empty());
        assert!(!store.contains("old").await);
        assert_eq!(*evictor.0.lock(), vec!["old".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_store_untouched() {
        let (store, scheduler, evictor) = setup(4).await;
        store.create(vec![state("s", 1_000_000 + HOUR_MILLIS)]).await;
        scheduler
            .check_states_validate_and_remember(vec![state("s", 1_000_000 + HOUR_MILLIS)])
            .await;
        scheduler.cancel("s");

        tokio::time::sleep(Duration::from_millis(2 * HOUR_MILLIS)).await;
        assert!(store.contains("s").await);
        assert!(evictor.0.lock().is_empty());
    }
}
