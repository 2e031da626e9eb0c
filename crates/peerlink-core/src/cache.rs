//! Bounded caches of established sessions.
//!
//! Inbound sessions are cached by session id; outbound sessions by
//! counterparties key, with a session id index next to them. Both caches
//! are LRU bounded. Whatever leaves a cache, by capacity eviction, state
//! expiry or explicit invalidation, is reported to the registered
//! [`SessionRemovalListener`]s.
//!
//! Persisted states are keyed by session id, so the cache doubles as the
//! expiry scheduler's evictor for those keys.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use peerlink_crypto::session::Session;

use crate::clock::Clock;
use crate::expiry::{SessionExpiryScheduler, StateEvictor};
use crate::types::{CounterpartiesKey, SessionDirection, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Pushed out by capacity.
    Evicted,
    /// The persisted state expired.
    Expired,
    Invalidated,
}

pub trait SessionRemovalListener: Send + Sync {
    fn session_removed(&self, session_id: &SessionId, counterparties: &CounterpartiesKey, cause: RemovalCause);
}

struct CachedSession {
    counterparties: CounterpartiesKey,
    session: Arc<Session>,
    expiry_millis: u64,
}

pub struct SessionCache {
    inbound: Mutex<LruCache<SessionId, CachedSession>>,
    outbound: Mutex<LruCache<CounterpartiesKey, CachedSession>>,
    outbound_ids: DashMap<SessionId, CounterpartiesKey>,
    scheduler: Arc<SessionExpiryScheduler>,
    clock: Arc<dyn Clock>,
    listeners: RwLock<Vec<Weak<dyn SessionRemovalListener>>>,
}

impl SessionCache {
    /// Create a cache holding up to `capacity` sessions per direction.
    pub fn new(capacity: usize, scheduler: Arc<SessionExpiryScheduler>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let cache = Arc::new(Self {
            inbound: Mutex::new(LruCache::new(capacity)),
            outbound: Mutex::new(LruCache::new(capacity)),
            outbound_ids: DashMap::new(),
            scheduler: scheduler.clone(),
            clock,
            listeners: RwLock::new(Vec::new()),
        });
        let evictor: Weak<dyn StateEvictor> = Arc::downgrade(&cache) as Weak<dyn StateEvictor>;
        scheduler.register_evictor(evictor);
        cache
    }

    pub fn add_removal_listener(&self, listener: Weak<dyn SessionRemovalListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, session_id: &SessionId, counterparties: &CounterpartiesKey, cause: RemovalCause) {
        debug!(session_id = %session_id, ?cause, "Session left the cache");
        let listeners: Vec<_> = self.listeners.read().iter().filter_map(Weak::upgrade).collect();
        for listener in listeners {
            listener.session_removed(session_id, counterparties, cause);
        }
    }

    fn evicted(&self, session_id: &SessionId, counterparties: &CounterpartiesKey) {
        self.scheduler.cancel(session_id.as_str());
        self.notify(session_id, counterparties, RemovalCause::Evicted);
    }

    pub fn put_inbound(&self, counterparties: CounterpartiesKey, session: Arc<Session>, expiry_millis: u64) {
        let id = SessionId::from(session.session_id());
        let displaced = self
            .inbound
            .lock()
            .push(id.clone(), CachedSession { counterparties, session, expiry_millis });
        if let Some((old_id, old)) = displaced {
            if old_id != id {
                self.evicted(&old_id, &old.counterparties);
            }
        }
    }

    /// Cache `session` as the outbound session of `counterparties`.
    pub fn put_outbound(&self, counterparties: CounterpartiesKey, session: Arc<Session>, expiry_millis: u64) {
        let id = SessionId::from(session.session_id());
        self.outbound_ids.insert(id.clone(), counterparties.clone());
        let displaced = self.outbound.lock().push(
            counterparties.clone(),
            CachedSession { counterparties: counterparties.clone(), session, expiry_millis },
        );
        let Some((old_key, old)) = displaced else {
            return;
        };
        let old_id = SessionId::from(old.session.session_id());
        if old_id == id {
            return;
        }
        self.outbound_ids.remove_if(&old_id, |_, key| key == &old_key);
        // A superseded session of the same pair stays in the pool.
        if old_key != counterparties {
            self.evicted(&old_id, &old_key);
        }
    }

    /// Look a session up by id, inbound first.
    pub fn get_by_session_id(&self, session_id: &SessionId) -> SessionDirection {
        let now = self.clock.now_millis();

        let expired_inbound = {
            let mut inbound = self.inbound.lock();
            let found = inbound
                .get(session_id)
                .map(|c| (c.expiry_millis > now, c.counterparties.clone(), c.session.clone()));
            match found {
                Some((true, counterparties, session)) => {
                    return SessionDirection::Inbound { counterparties, session };
                }
                Some((false, ..)) => inbound.pop(session_id),
                None => None,
            }
        };
        if let Some(expired) = expired_inbound {
            self.notify(session_id, &expired.counterparties, RemovalCause::Expired);
            return SessionDirection::NoSession;
        }

        let Some(key) = self.outbound_ids.get(session_id).map(|k| k.clone()) else {
            return SessionDirection::NoSession;
        };
        match self.get_outbound_entry(&key, now) {
            Some(session) if session.session_id() == session_id.as_str() => {
                SessionDirection::Outbound { counterparties: key, session }
            }
            _ => SessionDirection::NoSession,
        }
    }

    fn get_outbound_entry(&self, key: &CounterpartiesKey, now: u64) -> Option<Arc<Session>> {
        let expired = {
            let mut outbound = self.outbound.lock();
            let found = outbound.get(key).map(|c| (c.expiry_millis > now, c.session.clone()));
            match found {
                Some((true, session)) => return Some(session),
                Some((false, _)) => outbound.pop(key),
                None => None,
            }
        };
        if let Some(expired) = expired {
            let id = SessionId::from(expired.session.session_id());
            self.outbound_ids.remove(&id);
            self.notify(&id, key, RemovalCause::Expired);
        }
        None
    }

    pub fn get_outbound(&self, counterparties: &CounterpartiesKey) -> Option<Arc<Session>> {
        self.get_outbound_entry(counterparties, self.clock.now_millis())
    }

    pub fn get_outbound_batch(&self, keys: &[CounterpartiesKey]) -> HashMap<CounterpartiesKey, Arc<Session>> {
        let now = self.clock.now_millis();
        keys.iter()
            .filter_map(|key| self.get_outbound_entry(key, now).map(|s| (key.clone(), s)))
            .collect()
    }

    fn remove_entry(&self, session_id: &SessionId) -> Option<CounterpartiesKey> {
        if let Some(removed) = self.inbound.lock().pop(session_id) {
            return Some(removed.counterparties);
        }
        let (_, key) = self.outbound_ids.remove(session_id)?;
        let mut outbound = self.outbound.lock();
        let owned = outbound
            .peek(&key)
            .map(|c| c.session.session_id() == session_id.as_str())
            .unwrap_or(false);
        if owned {
            outbound.pop(&key);
        }
        Some(key)
    }

    /// Drop `session_id` from the cache and stop its expiry timer.
    ///
    /// # Returns
    /// Whether the session was cached.
    pub fn invalidate_and_remove_from_scheduler(&self, session_id: &SessionId) -> bool {
        self.scheduler.cancel(session_id.as_str());
        match self.remove_entry(session_id) {
            Some(counterparties) => {
                self.notify(session_id, &counterparties, RemovalCause::Invalidated);
                true
            }
            None => false,
        }
    }

    pub fn all_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.inbound.lock().iter().map(|(id, _)| id.clone()).collect();
        ids.extend(self.outbound_ids.iter().map(|e| e.key().clone()));
        ids
    }

    pub fn len(&self) -> usize {
        self.inbound.lock().len() + self.outbound.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateEvictor for SessionCache {
    fn evict(&self, key: &str) {
        let session_id = SessionId::from(key);
        if let Some(counterparties) = self.remove_entry(&session_id) {
            self.notify(&session_id, &counterparties, RemovalCause::Expired);
        }
    }
}
