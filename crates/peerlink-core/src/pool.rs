//! Outbound session pool.
//!
//! For every counterparties key the pool holds the sessions negotiated, or
//! being negotiated, towards that peer. A key has either no entry at all or
//! a set of sessions that are each pending or active.
//!
//! When several sessions are active, one is picked at random with a bias
//! towards sessions the peer has been acknowledging promptly: each session
//! is weighted by how long it has been waiting for an ack, and the chance of
//! picking it is proportional to `1 / (1 + weight)`. When every weight is
//! negligible the choice is uniform.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;

use peerlink_crypto::protocol::InitiatorProtocol;
use peerlink_crypto::session::Session;

use crate::types::{CounterpartiesKey, SessionId};

/// Total weight below which selection is uniform.
const UNIFORM_SELECTION_CUTOFF: f64 = 1e-6;

/// Source of per-session selection weights; larger means less healthy.
pub trait SessionWeigher: Send + Sync {
    fn weight(&self, session_id: &SessionId) -> f64;
}

/// A session held by the pool.
#[derive(Clone)]
pub enum PooledSession {
    Pending {
        counterparties: CounterpartiesKey,
        protocol: Arc<AsyncMutex<InitiatorProtocol>>,
    },
    Active {
        counterparties: CounterpartiesKey,
        session: Arc<Session>,
    },
}

impl PooledSession {
    pub fn counterparties(&self) -> &CounterpartiesKey {
        match self {
            PooledSession::Pending { counterparties, .. } | PooledSession::Active { counterparties, .. } => {
                counterparties
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PooledSession::Active { .. })
    }
}

/// Result of asking the pool for a session to send on.
#[derive(Clone)]
pub enum NextSession {
    SessionActive(Arc<Session>),
    SessionPending,
    NewSessionsNeeded,
}

#[derive(Clone)]
enum Slot {
    Pending(Arc<AsyncMutex<InitiatorProtocol>>),
    Active(Arc<Session>),
}

fn pending_slots(protocols: Vec<InitiatorProtocol>) -> HashMap<SessionId, Slot> {
    protocols
        .into_iter()
        .map(|p| (SessionId::from(p.session_id()), Slot::Pending(Arc::new(AsyncMutex::new(p)))))
        .collect()
}

pub struct OutboundSessionPool {
    sessions: DashMap<CounterpartiesKey, HashMap<SessionId, Slot>>,
    /// Reverse index: session id to its counterparties key.
    index: DashMap<SessionId, CounterpartiesKey>,
    weigher: Arc<dyn SessionWeigher>,
    rng: Mutex<StdRng>,
}

impl OutboundSessionPool {
    pub fn new(weigher: Arc<dyn SessionWeigher>) -> Self {
        Self::with_rng(weigher, StdRng::from_entropy())
    }

    pub fn with_rng(weigher: Arc<dyn SessionWeigher>, rng: StdRng) -> Self {
        Self {
            sessions: DashMap::new(),
            index: DashMap::new(),
            weigher,
            rng: Mutex::new(rng),
        }
    }

    /// Pick a session to send a message to this peer on.
    pub fn get_next_session(&self, counterparties: &CounterpartiesKey) -> NextSession {
        let active: Vec<(SessionId, Arc<Session>)> = {
            let Some(entry) = self.sessions.get(counterparties) else {
                return NextSession::NewSessionsNeeded;
            };
            let active: Vec<_> = entry
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Active(session) => Some((id.clone(), session.clone())),
                    Slot::Pending(_) => None,
                })
                .collect();
            if active.is_empty() {
                return if entry.is_empty() {
                    NextSession::NewSessionsNeeded
                } else {
                    NextSession::SessionPending
                };
            }
            active
        };

        if active.len() == 1 {
            return NextSession::SessionActive(active[0].1.clone());
        }

        let weights: Vec<f64> = active
            .iter()
            .map(|(id, _)| self.weigher.weight(id).max(0.0))
            .collect();
        let index = self.pick(&weights);
        NextSession::SessionActive(active[index].1.clone())
    }

    fn pick(&self, weights: &[f64]) -> usize {
        let mut rng = self.rng.lock();
        let total: f64 = weights.iter().sum();
        if total < UNIFORM_SELECTION_CUTOFF {
            return rng.gen_range(0..weights.len());
        }

        let inverse: Vec<f64> = weights.iter().map(|w| 1.0 / (1.0 + w)).collect();
        let mut target = rng.gen::<f64>() * inverse.iter().sum::<f64>();
        for (i, share) in inverse.iter().enumerate() {
            if target < *share {
                return i;
            }
            target -= share;
        }
        inverse.len() - 1
    }

    /// Replace every session towards `counterparties` with fresh negotiations.
    pub fn add_pending_sessions(&self, counterparties: &CounterpartiesKey, protocols: Vec<InitiatorProtocol>) {
        let slots = pending_slots(protocols);
        let ids: Vec<SessionId> = slots.keys().cloned().collect();
        if let Some(previous) = self.sessions.insert(counterparties.clone(), slots) {
            for id in previous.keys().filter(|id| !ids.contains(id)) {
                self.index.remove_if(id, |_, key| key == counterparties);
            }
        }
        for id in ids {
            self.index.insert(id, counterparties.clone());
        }
    }

    /// Start negotiations towards `counterparties` unless it already has sessions.
    ///
    /// # Returns
    /// The protocols back if another caller got there first.
    pub fn try_add_pending_sessions(
        &self,
        counterparties: &CounterpartiesKey,
        protocols: Vec<InitiatorProtocol>,
    ) -> Result<(), Vec<InitiatorProtocol>> {
        let ids = {
            let mut entry = match self.sessions.entry(counterparties.clone()) {
                Entry::Occupied(existing) if !existing.get().is_empty() => return Err(protocols),
                Entry::Occupied(existing) => existing.into_ref(),
                Entry::Vacant(vacant) => vacant.insert(HashMap::new()),
            };
            entry.extend(pending_slots(protocols));
            entry.keys().cloned().collect::<Vec<_>>()
        };
        for id in ids {
            self.index.insert(id, counterparties.clone());
        }
        Ok(())
    }

    /// Swap a pending negotiation for a restarted one.
    ///
    /// # Returns
    /// `false` if `old` is not a pending session of this pool.
    pub fn replace_session(&self, old: &SessionId, protocol: InitiatorProtocol) -> bool {
        let Some(counterparties) = self.index.get(old).map(|k| k.clone()) else {
            return false;
        };
        let new_id = SessionId::from(protocol.session_id());
        {
            let Some(mut entry) = self.sessions.get_mut(&counterparties) else {
                return false;
            };
            if !matches!(entry.get(old), Some(Slot::Pending(_))) {
                return false;
            }
            entry.remove(old);
            entry.insert(new_id.clone(), Slot::Pending(Arc::new(AsyncMutex::new(protocol))));
        }
        self.index.remove(old);
        self.index.insert(new_id, counterparties);
        true
    }

    /// Mark the negotiation for `session` as complete.
    ///
    /// # Returns
    /// The counterparties key, or `None` if the session is unknown.
    pub fn update_after_session_established(&self, session: Arc<Session>) -> Option<CounterpartiesKey> {
        let id = SessionId::from(session.session_id());
        let counterparties = self.index.get(&id).map(|k| k.clone())?;
        let mut entry = self.sessions.get_mut(&counterparties)?;
        let slot = entry.get_mut(&id)?;
        *slot = Slot::Active(session);
        Some(counterparties)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Option<PooledSession> {
        let counterparties = self.index.get(session_id).map(|k| k.clone())?;
        let slot = self.sessions.get(&counterparties)?.get(session_id)?.clone();
        Some(match slot {
            Slot::Pending(protocol) => PooledSession::Pending { counterparties, protocol },
            Slot::Active(session) => PooledSession::Active { counterparties, session },
        })
    }

    /// Remove one session; the key goes away with its last session.
    pub fn remove_session(&self, session_id: &SessionId) -> Option<CounterpartiesKey> {
        let (_, counterparties) = self.index.remove(session_id)?;
        let now_empty = match self.sessions.get_mut(&counterparties) {
            Some(mut entry) => {
                entry.remove(session_id);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.sessions.remove_if(&counterparties, |_, slots| slots.is_empty());
        }
        Some(counterparties)
    }

    /// Remove every session towards `counterparties`.
    pub fn remove_sessions(&self, counterparties: &CounterpartiesKey) -> Vec<SessionId> {
        let Some((_, slots)) = self.sessions.remove(counterparties) else {
            return Vec::new();
        };
        let ids: Vec<SessionId> = slots.into_keys().collect();
        for id in &ids {
            self.index.remove(id);
        }
        ids
    }

    pub fn get_all_session_ids(&self) -> Vec<SessionId> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear_pool(&self) {
        self.sessions.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
