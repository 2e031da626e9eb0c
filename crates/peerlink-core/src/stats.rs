//! Session manager counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::ErrorKind;

/// Counters updated while the session manager processes messages.
#[derive(Debug, Default)]
pub struct SessionManagerStats {
    /// Session messages received
    pub session_messages: AtomicU64,
    /// Messages discarded for any reason
    pub discarded: AtomicU64,
    /// Discarded as malformed, unexpected or unverifiable
    pub protocol_violations: AtomicU64,
    /// Discarded because a session, member or identity was unknown
    pub lookup_failures: AtomicU64,
    /// Sessions established as initiator
    pub outbound_established: AtomicU64,
    /// Sessions established as responder
    pub inbound_established: AtomicU64,
    /// Application messages held until a session is ready
    pub messages_queued: AtomicU64,
    /// Queued messages released after a handshake
    pub messages_released: AtomicU64,
    /// Sessions declared dead for lack of acks
    pub dead_sessions: AtomicU64,
    /// Pending negotiations restarted with a new session id
    pub sessions_refreshed: AtomicU64,
}

impl SessionManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> SessionManagerStatsSnapshot {
        SessionManagerStatsSnapshot {
            session_messages: self.session_messages.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            outbound_established: self.outbound_established.load(Ordering::Relaxed),
            inbound_established: self.inbound_established.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_released: self.messages_released.load(Ordering::Relaxed),
            dead_sessions: self.dead_sessions.load(Ordering::Relaxed),
            sessions_refreshed: self.sessions_refreshed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self, kind: ErrorKind) {
        Self::inc(&self.discarded);
        match kind {
            ErrorKind::ProtocolViolation => Self::inc(&self.protocol_violations),
            ErrorKind::LookupFailure => Self::inc(&self.lookup_failures),
            _ => {}
        }
    }
}

/// Snapshot of session manager statistics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionManagerStatsSnapshot {
    pub session_messages: u64,
    pub discarded: u64,
    pub protocol_violations: u64,
    pub lookup_failures: u64,
    pub outbound_established: u64,
    pub inbound_established: u64,
    pub messages_queued: u64,
    pub messages_released: u64,
    pub dead_sessions: u64,
    pub sessions_refreshed: u64,
}
