//! Dead session detection.
//!
//! A session is dead when the peer has not acknowledged anything sent on it
//! within the configured inactivity limit. The first unacknowledged send
//! starts a timer; an ack cancels it. A timer that fires reports the session
//! id on the channel returned by [`DeadSessionMonitor::new`].
//!
//! The time a session has been waiting for an ack also serves as its weight
//! for outbound session selection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::CoreError;
use crate::pool::SessionWeigher;
use crate::types::SessionId;

struct ScheduledDeath {
    since: Instant,
    generation: u64,
    task: JoinHandle<()>,
}

pub struct DeadSessionMonitor {
    /// Unset until the first configuration arrives.
    inactivity_limit: RwLock<Option<Duration>>,
    scheduled: DashMap<SessionId, ScheduledDeath>,
    generation: AtomicU64,
    dead_tx: mpsc::UnboundedSender<SessionId>,
    self_ref: Weak<Self>,
}

impl DeadSessionMonitor {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionId>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new_cyclic(|self_ref| Self {
            inactivity_limit: RwLock::new(None),
            scheduled: DashMap::new(),
            generation: AtomicU64::new(0),
            dead_tx,
            self_ref: self_ref.clone(),
        });
        (monitor, dead_rx)
    }

    /// Apply a new inactivity limit; running timers keep their deadline.
    pub fn on_configuration_change(&self, limit: Duration) {
        let previous = self.inactivity_limit.write().replace(limit);
        if previous != Some(limit) {
            info!(?limit, "Session inactivity limit updated");
        }
    }

    /// Record a send on `session_id`, starting its timer if none is running.
    pub fn message_sent(&self, session_id: &SessionId) -> Result<(), CoreError> {
        let limit = self
            .inactivity_limit
            .read()
            .ok_or(CoreError::ConfigurationNotYetAvailable("session inactivity limit"))?;

        if let Entry::Vacant(vacant) = self.scheduled.entry(session_id.clone()) {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let monitor = self.self_ref.clone();
            let id = session_id.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if let Some(monitor) = monitor.upgrade() {
                    monitor.fire(id, generation);
                }
            });
            vacant.insert(ScheduledDeath { since: Instant::now(), generation, task });
        }
        Ok(())
    }

    fn fire(&self, session_id: SessionId, generation: u64) {
        if self
            .scheduled
            .remove_if(&session_id, |_, s| s.generation == generation)
            .is_none()
        {
            return;
        }
        debug!(session_id = %session_id, "No ack within the inactivity limit");
        if let Err(e) = self.dead_tx.send(session_id) {
            debug!(session_id = %e.0, "Dead session channel closed, dropping report");
        }
    }

    pub fn ack_received(&self, session_id: &SessionId) {
        self.cancel(session_id);
    }

    pub fn session_removed(&self, session_id: &SessionId) {
        self.cancel(session_id);
    }

    fn cancel(&self, session_id: &SessionId) {
        if let Some((_, scheduled)) = self.scheduled.remove(session_id) {
            scheduled.task.abort();
        }
    }

    /// Milliseconds `session_id` has been waiting for an ack; 0 if none.
    pub fn weight(&self, session_id: &SessionId) -> f64 {
        self.scheduled
            .get(session_id)
            .map(|s| s.since.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    pub fn is_scheduled(&self, session_id: &SessionId) -> bool {
        self.scheduled.contains_key(session_id)
    }

    pub fn stop(&self) {
        self.scheduled.retain(|_, scheduled| {
            scheduled.task.abort();
            false
        });
    }
}

impl SessionWeigher for DeadSessionMonitor {
    fn weight(&self, session_id: &SessionId) -> f64 {
        DeadSessionMonitor::weight(self, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    const LIMIT: Duration = Duration::from_secs(60);

    fn monitor() -> (Arc<DeadSessionMonitor>, mpsc::UnboundedReceiver<SessionId>) {
        let (monitor, rx) = DeadSessionMonitor::new();
        monitor.on_configuration_change(LIMIT);
        (monitor, rx)
    }

    #[tokio::test]
    async fn test_send_before_configuration_fails() {
        let (monitor, _rx) = DeadSessionMonitor::new();
        let result = monitor.message_sent(&SessionId::from("s"));
        assert!(matches!(result, Err(CoreError::ConfigurationNotYetAvailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_session_is_reported_dead() {
        let (monitor, mut rx) = monitor();
        monitor.message_sent(&SessionId::from("s")).unwrap();

        tokio::time::sleep(LIMIT - Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv(), Ok(SessionId::from("s")));
        assert!(!monitor.is_scheduled(&SessionId::from("s")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_cancels_deletion() {
        let (monitor, mut rx) = monitor();
        let id = SessionId::from("s");
        monitor.message_sent(&id).unwrap();
        tokio::time::sleep(LIMIT / 2).await;
        monitor.ack_received(&id);

        tokio::time::sleep(LIMIT * 2).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_sends_keep_first_deadline() {
        let (monitor, mut rx) = monitor();
        let id = SessionId::from("s");
        monitor.message_sent(&id).unwrap();
        tokio::time::sleep(LIMIT / 2).await;
        monitor.message_sent(&id).unwrap();

        tokio::time::sleep(LIMIT / 2 + Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Ok(id));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_weight_grows_while_waiting_for_ack() {
        let (monitor, _rx) = monitor();
        let id = SessionId::from("s");
        assert_eq!(monitor.weight(&id), 0.0);

        monitor.message_sent(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((monitor.weight(&id) - 5_000.0).abs() < 1.0);

        monitor.session_removed(&id);
        assert_eq!(monitor.weight(&id), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_receiver_dropped() {
        let (monitor, rx) = monitor();
        let id = SessionId::from("s");
        monitor.message_sent(&id).unwrap();
        drop(rx);

        tokio::time::sleep(LIMIT + Duration::from_secs(1)).await;
        assert!(!monitor.is_scheduled(&id));
    }
}
