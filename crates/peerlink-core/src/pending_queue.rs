//! Messages waiting for a session.
//!
//! Application messages towards a peer are held here, per counterparties
//! key, until a session with that peer is established. The queue for a key
//! is taken out in one step, so every message is released exactly once and
//! in the order it was queued. Messages that fail to publish go back to the
//! front of their queue.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use peerlink_crypto::session::Session;

use crate::clock::Clock;
use crate::dead_session::DeadSessionMonitor;
use crate::messages::{link_out_from_authenticated_message, AuthenticatedMessage};
use crate::publisher::Publisher;
use crate::types::{CounterpartiesKey, NetworkType, SessionId};

pub struct PendingSessionMessageQueues {
    queues: DashMap<CounterpartiesKey, VecDeque<AuthenticatedMessage>>,
    publisher: Arc<dyn Publisher>,
    dead_sessions: Arc<DeadSessionMonitor>,
    clock: Arc<dyn Clock>,
}

impl PendingSessionMessageQueues {
    pub fn new(publisher: Arc<dyn Publisher>, dead_sessions: Arc<DeadSessionMonitor>, clock: Arc<dyn Clock>) -> Self {
        Self { queues: DashMap::new(), publisher, dead_sessions, clock }
    }

    pub fn queue_message(&self, counterparties: &CounterpartiesKey, message: AuthenticatedMessage) {
        self.queues.entry(counterparties.clone()).or_default().push_back(message);
    }

    /// Release everything queued for `counterparties` on `session`.
    ///
    /// # Returns
    /// The number of messages published.
    pub async fn session_negotiated(
        &self,
        counterparties: &CounterpartiesKey,
        session: &Session,
        network_type: NetworkType,
    ) -> usize {
        let Some((_, queued)) = self.queues.remove(counterparties) else {
            return 0;
        };

        let now = self.clock.now_millis();
        let mut released = Vec::with_capacity(queued.len());
        let mut records = Vec::with_capacity(queued.len());
        for message in queued {
            match link_out_from_authenticated_message(&message, session, network_type, now) {
                Ok(record) => {
                    records.push(record);
                    released.push(message);
                }
                Err(e) => warn!(
                    message_id = %message.header.message_id,
                    error = %e,
                    "Dropping queued message"
                ),
            }
        }
        if records.is_empty() {
            return 0;
        }

        let count = records.len();
        if let Err(e) = self.publisher.publish(records).await {
            warn!(%counterparties, error = %e, count, "Failed to publish queued messages, keeping them queued");
            let mut queue = self.queues.entry(counterparties.clone()).or_default();
            for message in released.into_iter().rev() {
                queue.push_front(message);
            }
            return 0;
        }
        debug!(%counterparties, count, session_id = session.session_id(), "Released queued messages");

        let session_id = SessionId::from(session.session_id());
        for _ in 0..count {
            if let Err(e) = self.dead_sessions.message_sent(&session_id) {
                warn!(session_id = %session_id, error = %e, "Cannot track released message");
            }
        }
        count
    }

    pub fn queued_len(&self, counterparties: &CounterpartiesKey) -> usize {
        self.queues.get(counterparties).map_or(0, |q| q.len())
    }

    pub fn destroy_queue(&self, counterparties: &CounterpartiesKey) {
        self.queues.remove(counterparties);
    }

    pub fn destroy_all_queues(&self) {
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::ManualClock;
    use crate::messages::{open_data_message, AuthenticatedMessageHeader};
    use crate::publisher::{PublishError, RecordingPublisher};
    use crate::types::HoldingIdentity;
    use async_trait::async_trait;
    use peerlink_proto::v1::LinkOutMessageV1;
    use std::sync::atomic::{AtomicBool, Ordering};
    use peerlink_crypto::protocol::ProtocolMode;
    use peerlink_crypto::session::SessionKeys;
    use std::time::Duration;

    fn key() -> CounterpartiesKey {
        CounterpartiesKey::new(HoldingIdentity::new("O=Alice", "g"), HoldingIdentity::new("O=Bob", "g"), 1)
    }

    fn message(id: &str) -> AuthenticatedMessage {
        AuthenticatedMessage {
            header: AuthenticatedMessageHeader {
                destination: HoldingIdentity::new("O=Bob", "g"),
                source: HoldingIdentity::new("O=Alice", "g"),
                message_id: id.into(),
                subsystem: "test".into(),
            },
            payload: id.as_bytes().to_vec(),
        }
    }

    fn sessions() -> (Session, Session) {
        let keys = SessionKeys {
            session_id: "s".into(),
            mode: ProtocolMode::AuthenticatedEncryption,
            outbound_key: [1u8; 32],
            inbound_key: [2u8; 32],
            max_message_size: 1_000,
        };
        let mut peer = keys.clone();
        peer.outbound_key = [2u8; 32];
        peer.inbound_key = [1u8; 32];
        (Session::from_keys(&keys), Session::from_keys(&peer))
    }

    /// Fails every publish while `down` is set.
    #[derive(Default)]
    struct FlakyPublisher {
        down: AtomicBool,
        inner: RecordingPublisher,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(&self, records: Vec<LinkOutMessageV1>) -> Result<(), PublishError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(PublishError("bus unavailable".into()));
            }
            self.inner.publish(records).await
        }
    }

    fn queues() -> (PendingSessionMessageQueues, RecordingPublisher, Arc<DeadSessionMonitor>) {
        let publisher = RecordingPublisher::new();
        let (monitor, _rx) = DeadSessionMonitor::new();
        monitor.on_configuration_change(Duration::from_secs(60));
        let queues = PendingSessionMessageQueues::new(
            Arc::new(publisher.clone()),
            monitor.clone(),
            Arc::new(ManualClock::new(0)),
        );
        (queues, publisher, monitor)
    }

    #[tokio::test]
    async fn test_release_is_fifo_and_exactly_once() {
        let (queues, publisher, monitor) = queues();
        for id in ["m1", "m2", "m3"] {
            queues.queue_message(&key(), message(id));
        }
        let (ours, theirs) = sessions();

        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 3);
        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 0);

        let released: Vec<String> = publisher
            .records()
            .iter()
            .map(|r| open_data_message(r.payload.as_ref().unwrap(), &theirs).unwrap().header.message_id)
            .collect();
        assert_eq!(released, vec!["m1", "m2", "m3"]);
        assert!(monitor.is_scheduled(&SessionId::from("s")));
        assert_eq!(queues.queued_len(&key()), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped_alone() {
        let (queues, publisher, _) = queues();
        queues.queue_message(&key(), message("small"));
        let mut big = message("big");
        big.payload = vec![0u8; 5_000];
        queues.queue_message(&key(), big);

        let (ours, _) = sessions();
        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 1);
        assert_eq!(publisher.len(), 1);
    }

    #[tokio::test]
    async fn test_destroyed_queues_release_nothing() {
        let (queues, publisher, _) = queues();
        queues.queue_message(&key(), message("m1"));
        queues.destroy_queue(&key());
        queues.queue_message(&key(), message("m2"));
        queues.destroy_all_queues();

        let (ours, _) = sessions();
        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 0);
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_messages_queued() {
        let publisher = Arc::new(FlakyPublisher::default());
        publisher.down.store(true, Ordering::SeqCst);
        let (monitor, _rx) = DeadSessionMonitor::new();
        monitor.on_configuration_change(Duration::from_secs(60));
        let queues = PendingSessionMessageQueues::new(publisher.clone(), monitor.clone(), Arc::new(ManualClock::new(0)));
        queues.queue_message(&key(), message("m1"));
        queues.queue_message(&key(), message("m2"));
        let (ours, theirs) = sessions();

        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 0);
        assert_eq!(queues.queued_len(&key()), 2);
        assert!(!monitor.is_scheduled(&SessionId::from("s")));

        queues.queue_message(&key(), message("m3"));
        publisher.down.store(false, Ordering::SeqCst);
        assert_eq!(queues.session_negotiated(&key(), &ours, NetworkType::Standard).await, 3);

        let released: Vec<String> = publisher
            .inner
            .records()
            .iter()
            .map(|r| open_data_message(r.payload.as_ref().unwrap(), &theirs).unwrap().header.message_id)
            .collect();
        assert_eq!(released, vec!["m1", "m2", "m3"]);
        assert_eq!(queues.queued_len(&key()), 0);
    }
}
