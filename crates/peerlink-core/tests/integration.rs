//! Integration tests for peerlink core.
//!
//! These tests drive complete session lifecycles between in-memory nodes:
//! - Queued messages released exactly once after a handshake
//! - Weighted selection between several sessions towards one peer
//! - Liveness tracking with hot-reloaded configuration
//! - Persistence of session state across a restart

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use tracing_subscriber::EnvFilter;

use peerlink_core::{
    config::SessionManagerConfig,
    crypto_client::LocalKeyWrapper,
    harness::{authenticated_message, run_handshake, session_message, TestNetwork, TestNode},
    session::OutboundSessionState,
    state::{SessionState, StateConvertor},
    store::SessionStatus,
    types::{CounterpartiesKey, HoldingIdentity, SessionId},
};
use peerlink_crypto::protocol::{ProtocolMode, Role};
use peerlink_crypto::session::SessionKeys;
use peerlink_crypto::wrapping::WrappingKey;
use peerlink_proto::v1::LinkOutMessageV1;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn send(from: &TestNode, to: &TestNode, message_id: &str) -> OutboundSessionState {
    let message = authenticated_message(&from.identity, &to.identity, message_id, message_id.as_bytes());
    assert_ok!(from.manager.process_outbound_message(message).await)
}

fn hellos(state: &OutboundSessionState) -> Vec<LinkOutMessageV1> {
    match state {
        OutboundSessionState::NewSessionsNeeded { messages, .. } => {
            messages.iter().map(|(_, record)| record.clone()).collect()
        }
        other => panic!("expected new negotiations, got {:?}", other),
    }
}

/// Test: A message sent before any session exists reaches the peer once
#[tokio::test]
async fn integration_queued_message_released_once() {
    init_tracing();
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let first = send(&alice, &bob, "M1").await;
    let hello = hellos(&first).remove(0);
    let session_id = hello.session_id().map(SessionId::from).expect("hello carries a session id");
    assert!(alice.publisher.is_empty());

    let established = run_handshake(&alice, &bob, &hello)
        .await
        .expect("handshake should succeed");
    assert_eq!(established.session_id, session_id);
    assert_eq!(established.released, 1);

    let published = alice.publisher.take();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].session_id(), Some(session_id.as_str()));
    let received = bob
        .manager
        .process_inbound_data_message(&published[0])
        .await
        .expect("bob opens M1");
    assert_eq!(received.message.message.header.message_id, "M1");
    assert_eq!(received.message.session_id, session_id.as_str());

    // Later messages go straight out on the session.
    let OutboundSessionState::SessionEstablished { session, record } = send(&alice, &bob, "M2").await else {
        panic!("expected the established session");
    };
    assert_eq!(session.session_id(), session_id.as_str());
    let received = bob
        .manager
        .process_inbound_data_message(&record)
        .await
        .expect("bob opens M2");
    assert_eq!(received.message.message.payload, b"M2".to_vec());
    assert!(alice.publisher.is_empty());

    let stats = alice.manager.stats();
    assert_eq!(stats.messages_queued, 1);
    assert_eq!(stats.messages_released, 1);
}

/// Test: Messages queued behind several pending negotiations keep their order
#[tokio::test]
async fn integration_queue_drains_in_order() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let hello = hellos(&send(&alice, &bob, "m0").await).remove(0);
    for i in 1..5 {
        let state = send(&alice, &bob, &format!("m{}", i)).await;
        assert!(matches!(state, OutboundSessionState::SessionAlreadyPending { .. }));
    }

    run_handshake(&alice, &bob, &hello)
        .await
        .expect("handshake should succeed");
    let mut ids = Vec::new();
    for record in alice.publisher.take() {
        let received = bob
            .manager
            .process_inbound_data_message(&record)
            .await
            .expect("bob opens queued message");
        ids.push(received.message.message.header.message_id);
    }
    assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
}

/// Test: Both directions can hold sessions between the same pair
#[tokio::test]
async fn integration_sessions_in_both_directions() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let to_bob = hellos(&send(&alice, &bob, "a1").await).remove(0);
    let to_alice = hellos(&send(&bob, &alice, "b1").await).remove(0);
    let outbound = run_handshake(&alice, &bob, &to_bob).await.expect("alice to bob");
    let inbound = run_handshake(&bob, &alice, &to_alice).await.expect("bob to alice");
    assert_ne!(outbound.session_id, inbound.session_id);

    let from_bob = bob.publisher.take().remove(0);
    let received = alice
        .manager
        .process_inbound_data_message(&from_bob)
        .await
        .expect("alice opens b1");
    assert_eq!(received.counterparties.counterparty_id, bob.identity);
    assert_eq!(alice.manager.cache().len(), 2);
}

/// Test: Sends spread evenly over healthy sessions and avoid a lagging one
#[tokio::test(start_paused = true)]
async fn integration_weighted_session_selection() {
    let network = TestNetwork::new("group");
    let mut config = SessionManagerConfig::default();
    config.sessions_per_peer_for_members = 2;
    let alice = network.node_with_config("O=Alice", config);
    let bob = network.node("O=Bob");

    let negotiations = hellos(&send(&alice, &bob, "m0").await);
    assert_eq!(negotiations.len(), 2);
    let mut session_ids = Vec::new();
    for hello in &negotiations {
        let established = run_handshake(&alice, &bob, hello).await.expect("handshake");
        session_ids.push(established.session_id);
    }

    // No time passes, so every weight stays zero.
    let mut picks: HashMap<String, usize> = HashMap::new();
    for i in 0..200 {
        if let OutboundSessionState::SessionEstablished { session, .. } = send(&alice, &bob, &format!("u{}", i)).await {
            *picks.entry(session.session_id().to_string()).or_default() += 1;
        }
    }
    assert_eq!(picks.len(), 2, "both sessions should be used: {:?}", picks);

    // Ten seconds without an ack on the second session makes it heavy.
    tokio::time::sleep(Duration::from_secs(10)).await;
    alice.manager.process_ack(&session_ids[0]);
    let mut healthy = 0;
    for i in 0..100 {
        if let OutboundSessionState::SessionEstablished { session, .. } = send(&alice, &bob, &format!("w{}", i)).await {
            if session.session_id() == session_ids[0].as_str() {
                healthy += 1;
            }
        }
    }
    assert!(healthy >= 95, "healthy session picked {} times", healthy);
}

/// Test: A reloaded inactivity limit applies to new sends
#[tokio::test(start_paused = true)]
async fn integration_inactivity_limit_reload() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");
    alice.manager.start();

    let mut config = SessionManagerConfig::default();
    config.session_inactivity_limit_secs = 10;
    alice.config.update(config).expect("valid configuration");
    tokio::time::sleep(Duration::from_millis(1)).await;

    let hello = hellos(&send(&alice, &bob, "m1").await).remove(0);
    let established = run_handshake(&alice, &bob, &hello).await.expect("handshake");

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(alice.manager.stats().dead_sessions, 1);
    assert!(alice.manager.pool().get_session(&established.session_id).is_none());
    alice.manager.stop();
}

/// Test: Negotiations and sessions are persisted under their session id
#[tokio::test]
async fn integration_state_is_persisted_and_scheduled() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let hello = hellos(&send(&alice, &bob, "m1").await).remove(0);
    let session_id = hello.session_id().expect("session id").to_string();
    assert!(alice.store.contains(&session_id).await);
    assert!(alice.manager.scheduler().is_scheduled(&session_id));

    run_handshake(&alice, &bob, &hello).await.expect("handshake");
    assert!(bob.store.contains(&session_id).await);
    assert!(bob.manager.scheduler().is_scheduled(&session_id));
    assert_eq!(bob.manager.pending_inbound_len(), 0);

    // A restarted responder serves the session from its store.
    let record = alice.publisher.take().remove(0);
    bob.manager.stop();
    let bob = bob.restart();
    assert!(bob.manager.process_inbound_data_message(&record).await.is_some());
}

/// Test: Handshake messages for unknown sessions never establish anything
#[tokio::test]
async fn integration_replayed_handshake_is_discarded() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");
    let carol = network.node("O=Carol");

    let hello = hellos(&send(&alice, &bob, "m1").await).remove(0);
    let reply = bob
        .manager
        .process_session_message(&session_message(&hello).expect("hello"))
        .await
        .reply
        .expect("responder hello");

    // Carol never started this negotiation.
    let outcome = carol
        .manager
        .process_session_message(&session_message(&reply).expect("reply"))
        .await;
    assert!(outcome.is_empty());
    assert_eq!(carol.manager.stats().lookup_failures, 1);
}

/// Test: Session state survives conversion with secrets wrapped
#[tokio::test]
async fn integration_state_convertor_round_trip() {
    let wrapper = Arc::new(LocalKeyWrapper::new(WrappingKey::from_bytes([3u8; 32])));
    let convertor = StateConvertor::new(wrapper.clone());
    let state = SessionState {
        role: Role::Initiator,
        status: SessionStatus::SessionReady,
        session_id: SessionId::from("s1"),
        counterparties: Some(CounterpartiesKey::new(
            HoldingIdentity::new("O=Alice", "group"),
            HoldingIdentity::new("O=Bob", "group"),
            4,
        )),
        protocol: None,
        session_keys: Some(SessionKeys {
            session_id: "s1".into(),
            mode: ProtocolMode::AuthenticationOnly,
            outbound_key: [7u8; 32],
            inbound_key: [8u8; 32],
            max_message_size: 2_000,
        }),
        last_message: None,
    };

    let bytes = assert_ok!(convertor.to_bytes(&state).await);
    assert!(!bytes.windows(32).any(|w| w == [7u8; 32]));
    let decoded = assert_ok!(StateConvertor::new(wrapper).from_bytes(&bytes).await);
    assert_eq!(decoded, state);

    let other = StateConvertor::new(Arc::new(LocalKeyWrapper::new(WrappingKey::from_bytes([4u8; 32]))));
    assert!(other.from_bytes(&bytes).await.is_err());
}

/// Test: Concurrent first sends to a peer start a single negotiation
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_first_sends_share_one_negotiation() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let mut senders = Vec::new();
    for i in 0..20 {
        let manager = alice.manager.clone();
        let message = authenticated_message(&alice.identity, &bob.identity, &format!("m{}", i), b"first");
        senders.push(tokio::spawn(async move { manager.process_outbound_message(message).await }));
    }
    let mut hello = Vec::new();
    for sender in senders {
        match sender.await.expect("send task").expect("send") {
            OutboundSessionState::NewSessionsNeeded { messages, .. } => {
                hello.extend(messages.into_iter().map(|(_, record)| record))
            }
            OutboundSessionState::SessionAlreadyPending { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(hello.len(), 1);
    assert_eq!(alice.manager.pool().len(), 1);
    assert_eq!(alice.store.len().await, 1);

    let established = run_handshake(&alice, &bob, &hello[0]).await.expect("handshake");
    assert_eq!(established.released, 20);
}

/// Test: Sends racing the end of a handshake are each delivered once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_sends_racing_handshake_completion() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let hello = hellos(&send(&alice, &bob, "m0").await).remove(0);
    let responder_hello = bob
        .manager
        .process_session_message(&session_message(&hello).expect("hello"))
        .await
        .reply
        .expect("responder hello");
    let initiator_handshake = alice
        .manager
        .process_session_message(&session_message(&responder_hello).expect("responder hello"))
        .await
        .reply
        .expect("initiator handshake");
    let responder_handshake = bob
        .manager
        .process_session_message(&session_message(&initiator_handshake).expect("initiator handshake"))
        .await
        .reply
        .expect("responder handshake");

    let mut senders = Vec::new();
    for i in 1..=40 {
        let manager = alice.manager.clone();
        let message = authenticated_message(&alice.identity, &bob.identity, &format!("m{}", i), b"race");
        senders.push(tokio::spawn(async move { manager.process_outbound_message(message).await }));
    }
    let established = alice
        .manager
        .process_session_message(&session_message(&responder_handshake).expect("responder handshake"))
        .await
        .established
        .expect("alice establishes the session");

    let mut direct = Vec::new();
    for sender in senders {
        match sender.await.expect("send task").expect("send") {
            OutboundSessionState::SessionEstablished { record, .. } => direct.push(record),
            OutboundSessionState::SessionAlreadyPending { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    let mut ids = Vec::new();
    for record in alice.publisher.take().into_iter().chain(direct) {
        let received = bob
            .manager
            .process_inbound_data_message(&record)
            .await
            .expect("bob opens the message");
        ids.push(received.message.message.header.message_id);
    }
    ids.sort();
    let mut expected: Vec<String> = (0..=40).map(|i| format!("m{}", i)).collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(alice.manager.pending_messages().queued_len(&established.counterparties), 0);
}
