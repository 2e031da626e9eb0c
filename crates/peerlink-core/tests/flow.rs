//! End-to-end handshake flow between two nodes.

use peerlink_core::harness::{authenticated_message, run_handshake, TestNetwork};
use peerlink_core::session::OutboundSessionState;

#[tokio::test]
async fn test_handshake_flow() {
    let network = TestNetwork::new("group");
    let alice = network.node("O=Alice");
    let bob = network.node("O=Bob");

    let state = alice
        .manager
        .process_outbound_message(authenticated_message(&alice.identity, &bob.identity, "m1", b"hello"))
        .await
        .expect("outbound message");
    let OutboundSessionState::NewSessionsNeeded { messages, .. } = state else {
        panic!("expected a new negotiation");
    };

    run_handshake(&alice, &bob, &messages[0].1)
        .await
        .expect("handshake flow should succeed");
}
