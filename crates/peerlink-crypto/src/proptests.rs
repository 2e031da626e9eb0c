
#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::certificate::{validate_chain, SessionCertificate};
    use crate::protocol::{InitiatorProtocol, ProtocolMode, ResponderProtocol};
    use crate::session::Session;
    use crate::signature::{verify_signature, SignatureSpec};
    use crate::transcript::Transcript;
    use crate::wrapping::WrappingKey;
    use ed25519_dalek::{Signer, SigningKey};

    proptest! {
        #[test]
        fn test_transcript_determinism(
            tag1 in any::<u32>(),
            data1 in any::<Vec<u8>>(),
            tag2 in any::<u32>(),
            data2 in any::<Vec<u8>>()
        ) {
            let mut t1 = Transcript::new("test");
            t1.append_bytes(tag1, &data1);
            t1.append_bytes(tag2, &data2);

            let mut t2 = Transcript::new("test");
            t2.append_bytes(tag1, &data1);
            t2.append_bytes(tag2, &data2);

            prop_assert_eq!(t1.finalize(), t2.finalize());
        }

        #[test]
        fn test_signature_round_trip(seed in any::<[u8; 32]>(), message in any::<Vec<u8>>()) {
            let key = SigningKey::from_bytes(&seed);
            let sig = key.sign(&message).to_bytes();
            prop_assert!(verify_signature(key.verifying_key().as_bytes(), SignatureSpec::Ed25519, &message, &sig).is_ok());
        }

        #[test]
        fn test_certificate_encoding_is_stable(root_seed in any::<[u8; 32]>(), subject in any::<[u8; 32]>()) {
            let root = SigningKey::from_bytes(&root_seed);
            let cert = SessionCertificate::issue(&root, subject);
            let decoded = SessionCertificate::from_bytes(&cert.to_bytes()).unwrap();
            prop_assert_eq!(&decoded, &cert);
            prop_assert!(validate_chain(&[cert.to_bytes()], &subject, &[root.verifying_key().to_bytes()]).is_ok());
        }

        #[test]
        fn test_wrapped_secret_recovers(key in any::<[u8; 32]>(), secret in proptest::collection::vec(any::<u8>(), 0..128)) {
            let wrapping = WrappingKey::from_bytes(key);
            let wrapped = wrapping.wrap(&secret).unwrap();
            prop_assert_eq!(wrapping.unwrap(&wrapped).unwrap(), secret);
        }

        #[test]
        fn test_session_keys_are_mirrored(max_a in 256u32..100_000, max_b in 256u32..100_000) {
            let alice = SigningKey::from_bytes(&[1u8; 32]);
            let bob = SigningKey::from_bytes(&[2u8; 32]);
            let modes = vec![ProtocolMode::AuthenticationOnly];
            let mut initiator = InitiatorProtocol::new("p", modes.clone(), max_a, alice.verifying_key().as_bytes(), "g");
            let mut responder = ResponderProtocol::new("p", max_b);

            responder.receive_initiator_hello(&initiator.generate_initiator_hello().unwrap()).unwrap();
            let reply = responder.generate_responder_hello(&modes).unwrap();
            initiator.receive_responder_hello(&reply).unwrap();

            let bob_pub = bob.verifying_key().to_bytes();
            let alice_pub = alice.verifying_key().to_bytes();
            let sig = alice.sign(&initiator.handshake_signing_data(&bob_pub).unwrap()).to_bytes().to_vec();
            let msg = initiator.generate_our_handshake_message(&bob_pub, vec![], sig).unwrap();
            responder.validate_peer_handshake_message(&msg, &alice_pub, SignatureSpec::Ed25519).unwrap();
            let sig = bob.sign(&responder.handshake_signing_data(&bob_pub).unwrap()).to_bytes().to_vec();
            let reply = responder.generate_our_handshake_message(&bob_pub, vec![], sig).unwrap();
            initiator.validate_peer_handshake_message(&reply, &bob_pub, SignatureSpec::Ed25519).unwrap();

            let a: Session = initiator.get_session().unwrap();
            let b: Session = responder.get_session().unwrap();
            prop_assert_eq!(a.keys().outbound_key, b.keys().inbound_key);
            prop_assert_eq!(a.keys().inbound_key, b.keys().outbound_key);
            prop_assert_eq!(a.max_message_size(), max_a.min(max_b));

            let tag = a.create_mac(b"hdr", b"payload").unwrap();
            prop_assert!(b.validate_mac(b"hdr", b"payload", &tag).is_ok());
        }
    }
}
