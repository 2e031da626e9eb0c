
#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use prost::Message;
    use crate::v1::{
        CommonHeaderV1, InitiatorHelloIdentityV1, InitiatorHelloV1, LinkOutMessageV1,
        SessionMessageV1, SessionStateBlobV1,
    };
    use crate::validation::Validate;

    prop_compose! {
        fn any_initiator_hello()(
            session_id in "[0-9a-f]{1,64}",
            seq in any::<u64>(),
            key in proptest::collection::vec(any::<u8>(), 0..48),
            modes in proptest::collection::vec(0..3i32, 0..3),
            hash in proptest::collection::vec(any::<u8>(), 0..40),
            group in "[a-z]{0,12}",
        ) -> InitiatorHelloV1 {
            InitiatorHelloV1 {
                header: Some(CommonHeaderV1 { session_id, sequence_no: seq, timestamp_millis: 0 }),
                initiator_ephemeral_key: key,
                supported_modes: modes,
                source: Some(InitiatorHelloIdentityV1 {
                    initiator_public_key_hash: hash,
                    group_id: group,
                }),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            if let Ok(msg) = SessionMessageV1::decode(data.as_slice()) {
                let _ = msg.validate();
                let _ = msg.session_id();
            }
            let _ = LinkOutMessageV1::decode(data.as_slice());
            let _ = SessionStateBlobV1::decode(data.as_slice());
        }

        #[test]
        fn prop_hello_survives_session_message_wrapping(hello in any_initiator_hello()) {
            let expected_id = hello.header.as_ref().map(|h| h.session_id.clone());
            let wrapped: SessionMessageV1 = hello.clone().into();
            let decoded = SessionMessageV1::decode(wrapped.encode_to_vec().as_slice()).unwrap();

            prop_assert_eq!(decoded.session_id().map(str::to_string), expected_id);
            prop_assert_eq!(decoded, wrapped);
        }

        #[test]
        fn prop_validation_matches_key_size(hello in any_initiator_hello()) {
            let key_ok = hello.initiator_ephemeral_key.len() == 32;
            if !key_ok {
                prop_assert!(hello.validate().is_err());
            }
        }
    }
}
