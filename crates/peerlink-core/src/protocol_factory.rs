//! Creation of handshake protocol objects.

use peerlink_crypto::protocol::{InitiatorProtocol, ProtocolMode, ResponderProtocol};

use crate::types::SessionId;

/// Builds the per-session protocol objects driven by the session manager.
pub trait ProtocolFactory: Send + Sync {
    fn create_initiator(
        &self,
        session_id: &SessionId,
        supported_modes: Vec<ProtocolMode>,
        our_max_message_size: u32,
        our_public_key: &[u8],
        group_id: &str,
    ) -> InitiatorProtocol;

    fn create_responder(&self, session_id: &SessionId, our_max_message_size: u32) -> ResponderProtocol;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProtocolFactory;

impl ProtocolFactory for DefaultProtocolFactory {
    fn create_initiator(
        &self,
        session_id: &SessionId,
        supported_modes: Vec<ProtocolMode>,
        our_max_message_size: u32,
        our_public_key: &[u8],
        group_id: &str,
    ) -> InitiatorProtocol {
        InitiatorProtocol::new(
            session_id.as_str(),
            supported_modes,
            our_max_message_size,
            our_public_key,
            group_id,
        )
    }

    fn create_responder(&self, session_id: &SessionId, our_max_message_size: u32) -> ResponderProtocol {
        ResponderProtocol::new(session_id.as_str(), our_max_message_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::protocol::Step;

    #[test]
    fn test_created_protocols_start_fresh() {
        let factory = DefaultProtocolFactory;
        let id = SessionId::from("s1");

        let initiator = factory.create_initiator(&id, vec![ProtocolMode::AuthenticationOnly], 1_000, &[3u8; 32], "group");
        assert_eq!(initiator.session_id(), "s1");
        assert_eq!(initiator.step(), Step::Init);

        let responder = factory.create_responder(&id, 1_000);
        assert_eq!(responder.session_id(), "s1");
        assert_eq!(responder.step(), Step::Init);
    }
}
