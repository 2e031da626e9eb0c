//! Application messages and their link-out records.
//!
//! An [`AuthenticatedMessage`] is what the application hands to the session
//! manager. Once a session exists it is protected according to the session's
//! mode and wrapped in a [`LinkOutMessageV1`] addressed to the peer:
//! - `AuthenticationOnly`: payload in the clear plus an HMAC tag
//! - `AuthenticatedEncryption`: payload sealed with the session key
//!
//! In both cases the encoded common header is bound into the tag.

use prost::Message;

use peerlink_crypto::protocol::ProtocolMode;
use peerlink_crypto::session::Session;
use peerlink_proto::v1::{
    link_out_message_v1, AuthenticatedDataMessageV1, AuthenticatedEncryptedDataMessageV1,
    AuthenticatedMessageHeaderV1, AuthenticatedMessageV1, CommonHeaderV1, LinkOutHeaderV1, LinkOutMessageV1,
    SessionMessageV1,
};
use peerlink_proto::validation::Validate;

use crate::errors::CoreError;
use crate::types::{HoldingIdentity, NetworkType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedMessageHeader {
    pub destination: HoldingIdentity,
    pub source: HoldingIdentity,
    pub message_id: String,
    pub subsystem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedMessage {
    pub header: AuthenticatedMessageHeader,
    pub payload: Vec<u8>,
}

impl AuthenticatedMessage {
    pub fn to_proto(&self) -> AuthenticatedMessageV1 {
        AuthenticatedMessageV1 {
            header: Some(AuthenticatedMessageHeaderV1 {
                destination: Some(self.header.destination.to_proto()),
                source: Some(self.header.source.to_proto()),
                message_id: self.header.message_id.clone(),
                subsystem: self.header.subsystem.clone(),
            }),
            payload: self.payload.clone(),
        }
    }

    pub fn from_proto(proto: &AuthenticatedMessageV1) -> Result<Self, CoreError> {
        let missing = |field: &str| CoreError::ProtocolViolation(format!("authenticated message has no {}", field));
        let header = proto.header.as_ref().ok_or_else(|| missing("header"))?;
        Ok(Self {
            header: AuthenticatedMessageHeader {
                destination: HoldingIdentity::from_proto(header.destination.as_ref().ok_or_else(|| missing("destination"))?),
                source: HoldingIdentity::from_proto(header.source.as_ref().ok_or_else(|| missing("source"))?),
                message_id: header.message_id.clone(),
                subsystem: header.subsystem.clone(),
            },
            payload: proto.payload.clone(),
        })
    }
}

/// A decoded data message received on an established session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub session_id: String,
    pub message: AuthenticatedMessage,
}

fn link_out(
    source: &HoldingIdentity,
    destination: &HoldingIdentity,
    network_type: NetworkType,
    payload: link_out_message_v1::Payload,
) -> LinkOutMessageV1 {
    LinkOutMessageV1 {
        header: Some(LinkOutHeaderV1 {
            destination: Some(destination.to_proto()),
            source: Some(source.to_proto()),
            network_type: network_type.to_proto() as i32,
        }),
        payload: Some(payload),
    }
}

/// Address a handshake message to the peer.
pub fn link_out_from_session_message(
    message: SessionMessageV1,
    source: &HoldingIdentity,
    destination: &HoldingIdentity,
    network_type: NetworkType,
) -> LinkOutMessageV1 {
    link_out(source, destination, network_type, message.into())
}

/// Protect `message` with `session` and address it to its destination.
///
/// Messages whose encoding exceeds the session's negotiated maximum are
/// rejected.
pub fn link_out_from_authenticated_message(
    message: &AuthenticatedMessage,
    session: &Session,
    network_type: NetworkType,
    now_millis: u64,
) -> Result<LinkOutMessageV1, CoreError> {
    let encoded = message.to_proto().encode_to_vec();
    if encoded.len() > session.max_message_size() as usize {
        return Err(CoreError::ProtocolViolation(format!(
            "message {} is {} bytes, session {} allows {}",
            message.header.message_id,
            encoded.len(),
            session.session_id(),
            session.max_message_size()
        )));
    }

    let header = CommonHeaderV1 {
        session_id: session.session_id().to_string(),
        sequence_no: session.next_sequence_no(),
        timestamp_millis: now_millis,
    };
    let header_bytes = header.encode_to_vec();

    let payload: link_out_message_v1::Payload = match session.mode() {
        ProtocolMode::AuthenticationOnly => {
            let tag = session.create_mac(&header_bytes, &encoded)?;
            AuthenticatedDataMessageV1 { header: Some(header), payload: encoded, auth_tag: tag.to_vec() }.into()
        }
        ProtocolMode::AuthenticatedEncryption => {
            let encrypted_payload = session.encrypt(&header_bytes, &encoded)?;
            AuthenticatedEncryptedDataMessageV1 { header: Some(header), encrypted_payload }.into()
        }
    };

    Ok(link_out(
        &message.header.source,
        &message.header.destination,
        network_type,
        payload,
    ))
}

/// Check and open a data record received on `session`.
pub fn open_data_message(
    payload: &link_out_message_v1::Payload,
    session: &Session,
) -> Result<AuthenticatedMessage, CoreError> {
    let plaintext = match payload {
        link_out_message_v1::Payload::AuthenticatedData(msg) => {
            msg.validate()?;
            let header_bytes = msg.header.as_ref().map(|h| h.encode_to_vec()).unwrap_or_default();
            session.validate_mac(&header_bytes, &msg.payload, &msg.auth_tag)?;
            msg.payload.clone()
        }
        link_out_message_v1::Payload::AuthenticatedEncryptedData(msg) => {
            msg.validate()?;
            let header_bytes = msg.header.as_ref().map(|h| h.encode_to_vec()).unwrap_or_default();
            session.decrypt(&header_bytes, &msg.encrypted_payload)?
        }
        link_out_message_v1::Payload::SessionMessage(msg) => {
            return Err(CoreError::ProtocolViolation(format!(
                "expected a data message, got {}",
                msg.kind()
            )));
        }
    };

    if plaintext.len() > session.max_message_size() as usize {
        return Err(CoreError::ProtocolViolation(format!(
            "received {} bytes on session {}, limit is {}",
            plaintext.len(),
            session.session_id(),
            session.max_message_size()
        )));
    }
    let proto = AuthenticatedMessageV1::decode(plaintext.as_slice())
        .map_err(|e| CoreError::ProtocolViolation(format!("undecodable authenticated message: {}", e)))?;
    AuthenticatedMessage::from_proto(&proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::session::SessionKeys;

    fn sessions(mode: ProtocolMode, max_message_size: u32) -> (Session, Session) {
        let ours = SessionKeys {
            session_id: "s1".into(),
            mode,
            outbound_key: [1u8; 32],
            inbound_key: [2u8; 32],
            max_message_size,
        };
        let mut theirs = ours.clone();
        theirs.outbound_key = [2u8; 32];
        theirs.inbound_key = [1u8; 32];
        (Session::from_keys(&ours), Session::from_keys(&theirs))
    }

    fn message(payload: Vec<u8>) -> AuthenticatedMessage {
        AuthenticatedMessage {
            header: AuthenticatedMessageHeader {
                destination: HoldingIdentity::new("O=Bob", "group"),
                source: HoldingIdentity::new("O=Alice", "group"),
                message_id: "m1".into(),
                subsystem: "flow".into(),
            },
            payload,
        }
    }

    #[test]
    fn test_encrypted_message_opens_on_peer() {
        let (ours, theirs) = sessions(ProtocolMode::AuthenticatedEncryption, 10_000);
        let record = link_out_from_authenticated_message(&message(b"hello".to_vec()), &ours, NetworkType::Standard, 5).unwrap();

        let header = record.header.as_ref().unwrap();
        assert_eq!(header.destination.as_ref().unwrap().x500_name, "O=Bob");
        assert_eq!(record.session_id(), Some("s1"));

        let opened = open_data_message(record.payload.as_ref().unwrap(), &theirs).unwrap();
        assert_eq!(opened, message(b"hello".to_vec()));
    }

    #[test]
    fn test_mac_only_message_keeps_payload_visible() {
        let (ours, theirs) = sessions(ProtocolMode::AuthenticationOnly, 10_000);
        let record = link_out_from_authenticated_message(&message(b"visible".to_vec()), &ours, NetworkType::Standard, 5).unwrap();

        let Some(link_out_message_v1::Payload::AuthenticatedData(mut data)) = record.payload else {
            panic!("expected authenticated data");
        };
        assert!(open_data_message(&data.clone().into(), &theirs).is_ok());

        let last = data.payload.len() - 1;
        data.payload[last] ^= 1;
        assert!(open_data_message(&data.into(), &theirs).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (ours, _) = sessions(ProtocolMode::AuthenticatedEncryption, 300);
        let result = link_out_from_authenticated_message(&message(vec![0u8; 400]), &ours, NetworkType::Standard, 0);
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn test_session_message_is_not_data() {
        let (ours, _) = sessions(ProtocolMode::AuthenticatedEncryption, 10_000);
        let payload: link_out_message_v1::Payload = SessionMessageV1::default().into();
        assert!(open_data_message(&payload, &ours).is_err());
    }

    #[test]
    fn test_sequence_numbers_advance() {
        let (ours, _) = sessions(ProtocolMode::AuthenticatedEncryption, 10_000);
        let seq = |record: LinkOutMessageV1| match record.payload {
            Some(link_out_message_v1::Payload::AuthenticatedEncryptedData(m)) => m.header.unwrap().sequence_no,
            _ => panic!("expected encrypted data"),
        };
        let first = seq(link_out_from_authenticated_message(&message(vec![1]), &ours, NetworkType::Standard, 0).unwrap());
        let second = seq(link_out_from_authenticated_message(&message(vec![1]), &ours, NetworkType::Standard, 0).unwrap());
        assert!(second > first);
    }
}
