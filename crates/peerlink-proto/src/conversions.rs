//! Conversion helpers between the v1 messages.
//!
//! This module provides:
//! - `From` impls wrapping handshake messages into `SessionMessageV1` and
//!   `SessionMessageV1` / data records into link-out payloads
//! - accessors for the session id carried by any session or data message

use crate::v1::*;

// ============================================================================
// Session message wrapping
// ============================================================================

impl From<InitiatorHelloV1> for SessionMessageV1 {
    fn from(msg: InitiatorHelloV1) -> Self {
        Self { payload: Some(session_message_v1::Payload::InitiatorHello(msg)) }
    }
}

impl From<ResponderHelloV1> for SessionMessageV1 {
    fn from(msg: ResponderHelloV1) -> Self {
        Self { payload: Some(session_message_v1::Payload::ResponderHello(msg)) }
    }
}

impl From<InitiatorHandshakeV1> for SessionMessageV1 {
    fn from(msg: InitiatorHandshakeV1) -> Self {
        Self { payload: Some(session_message_v1::Payload::InitiatorHandshake(msg)) }
    }
}

impl From<ResponderHandshakeV1> for SessionMessageV1 {
    fn from(msg: ResponderHandshakeV1) -> Self {
        Self { payload: Some(session_message_v1::Payload::ResponderHandshake(msg)) }
    }
}

impl From<Step2V1> for SessionMessageV1 {
    fn from(msg: Step2V1) -> Self {
        Self { payload: Some(session_message_v1::Payload::Step2(msg)) }
    }
}

impl From<SessionMessageV1> for link_out_message_v1::Payload {
    fn from(msg: SessionMessageV1) -> Self {
        Self::SessionMessage(msg)
    }
}

impl From<AuthenticatedDataMessageV1> for link_out_message_v1::Payload {
    fn from(msg: AuthenticatedDataMessageV1) -> Self {
        Self::AuthenticatedData(msg)
    }
}

impl From<AuthenticatedEncryptedDataMessageV1> for link_out_message_v1::Payload {
    fn from(msg: AuthenticatedEncryptedDataMessageV1) -> Self {
        Self::AuthenticatedEncryptedData(msg)
    }
}

// ============================================================================
// Accessors
// ============================================================================

fn header_session_id(header: &Option<CommonHeaderV1>) -> Option<&str> {
    header.as_ref().map(|h| h.session_id.as_str())
}

impl SessionMessageV1 {
    /// Session id carried by the wrapped handshake message.
    ///
    /// A `Step2V1` reports the session id of its initiator hello.
    pub fn session_id(&self) -> Option<&str> {
        use session_message_v1::Payload;
        match self.payload.as_ref()? {
            Payload::InitiatorHello(m) => header_session_id(&m.header),
            Payload::ResponderHello(m) => header_session_id(&m.header),
            Payload::InitiatorHandshake(m) => header_session_id(&m.header),
            Payload::ResponderHandshake(m) => header_session_id(&m.header),
            Payload::Step2(m) => m
                .initiator_hello
                .as_ref()
                .and_then(|h| header_session_id(&h.header)),
        }
    }

    /// Short name of the wrapped message, for logs.
    pub fn kind(&self) -> &'static str {
        use session_message_v1::Payload;
        match &self.payload {
            Some(Payload::InitiatorHello(_)) => "InitiatorHello",
            Some(Payload::ResponderHello(_)) => "ResponderHello",
            Some(Payload::InitiatorHandshake(_)) => "InitiatorHandshake",
            Some(Payload::ResponderHandshake(_)) => "ResponderHandshake",
            Some(Payload::Step2(_)) => "Step2",
            None => "Empty",
        }
    }
}

impl LinkOutMessageV1 {
    /// Session id of the wrapped session message or data record.
    pub fn session_id(&self) -> Option<&str> {
        use link_out_message_v1::Payload;
        match self.payload.as_ref()? {
            Payload::SessionMessage(m) => m.session_id(),
            Payload::AuthenticatedData(m) => header_session_id(&m.header),
            Payload::AuthenticatedEncryptedData(m) => header_session_id(&m.header),
        }
    }

    /// The wrapped session message, if this record carries one.
    pub fn session_message(&self) -> Option<&SessionMessageV1> {
        match self.payload.as_ref()? {
            link_out_message_v1::Payload::SessionMessage(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(id: &str) -> Option<CommonHeaderV1> {
        Some(CommonHeaderV1 { session_id: id.to_string(), sequence_no: 0, timestamp_millis: 1 })
    }

    #[test]
    fn test_session_id_of_each_variant() {
        let hello: SessionMessageV1 = InitiatorHelloV1 { header: header("a"), ..Default::default() }.into();
        assert_eq!(hello.session_id(), Some("a"));
        assert_eq!(hello.kind(), "InitiatorHello");

        let handshake: SessionMessageV1 =
            ResponderHandshakeV1 { header: header("b"), encrypted_data: vec![1] }.into();
        assert_eq!(handshake.session_id(), Some("b"));

        let step2: SessionMessageV1 = Step2V1 {
            initiator_hello: Some(InitiatorHelloV1 { header: header("c"), ..Default::default() }),
            responder_hello: None,
            wrapped_responder_ephemeral_key: vec![],
        }
        .into();
        assert_eq!(step2.session_id(), Some("c"));
    }

    #[test]
    fn test_empty_payload_has_no_session_id() {
        let empty = SessionMessageV1::default();
        assert_eq!(empty.session_id(), None);
        assert_eq!(empty.kind(), "Empty");
    }

    #[test]
    fn test_link_out_session_id() {
        let record = LinkOutMessageV1 {
            header: None,
            payload: Some(
                AuthenticatedDataMessageV1 { header: header("s1"), payload: vec![], auth_tag: vec![] }.into(),
            ),
        };
        assert_eq!(record.session_id(), Some("s1"));
        assert!(record.session_message().is_none());
    }
}
