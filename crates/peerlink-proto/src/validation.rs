//! Structural validation of peerlink messages.
//!
//! This module checks what can be checked without key material:
//! - sizes of keys, hashes, signatures and sealed blobs
//! - presence of required headers and identities
//! - protocol mode values
//!
//! Cryptographic checks happen in the handshake protocol objects.

use crate::v1::*;

/// Validation error types for protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field has invalid size (expected, actual)
    InvalidSize { field: &'static str, expected: usize, actual: usize },
    /// Field size is out of allowed range
    SizeOutOfRange { field: &'static str, min: usize, max: usize, actual: usize },
    /// Required field is empty
    EmptyField { field: &'static str },
    /// Field contains invalid data
    InvalidData { field: &'static str, reason: &'static str },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { field, expected, actual } => {
                write!(f, "field '{}' has invalid size: expected {}, got {}", field, expected, actual)
            }
            Self::SizeOutOfRange { field, min, max, actual } => {
                write!(f, "field '{}' size {} is out of range [{}, {}]", field, actual, min, max)
            }
            Self::EmptyField { field } => {
                write!(f, "required field '{}' is empty", field)
            }
            Self::InvalidData { field, reason } => {
                write!(f, "field '{}' contains invalid data: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Constants for field sizes.
pub mod sizes {
    /// Size of SHA-256 public key hashes.
    pub const PUBLIC_KEY_HASH_SIZE: usize = 32;
    /// Size of X25519 public keys.
    pub const X25519_PUB_SIZE: usize = 32;
    /// Size of Ed25519 signatures.
    pub const ED25519_SIG_SIZE: usize = 64;
    /// Size of the Poly1305 tag appended by the AEAD.
    pub const AEAD_TAG_SIZE: usize = 16;
    /// Size of the ChaCha20Poly1305 nonce prefix on data records.
    pub const AEAD_NONCE_SIZE: usize = 12;
    /// Size of HMAC-SHA256 tags.
    pub const HMAC_TAG_SIZE: usize = 32;
    /// Upper bound on session id length.
    pub const MAX_SESSION_ID_LEN: usize = 64;
}

/// Validate that a byte field has the expected exact size.
fn validate_exact_size(field: &'static str, data: &[u8], expected: usize) -> ValidationResult<()> {
    if data.len() != expected {
        return Err(ValidationError::InvalidSize {
            field,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Validate that a byte field is not empty.
fn validate_not_empty(field: &'static str, data: &[u8]) -> ValidationResult<()> {
    if data.is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    Ok(())
}

fn validate_min_size(field: &'static str, data: &[u8], min: usize) -> ValidationResult<()> {
    if data.len() < min {
        return Err(ValidationError::SizeOutOfRange {
            field,
            min,
            max: usize::MAX,
            actual: data.len(),
        });
    }
    Ok(())
}

fn validate_header(header: &Option<CommonHeaderV1>) -> ValidationResult<()> {
    match header {
        Some(h) => h.validate(),
        None => Err(ValidationError::EmptyField { field: "header" }),
    }
}

fn validate_mode(field: &'static str, value: i32) -> ValidationResult<()> {
    match ProtocolModeV1::try_from(value) {
        Ok(ProtocolModeV1::Unspecified) | Err(_) => {
            Err(ValidationError::InvalidData { field, reason: "unknown protocol mode" })
        }
        Ok(_) => Ok(()),
    }
}

// ============================================================================
// Validation trait and implementations
// ============================================================================

/// Trait for validating protocol messages.
pub trait Validate {
    /// Validate the message fields.
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for CommonHeaderV1 {
    fn validate(&self) -> ValidationResult<()> {
        if self.session_id.is_empty() {
            return Err(ValidationError::EmptyField { field: "session_id" });
        }
        if self.session_id.len() > sizes::MAX_SESSION_ID_LEN {
            return Err(ValidationError::SizeOutOfRange {
                field: "session_id",
                min: 1,
                max: sizes::MAX_SESSION_ID_LEN,
                actual: self.session_id.len(),
            });
        }
        Ok(())
    }
}

impl Validate for InitiatorHelloV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_exact_size("initiator_ephemeral_key", &self.initiator_ephemeral_key, sizes::X25519_PUB_SIZE)?;
        if self.supported_modes.is_empty() {
            return Err(ValidationError::EmptyField { field: "supported_modes" });
        }
        let source = self
            .source
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "source" })?;
        validate_exact_size(
            "initiator_public_key_hash",
            &source.initiator_public_key_hash,
            sizes::PUBLIC_KEY_HASH_SIZE,
        )?;
        if source.group_id.is_empty() {
            return Err(ValidationError::EmptyField { field: "group_id" });
        }
        Ok(())
    }
}

impl Validate for ResponderHelloV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_exact_size("responder_ephemeral_key", &self.responder_ephemeral_key, sizes::X25519_PUB_SIZE)?;
        validate_mode("selected_mode", self.selected_mode)
    }
}

impl Validate for InitiatorHandshakeV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_min_size("encrypted_data", &self.encrypted_data, sizes::AEAD_TAG_SIZE + 1)
    }
}

impl Validate for ResponderHandshakeV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_min_size("encrypted_data", &self.encrypted_data, sizes::AEAD_TAG_SIZE + 1)
    }
}

impl Validate for InitiatorHandshakePayloadV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_exact_size("initiator_public_key_hash", &self.initiator_public_key_hash, sizes::PUBLIC_KEY_HASH_SIZE)?;
        validate_exact_size("responder_public_key_hash", &self.responder_public_key_hash, sizes::PUBLIC_KEY_HASH_SIZE)?;
        validate_exact_size("initiator_signature", &self.initiator_signature, sizes::ED25519_SIG_SIZE)?;
        if self.max_message_size == 0 {
            return Err(ValidationError::InvalidData { field: "max_message_size", reason: "must be positive" });
        }
        Ok(())
    }
}

impl Validate for ResponderHandshakePayloadV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_exact_size("responder_public_key_hash", &self.responder_public_key_hash, sizes::PUBLIC_KEY_HASH_SIZE)?;
        validate_exact_size("responder_signature", &self.responder_signature, sizes::ED25519_SIG_SIZE)?;
        if self.max_message_size == 0 {
            return Err(ValidationError::InvalidData { field: "max_message_size", reason: "must be positive" });
        }
        Ok(())
    }
}

impl Validate for Step2V1 {
    fn validate(&self) -> ValidationResult<()> {
        self.initiator_hello
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "initiator_hello" })?
            .validate()?;
        self.responder_hello
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "responder_hello" })?
            .validate()?;
        validate_not_empty("wrapped_responder_ephemeral_key", &self.wrapped_responder_ephemeral_key)
    }
}

impl Validate for SessionMessageV1 {
    fn validate(&self) -> ValidationResult<()> {
        use session_message_v1::Payload;
        match &self.payload {
            Some(Payload::InitiatorHello(m)) => m.validate(),
            Some(Payload::ResponderHello(m)) => m.validate(),
            Some(Payload::InitiatorHandshake(m)) => m.validate(),
            Some(Payload::ResponderHandshake(m)) => m.validate(),
            Some(Payload::Step2(m)) => m.validate(),
            None => Err(ValidationError::EmptyField { field: "payload" }),
        }
    }
}

impl Validate for AuthenticatedDataMessageV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_exact_size("auth_tag", &self.auth_tag, sizes::HMAC_TAG_SIZE)
    }
}

impl Validate for AuthenticatedEncryptedDataMessageV1 {
    fn validate(&self) -> ValidationResult<()> {
        validate_header(&self.header)?;
        validate_min_size(
            "encrypted_payload",
            &self.encrypted_payload,
            sizes::AEAD_NONCE_SIZE + sizes::AEAD_TAG_SIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Option<CommonHeaderV1> {
        Some(CommonHeaderV1 { session_id: "abc".into(), sequence_no: 1, timestamp_millis: 0 })
    }

    fn hello() -> InitiatorHelloV1 {
        InitiatorHelloV1 {
            header: header(),
            initiator_ephemeral_key: vec![7u8; 32],
            supported_modes: vec![ProtocolModeV1::AuthenticatedEncryption as i32],
            source: Some(InitiatorHelloIdentityV1 {
                initiator_public_key_hash: vec![1u8; 32],
                group_id: "group".into(),
            }),
        }
    }

    #[test]
    fn test_initiator_hello_validation() {
        assert!(hello().validate().is_ok());

        let mut short_key = hello();
        short_key.initiator_ephemeral_key = vec![0u8; 16];
        assert!(matches!(
            short_key.validate(),
            Err(ValidationError::InvalidSize { field: "initiator_ephemeral_key", expected: 32, actual: 16 })
        ));

        let mut no_modes = hello();
        no_modes.supported_modes.clear();
        assert_eq!(no_modes.validate(), Err(ValidationError::EmptyField { field: "supported_modes" }));
    }

    #[test]
    fn test_missing_header_rejected() {
        let mut msg = hello();
        msg.header = None;
        assert_eq!(msg.validate(), Err(ValidationError::EmptyField { field: "header" }));
    }

    #[test]
    fn test_oversized_session_id_rejected() {
        let h = CommonHeaderV1 { session_id: "x".repeat(65), sequence_no: 0, timestamp_millis: 0 };
        assert!(matches!(h.validate(), Err(ValidationError::SizeOutOfRange { field: "session_id", .. })));
    }

    #[test]
    fn test_responder_hello_requires_mode() {
        let msg = ResponderHelloV1 {
            header: header(),
            responder_ephemeral_key: vec![0u8; 32],
            selected_mode: ProtocolModeV1::Unspecified as i32,
        };
        assert!(matches!(msg.validate(), Err(ValidationError::InvalidData { field: "selected_mode", .. })));
    }

    #[test]
    fn test_empty_session_message_rejected() {
        assert_eq!(
            SessionMessageV1::default().validate(),
            Err(ValidationError::EmptyField { field: "payload" })
        );
    }

    #[test]
    fn test_data_record_sizes() {
        let mac = AuthenticatedDataMessageV1 { header: header(), payload: vec![1, 2], auth_tag: vec![0u8; 32] };
        assert!(mac.validate().is_ok());

        let sealed = AuthenticatedEncryptedDataMessageV1 { header: header(), encrypted_payload: vec![0u8; 20] };
        assert!(sealed.validate().is_err());
    }

    #[test]
    fn test_error_display() {
        let err = ValidationError::EmptyField { field: "header" };
        assert_eq!(err.to_string(), "required field 'header' is empty");
    }
}
