//! Error types for peerlink core.
//!
//! Every failure inside the session manager is local to the message being
//! processed. `CoreError::kind` classifies an error so callers can decide
//! between discarding, retrying and treating it as a broken precondition.

use thiserror::Error;

use peerlink_crypto::protocol::HandshakeError;
use peerlink_crypto::session::SessionError;
use peerlink_proto::validation::ValidationError;

use crate::store::StoreError;

/// Classification of core errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed, unexpected or unverifiable message; discard and warn.
    ProtocolViolation,
    /// Unknown session, member, hosted identity or group policy; discard and warn.
    LookupFailure,
    /// Revocation check did not answer in time; treated as revoked.
    TimeoutFailure,
    /// Optimistic-concurrency failure on the state store.
    PersistenceConflict,
    /// A component was used before its configuration arrived.
    ConfigurationNotYetAvailable,
    /// Collaborator or conversion failure.
    Internal,
}

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("malformed message: {0}")]
    Validation(#[from] ValidationError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("lookup failed: {0}")]
    Lookup(String),

    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("revocation check timed out")]
    RevocationTimeout,

    #[error("persistence conflict on {key}")]
    PersistenceConflict { key: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration not yet available: {0}")]
    ConfigurationNotYetAvailable(&'static str),

    #[error("crypto service failed: {0}")]
    Crypto(String),

    #[error("session data error: {0}")]
    Session(#[from] SessionError),

    #[error("state conversion failed: {0}")]
    Convert(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Handshake(_)
            | CoreError::Validation(_)
            | CoreError::ProtocolViolation(_)
            | CoreError::CertificateRejected(_)
            | CoreError::Session(_) => ErrorKind::ProtocolViolation,
            CoreError::Lookup(_) => ErrorKind::LookupFailure,
            CoreError::RevocationTimeout => ErrorKind::TimeoutFailure,
            CoreError::PersistenceConflict { .. } => ErrorKind::PersistenceConflict,
            CoreError::Store(StoreError::VersionMismatch { .. }) => ErrorKind::PersistenceConflict,
            CoreError::ConfigurationNotYetAvailable(_) => ErrorKind::ConfigurationNotYetAvailable,
            CoreError::Store(_) | CoreError::Crypto(_) | CoreError::Convert(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            CoreError::from(HandshakeError::InvalidSignature).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(CoreError::Lookup("member".into()).kind(), ErrorKind::LookupFailure);
        assert_eq!(CoreError::RevocationTimeout.kind(), ErrorKind::TimeoutFailure);
        assert_eq!(
            CoreError::Store(StoreError::VersionMismatch { key: "k".into(), expected: 1, actual: 2 }).kind(),
            ErrorKind::PersistenceConflict
        );
        assert_eq!(
            CoreError::ConfigurationNotYetAvailable("inactivity limit").kind(),
            ErrorKind::ConfigurationNotYetAvailable
        );
    }

    #[test]
    fn test_display() {
        let err = CoreError::PersistenceConflict { key: "abc".into() };
        assert_eq!(err.to_string(), "persistence conflict on abc");
    }
}
