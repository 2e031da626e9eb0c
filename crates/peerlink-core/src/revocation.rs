//! Session certificate validation and revocation checks.
//!
//! A chain is first validated locally against the group's trust roots; the
//! revocation check runs only when the configured mode asks for it and is
//! bounded by a timeout. A check that does not answer in time rejects the
//! certificate as if it were revoked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use peerlink_crypto::certificate::validate_chain;

use crate::config::RevocationCheckMode;
use crate::errors::CoreError;
use crate::types::{P2pParameters, SessionPkiMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationCheckRequest {
    pub certificate_chain: Vec<Vec<u8>>,
    pub trust_roots: Vec<[u8; 32]>,
    /// Soft or hard failure semantics for unreachable sources.
    pub mode: RevocationCheckMode,
}

#[async_trait]
pub trait RevocationChecker: Send + Sync {
    async fn check_revocation(&self, request: &RevocationCheckRequest) -> RevocationStatus;
}

/// Certificate policy derived from a group's P2P parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateCheckMode {
    NoCertificate,
    CheckCertificate {
        trust_roots: Vec<[u8; 32]>,
        revocation_mode: RevocationCheckMode,
    },
}

impl CertificateCheckMode {
    pub fn from_parameters(
        parameters: &P2pParameters,
        revocation_mode: RevocationCheckMode,
    ) -> Result<Self, CoreError> {
        match parameters.session_pki {
            SessionPkiMode::NoPki => Ok(CertificateCheckMode::NoCertificate),
            SessionPkiMode::Standard => Ok(CertificateCheckMode::CheckCertificate {
                trust_roots: parameters.trust_roots.clone(),
                revocation_mode,
            }),
            mode @ (SessionPkiMode::StandardEv3 | SessionPkiMode::Legacy) => Err(CoreError::ProtocolViolation(
                format!("session PKI mode {:?} is not supported", mode),
            )),
        }
    }
}

pub struct CertificateValidator {
    checker: Arc<dyn RevocationChecker>,
}

impl CertificateValidator {
    pub fn new(checker: Arc<dyn RevocationChecker>) -> Self {
        Self { checker }
    }

    /// Validate the peer's chain for `session_key` under `mode`.
    ///
    /// # Arguments
    /// * `mode` - Certificate policy of the group
    /// * `chain` - Encoded chain, leaf first, as sent in the handshake
    /// * `session_key` - Peer session key the leaf must certify
    /// * `timeout` - Upper bound for the revocation check
    pub async fn validate(
        &self,
        mode: &CertificateCheckMode,
        chain: &[Vec<u8>],
        session_key: &[u8],
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let (trust_roots, revocation_mode) = match mode {
            CertificateCheckMode::NoCertificate => return Ok(()),
            CertificateCheckMode::CheckCertificate { trust_roots, revocation_mode } => {
                (trust_roots, *revocation_mode)
            }
        };

        validate_chain(chain, session_key, trust_roots)
            .map_err(|e| CoreError::CertificateRejected(e.to_string()))?;

        if revocation_mode == RevocationCheckMode::Off {
            return Ok(());
        }

        let request = RevocationCheckRequest {
            certificate_chain: chain.to_vec(),
            trust_roots: trust_roots.clone(),
            mode: revocation_mode,
        };
        let status = match tokio::time::timeout(timeout, self.checker.check_revocation(&request)).await {
            Ok(status) => status,
            Err(_) => {
                warn!(?timeout, "Revocation check timed out, treating certificate as revoked");
                return Err(CoreError::RevocationTimeout);
            }
        };

        match status {
            RevocationStatus::Active => Ok(()),
            RevocationStatus::Revoked => Err(CoreError::CertificateRejected("certificate is revoked".into())),
        }
    }
}

/// Revocation checker answering from a fixed list of revoked leaf keys.
#[derive(Default, Clone)]
pub struct StaticRevocationList {
    revoked: Arc<Mutex<Vec<[u8; 32]>>>,
}

impl StaticRevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, subject_key: [u8; 32]) {
        self.revoked.lock().push(subject_key);
    }
}

#[async_trait]
impl RevocationChecker for StaticRevocationList {
    async fn check_revocation(&self, request: &RevocationCheckRequest) -> RevocationStatus {
        let revoked = self.revoked.lock();
        let hit = request
            .certificate_chain
            .iter()
            .any(|cert| cert.len() >= 32 && revoked.iter().any(|key| key.as_slice() == &cert[..32]));
        if hit {
            RevocationStatus::Revoked
        } else {
            RevocationStatus::Active
        }
    }
}
