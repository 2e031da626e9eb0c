//! Session certificates.
//!
//! A session certificate binds a session public key (the subject) to the key
//! of the authority that issued it. A chain lists certificates from the
//! session key upwards; the last issuer must be one of the group's trust
//! roots.
//!
//! Encoding: subject_key(32) || issuer_key(32) || signature(64)

use ed25519_dalek::{Signer, SigningKey};

use crate::signature::{verify_signature, SignatureSpec};
use crate::transcript::Transcript;

const DOMAIN: &str = "peerlink_session_certificate_v1";
const SUBJECT: u32 = 1;
const ISSUER: u32 = 2;

/// Size of an encoded certificate.
pub const CERTIFICATE_SIZE: usize = 128;

/// Error type for certificate validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate chain is empty")]
    EmptyChain,
    #[error("certificate {index} is malformed")]
    Malformed { index: usize },
    #[error("certificate {index} has an invalid signature")]
    InvalidSignature { index: usize },
    #[error("certificate subject does not match the session key")]
    SubjectMismatch,
    #[error("certificate {index} is not issued by the next certificate in the chain")]
    BrokenChain { index: usize },
    #[error("chain does not end at a trusted root")]
    UntrustedRoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCertificate {
    pub subject_key: [u8; 32],
    pub issuer_key: [u8; 32],
    pub signature: [u8; 64],
}

fn signing_data(subject_key: &[u8; 32], issuer_key: &[u8; 32]) -> [u8; 32] {
    Transcript::new(DOMAIN)
        .append_bytes(SUBJECT, subject_key)
        .append_bytes(ISSUER, issuer_key)
        .finalize()
}

impl SessionCertificate {
    /// Issue a certificate for `subject_key` signed by `issuer`.
    pub fn issue(issuer: &SigningKey, subject_key: [u8; 32]) -> Self {
        let issuer_key = issuer.verifying_key().to_bytes();
        let signature = issuer.sign(&signing_data(&subject_key, &issuer_key)).to_bytes();
        Self { subject_key, issuer_key, signature }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CERTIFICATE_SIZE);
        out.extend_from_slice(&self.subject_key);
        out.extend_from_slice(&self.issuer_key);
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != CERTIFICATE_SIZE {
            return None;
        }
        let mut subject_key = [0u8; 32];
        let mut issuer_key = [0u8; 32];
        let mut signature = [0u8; 64];
        subject_key.copy_from_slice(&data[..32]);
        issuer_key.copy_from_slice(&data[32..64]);
        signature.copy_from_slice(&data[64..]);
        Some(Self { subject_key, issuer_key, signature })
    }

    /// Check the issuer's signature.
    pub fn verify(&self) -> bool {
        verify_signature(
            &self.issuer_key,
            SignatureSpec::Ed25519,
            &signing_data(&self.subject_key, &self.issuer_key),
            &self.signature,
        )
        .is_ok()
    }
}

/// Validate an encoded chain for `session_key` against `trust_roots`.
///
/// Returns the decoded chain on success.
pub fn validate_chain(
    chain: &[Vec<u8>],
    session_key: &[u8],
    trust_roots: &[[u8; 32]],
) -> Result<Vec<SessionCertificate>, CertificateError> {
    if chain.is_empty() {
        return Err(CertificateError::EmptyChain);
    }
    let certs = chain
        .iter()
        .enumerate()
        .map(|(index, raw)| SessionCertificate::from_bytes(raw).ok_or(CertificateError::Malformed { index }))
        .collect::<Result<Vec<_>, _>>()?;

    if certs[0].subject_key.as_slice() != session_key {
        return Err(CertificateError::SubjectMismatch);
    }
    for (index, cert) in certs.iter().enumerate() {
        if !cert.verify() {
            return Err(CertificateError::InvalidSignature { index });
        }
        if let Some(next) = certs.get(index + 1) {
            if next.subject_key != cert.issuer_key {
                return Err(CertificateError::BrokenChain { index });
            }
        }
    }
    let last = &certs[certs.len() - 1];
    if !trust_roots.contains(&last.issuer_key) {
        return Err(CertificateError::UntrustedRoot);
    }
    Ok(certs)
}
