//! Remote crypto operations.
//!
//! Private session keys never enter the session manager. Handshake
//! signatures are requested from a [`CryptoOpsClient`], and ephemeral or
//! session secrets are wrapped by a [`KeyWrapper`] before they are persisted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use thiserror::Error;

use peerlink_crypto::signature::SignatureSpec;
use peerlink_crypto::wrapping::WrappingKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoClientError {
    #[error("no signing key for tenant {tenant_id}")]
    UnknownKey { tenant_id: String },
    #[error("unsupported signature spec {0}")]
    UnsupportedSpec(&'static str),
    #[error("key wrapping failed: {0}")]
    Wrapping(String),
    #[error("crypto service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CryptoOpsClient: Send + Sync {
    /// Sign `data` with the private key behind `public_key`.
    ///
    /// # Arguments
    /// * `tenant_id` - Tenant owning the key
    /// * `public_key` - Session public key identifying the key pair
    /// * `spec` - Signature scheme to use
    /// * `data` - Bytes to sign
    async fn sign(
        &self,
        tenant_id: &str,
        public_key: &[u8],
        spec: SignatureSpec,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoClientError>;
}

#[async_trait]
pub trait KeyWrapper: Send + Sync {
    async fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoClientError>;
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoClientError>;
}

// ============================================================================
// Local implementations
// ============================================================================

/// Signs with session keys held in process.
#[derive(Default, Clone)]
pub struct LocalCryptoOps {
    keys: Arc<RwLock<HashMap<(String, [u8; 32]), SigningKey>>>,
}

impl LocalCryptoOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, tenant_id: impl Into<String>, key: SigningKey) {
        let public = key.verifying_key().to_bytes();
        self.keys.write().insert((tenant_id.into(), public), key);
    }
}

#[async_trait]
impl CryptoOpsClient for LocalCryptoOps {
    async fn sign(
        &self,
        tenant_id: &str,
        public_key: &[u8],
        spec: SignatureSpec,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoClientError> {
        match spec {
            SignatureSpec::Ed25519 => {
                let unknown = || CryptoClientError::UnknownKey { tenant_id: tenant_id.to_string() };
                let public: [u8; 32] = public_key.try_into().map_err(|_| unknown())?;
                let keys = self.keys.read();
                let key = keys.get(&(tenant_id.to_string(), public)).ok_or_else(unknown)?;
                Ok(key.sign(data).to_bytes().to_vec())
            }
        }
    }
}

/// Wraps secrets under a process-local AEAD key.
pub struct LocalKeyWrapper {
    key: WrappingKey,
}

impl LocalKeyWrapper {
    pub fn new(key: WrappingKey) -> Self {
        Self { key }
    }

    pub fn generate() -> Result<Self, CryptoClientError> {
        WrappingKey::generate()
            .map(Self::new)
            .map_err(|e| CryptoClientError::Wrapping(e.to_string()))
    }
}

#[async_trait]
impl KeyWrapper for LocalKeyWrapper {
    async fn wrap(&self, secret: &[u8]) -> Result<Vec<u8>, CryptoClientError> {
        self.key.wrap(secret).map_err(|e| CryptoClientError::Wrapping(e.to_string()))
    }

    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, CryptoClientError> {
        self.key.unwrap(wrapped).map_err(|e| CryptoClientError::Wrapping(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_crypto::signature::verify_signature;
    use rand_core::OsRng;

    #[tokio::test]
    async fn test_local_sign_verifies() {
        let ops = LocalCryptoOps::new();
        let key = SigningKey::generate(&mut OsRng);
        let public = key.verifying_key().to_bytes();
        ops.add_key("tenant", key);

        let sig = ops.sign("tenant", &public, SignatureSpec::Ed25519, b"data").await.unwrap();
        verify_signature(&public, SignatureSpec::Ed25519, b"data", &sig).unwrap();

        assert!(matches!(
            ops.sign("other", &public, SignatureSpec::Ed25519, b"data").await,
            Err(CryptoClientError::UnknownKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrapper_round_trip() {
        let wrapper = LocalKeyWrapper::generate().unwrap();
        let wrapped = wrapper.wrap(&[5u8; 32]).await.unwrap();
        assert_ne!(wrapped, vec![5u8; 32]);
        assert_eq!(wrapper.unwrap(&wrapped).await.unwrap(), vec![5u8; 32]);

        let other = LocalKeyWrapper::generate().unwrap();
        assert!(other.unwrap(&wrapped).await.is_err());
    }
}
