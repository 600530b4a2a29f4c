//! Credential vault: seals provider credentials before they reach the database.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;
use tracing::{debug, info};

use super::crypto::{self, Cipher, CryptoError};
use super::keychain::{KeychainAccess, KeychainError};
use crate::domain::{ProviderCredentials, Secret, UserId};

/// Errors from sealing or opening credentials.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Keychain error: {0}")]
    Keychain(#[from] KeychainError),

    #[error("Sealed credentials are not valid base64")]
    Encoding,

    #[error("Credential payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Encrypts and decrypts provider credentials at rest.
///
/// Every blob is bound to its owning user: opening it under a different user
/// id fails.
#[derive(Debug, Clone)]
pub struct CredentialVault {
    cipher: Arc<Cipher>,
}

impl CredentialVault {
    /// Builds a vault from raw 32-byte key material.
    pub fn new(master_key: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: Arc::new(Cipher::from_key_bytes(master_key)?),
        })
    }

    /// Builds a vault from a base64-encoded master key.
    pub fn from_base64(master_key: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(master_key.trim())
            .map_err(|_| VaultError::Encoding)?;
        Self::new(&bytes)
    }

    /// Loads the master key from the keychain, creating one on first use.
    pub async fn from_keychain(keychain: &KeychainAccess) -> Result<Self> {
        if let Some(existing) = keychain.master_key().await? {
            debug!(service = keychain.service_name(), "Loaded vault master key");
            return Self::from_base64(existing.expose());
        }

        let key = crypto::generate_key()?;
        keychain
            .store_master_key(&Secret::new(BASE64.encode(key)))
            .await?;
        info!(service = keychain.service_name(), "Generated new vault master key");
        Self::new(&key)
    }

    /// A vault with a fresh random key, for tests and ephemeral engines.
    pub fn ephemeral() -> Result<Self> {
        Self::new(&crypto::generate_key()?)
    }

    /// Seals credentials into a base64 blob bound to `user_id`.
    pub fn seal_credentials(
        &self,
        user_id: &UserId,
        credentials: &ProviderCredentials,
    ) -> Result<String> {
        let plaintext = serde_json::to_vec(credentials)?;
        let sealed = self.cipher.seal(&plaintext, user_id.as_str().as_bytes())?;
        Ok(BASE64.encode(sealed))
    }

    /// Opens a blob produced by [`CredentialVault::seal_credentials`].
    pub fn open_credentials(&self, user_id: &UserId, blob: &str) -> Result<ProviderCredentials> {
        let sealed = BASE64.decode(blob).map_err(|_| VaultError::Encoding)?;
        let plaintext = self.cipher.open(&sealed, user_id.as_str().as_bytes())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
