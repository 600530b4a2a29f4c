//! OS keychain storage for engine-level secrets.
//!
//! Only two kinds of secret live here: the vault master key and the webhook
//! shared secrets. Provider credentials are sealed by the vault and stored
//! in the database.

use thiserror::Error;

use crate::domain::{ProviderKind, Secret};

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, KeychainError>;

const MASTER_KEY_ENTRY: &str = "vault.master_key";

fn webhook_entry(kind: ProviderKind) -> String {
    format!("webhook.secret.{}", kind.as_str())
}

/// Keychain entries under one service name.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
}

impl KeychainAccess {
    pub const DEFAULT_SERVICE: &'static str = "io.courier.engine";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Separate service name, so tests never touch the real entries.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Base64 vault master key, if one has been stored.
    pub async fn master_key(&self) -> Result<Option<Secret>> {
        self.read(MASTER_KEY_ENTRY).await
    }

    pub async fn store_master_key(&self, key: &Secret) -> Result<()> {
        self.write(MASTER_KEY_ENTRY, key).await
    }

    /// Shared secret webhook deliveries from `kind` are signed with.
    pub async fn webhook_secret(&self, kind: ProviderKind) -> Result<Option<Secret>> {
        self.read(&webhook_entry(kind)).await
    }

    pub async fn store_webhook_secret(&self, kind: ProviderKind, secret: &Secret) -> Result<()> {
        self.write(&webhook_entry(kind), secret).await
    }

    /// Removes a webhook secret. Returns false when there was none.
    pub async fn remove_webhook_secret(&self, kind: ProviderKind) -> Result<bool> {
        let entry = self.entry(&webhook_entry(kind));
        blocking(move || match entry?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        Ok(keyring::Entry::new(&self.service_name, name)?)
    }

    async fn read(&self, name: &str) -> Result<Option<Secret>> {
        let entry = self.entry(name);
        blocking(move || match entry?.get_password() {
            Ok(value) => Ok(Some(Secret::new(value))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn write(&self, name: &str, value: &Secret) -> Result<()> {
        let entry = self.entry(name);
        let value = value.expose().to_string();
        blocking(move || Ok(entry?.set_password(&value)?)).await
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}

/// Keychain backends block, so every call runs off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
}
