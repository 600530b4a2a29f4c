//! Engine configuration.
//!
//! Loaded from `courier/config.json` in the platform config directory (or an
//! explicit path). Every field has a default, so an absent file yields a
//! working configuration. `COURIER_DATA_DIR` and `COURIER_LOG` override the
//! data directory and log filter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ProviderKind, Secret};
use crate::providers::email::{ApiEndpoints, OAuthClient, OAuthEndpoints};

pub const DATA_DIR_ENV: &str = "COURIER_DATA_DIR";
pub const LOG_ENV: &str = "COURIER_LOG";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no home directory to derive config and data paths from")]
    NoProjectDirs,

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Limits enforced by the attachment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentLimits {
    pub max_file_bytes: u64,
    pub max_files_per_email: usize,
    pub user_quota_bytes: u64,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 25 * 1024 * 1024,
            max_files_per_email: 5,
            user_quota_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Backup defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupDefaults {
    /// Emails per chunk.
    pub batch_size: usize,
    pub retention_days: u32,
    pub compress: bool,
}

impl Default for BackupDefaults {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            retention_days: 30,
            compress: true,
        }
    }
}

/// Background sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub max_results: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_results: 100,
        }
    }
}

/// Bulk send pacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSendConfig {
    pub batch_size: usize,
    pub delay_ms: u64,
}

impl Default for BulkSendConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            delay_ms: 1000,
        }
    }
}

/// OAuth applications and where providers should push notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub google: Option<OAuthClient>,
    pub microsoft: Option<OAuthClient>,
    pub endpoints: OAuthEndpoints,
}

impl OAuthConfig {
    pub fn client(&self, kind: ProviderKind) -> Option<&OAuthClient> {
        match kind {
            ProviderKind::Gmail => self.google.as_ref(),
            ProviderKind::Outlook => self.microsoft.as_ref(),
            ProviderKind::Imap | ProviderKind::Smtp => None,
        }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Public endpoint Graph posts notifications to.
    pub callback_url: Option<String>,
    /// Pub/Sub topic Gmail watches publish to.
    pub gmail_topic: Option<String>,
    /// HMAC secrets per provider. Missing entries fall back to the keychain.
    pub secrets: HashMap<ProviderKind, Secret>,
}

/// Sender identity used in business templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessProfile {
    pub company_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub website: Option<String>,
}

impl Default for BusinessProfile {
    fn default() -> Self {
        Self {
            company_name: "Your Company".to_string(),
            email: None,
            phone: None,
            address: None,
            website: None,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub object_store_root: Option<PathBuf>,
    /// Prefix for object-store download URLs.
    pub public_base_url: String,
    /// Base64 vault master key. When absent the key lives in the OS keychain.
    pub vault_master_key: Option<Secret>,
    pub attachments: AttachmentLimits,
    pub backup: BackupDefaults,
    pub sync: SyncConfig,
    pub bulk_send: BulkSendConfig,
    pub oauth: OAuthConfig,
    pub api: ApiEndpoints,
    pub webhooks: WebhookConfig,
    pub settings_cache_capacity: usize,
    pub business: BusinessProfile,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_path: None,
            object_store_root: None,
            public_base_url: "http://localhost:8080/files".to_string(),
            vault_master_key: None,
            attachments: AttachmentLimits::default(),
            backup: BackupDefaults::default(),
            sync: SyncConfig::default(),
            bulk_send: BulkSendConfig::default(),
            oauth: OAuthConfig::default(),
            api: ApiEndpoints::default(),
            webhooks: WebhookConfig::default(),
            settings_cache_capacity: 256,
            business: BusinessProfile::default(),
            log_filter: "info".to_string(),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "courier", "courier").ok_or(ConfigError::NoProjectDirs)
}

impl EngineConfig {
    /// Default location of `config.json`.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.json"))
    }

    /// Loads from the default location, then applies env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path()?)
    }

    /// Loads from `path`. A missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `COURIER_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(filter) = lookup(LOG_ENV).filter(|f| !f.is_empty()) {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.batch_size == 0 {
            return Err(ConfigError::Invalid("backup.batch_size must be positive".into()));
        }
        if self.bulk_send.batch_size == 0 {
            return Err(ConfigError::Invalid("bulk_send.batch_size must be positive".into()));
        }
        if self.settings_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "settings_cache_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("courier.db")),
        }
    }

    pub fn object_store_root(&self) -> Result<PathBuf> {
        match &self.object_store_root {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("objects")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.attachments.max_file_bytes, 25 * 1024 * 1024);
        assert_eq!(config.attachments.max_files_per_email, 5);
        assert_eq!(config.backup.batch_size, 1000);
        assert_eq!(config.bulk_send.batch_size, 10);
        assert_eq!(config.bulk_send.delay_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"backup":{"batch_size":50},"webhooks":{"secrets":{"gmail":"s3cret"}}}"#,
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.backup.batch_size, 50);
        assert_eq!(config.backup.retention_days, 30);
        assert_eq!(
            config.webhooks.secrets.get(&ProviderKind::Gmail).map(Secret::expose),
            Some("s3cret")
        );
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(config.sync.interval_secs, 300);
    }

    #[test]
    fn env_overrides_data_dir_and_log() {
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| match key {
            DATA_DIR_ENV => Some("/var/lib/courier".to_string()),
            LOG_ENV => Some("courier=debug".to_string()),
            _ => None,
        });
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/var/lib/courier"));
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/var/lib/courier/courier.db")
        );
        assert_eq!(config.log_filter, "courier=debug");
    }

    #[test]
    fn zero_batch_is_invalid() {
        let mut config = EngineConfig::default();
        config.backup.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
