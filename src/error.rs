//! Engine-wide error taxonomy.
//!
//! Each layer keeps its own error enum (`DatabaseError`, `ProviderError`,
//! `CryptoError`, `ObjectStoreError`, `ConfigError`); they all convert into
//! [`EngineError`], which is what every public service operation returns.

use thiserror::Error;

use crate::config::ConfigError;
use crate::providers::email::ProviderError;
use crate::storage::{CryptoError, DatabaseError, ObjectStoreError, VaultError};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid email data: {}", .0.join(", "))]
    InvalidEmailData(Vec<String>),

    #[error("Invalid settings: {}", .0.join(", "))]
    InvalidSettings(Vec<String>),

    #[error("Invalid attachment: {}", .0.join(", "))]
    InvalidAttachment(Vec<String>),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<String>),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Invalid configuration format")]
    InvalidConfiguration(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid state parameter")]
    InvalidState,

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Token expired")]
    TokenExpired,

    #[error(
        "Rate limited{}",
        .retry_after_seconds.map(|s| format!(", retry after {s}s")).unwrap_or_default()
    )]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Backup validation failed: {0}")]
    BackupValidationFailed(String),

    #[error("Invalid backup format")]
    InvalidBackupFormat(String),

    #[error("Invalid import format")]
    InvalidImportFormat(String),

    #[error("Storage quota exceeded")]
    StorageQuotaExceeded,

    #[error("Attachment {attachment_id} quarantined: {}", .threats.join(", "))]
    AttachmentQuarantined {
        attachment_id: String,
        threats: Vec<String>,
    },

    #[error("Preview not supported")]
    PreviewNotSupported,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Object store error: {0}")]
    ObjectStore(ObjectStoreError),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Shorthand for a [`EngineError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the condition may clear up on its own (token refresh, backoff, network).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TokenExpired | Self::RateLimited { .. } | Self::Network(_)
        )
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::TokenExpired => Self::TokenExpired,
            ProviderError::RateLimited { retry_after_secs } => Self::RateLimited {
                retry_after_seconds: retry_after_secs,
            },
            ProviderError::Connection(msg) => Self::Network(msg),
            ProviderError::InvalidSignature => Self::InvalidWebhookSignature,
            ProviderError::Unsupported(op) => Self::UnsupportedOperation(op),
            ProviderError::InvalidState => Self::InvalidState,
            ProviderError::NotFound(id) => Self::not_found("remote resource", id),
            other => Self::Provider(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for EngineError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::QuotaExceeded { .. } => Self::StorageQuotaExceeded,
            other => Self::ObjectStore(other),
        }
    }
}

impl From<CryptoError> for EngineError {
    fn from(err: CryptoError) -> Self {
        Self::EncryptionFailed(err.to_string())
    }
}

impl From<VaultError> for EngineError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Crypto(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_messages_are_joined() {
        let err = EngineError::InvalidEmailData(vec![
            "Recipient email is required".to_string(),
            "Email content is required".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid email data: Recipient email is required, Email content is required"
        );
    }

    #[test]
    fn missing_configuration_lists_fields() {
        let err = EngineError::MissingConfiguration(vec![
            "clientId".to_string(),
            "clientSecret".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Missing required configuration: clientId, clientSecret"
        );
    }

    #[test]
    fn invalid_configuration_hides_detail() {
        let err = EngineError::InvalidConfiguration("clientId contains markup".to_string());
        assert_eq!(err.to_string(), "Invalid configuration format");
    }

    #[test]
    fn rate_limited_message() {
        let err = EngineError::RateLimited {
            retry_after_seconds: Some(30),
        };
        assert_eq!(err.to_string(), "Rate limited, retry after 30s");
        assert!(err.is_transient());

        let err = EngineError::RateLimited {
            retry_after_seconds: None,
        };
        assert_eq!(err.to_string(), "Rate limited");
    }

    #[test]
    fn provider_errors_convert() {
        assert!(matches!(
            EngineError::from(ProviderError::TokenExpired),
            EngineError::TokenExpired
        ));
        assert!(matches!(
            EngineError::from(ProviderError::Unsupported("sync".into())),
            EngineError::UnsupportedOperation(_)
        ));
        assert!(matches!(
            EngineError::from(ProviderError::RateLimited {
                retry_after_secs: Some(5)
            }),
            EngineError::RateLimited {
                retry_after_seconds: Some(5)
            }
        ));
    }

    #[test]
    fn quota_maps_to_storage_quota_exceeded() {
        let err = EngineError::from(ObjectStoreError::QuotaExceeded {
            requested: 10,
            available: 5,
        });
        assert!(matches!(err, EngineError::StorageQuotaExceeded));
    }

    #[test]
    fn validation_errors_are_not_transient() {
        assert!(!EngineError::InvalidState.is_transient());
        assert!(!EngineError::InvalidEmailData(vec![]).is_transient());
    }
}
