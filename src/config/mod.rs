//! Configuration and settings management.
//!
//! [`EngineConfig`] is the process-wide configuration, stored in the user's
//! config directory as JSON. [`user_settings`] holds the per-user settings
//! document managed by the settings service.

mod engine;
pub mod user_settings;

pub use engine::{
    AttachmentLimits, BackupDefaults, BulkSendConfig, BusinessProfile, ConfigError, EngineConfig,
    OAuthConfig, SyncConfig, WebhookConfig, DATA_DIR_ENV, LOG_ENV,
};
pub use user_settings::{NotificationKind, UserEmailSettings};
