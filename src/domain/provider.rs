//! Provider connection domain types.
//!
//! A provider connection links a user to an external mail service. The
//! credentials are a tagged union keyed by provider type, and are only ever
//! persisted in sealed form.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ProviderId, Secret, UserId};

/// Supported mail providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gmail REST API with OAuth 2.0.
    Gmail,
    /// Microsoft Graph with OAuth 2.0.
    Outlook,
    /// Generic IMAP server, receive only.
    Imap,
    /// Generic SMTP relay, send only.
    Smtp,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [Self::Gmail, Self::Outlook, Self::Imap, Self::Smtp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Imap => "imap",
            Self::Smtp => "smtp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            "imap" => Some(Self::Imap),
            "smtp" => Some(Self::Smtp),
            _ => None,
        }
    }

    /// Static capability matrix.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Gmail => Capabilities {
                can_send: true,
                can_receive: true,
                supports_labels: true,
                supports_folders: false,
                supports_threads: true,
                supports_categories: false,
                supports_webhooks: true,
            },
            Self::Outlook => Capabilities {
                can_send: true,
                can_receive: true,
                supports_labels: false,
                supports_folders: true,
                supports_threads: true,
                supports_categories: true,
                supports_webhooks: true,
            },
            Self::Imap => Capabilities {
                can_send: false,
                can_receive: true,
                supports_labels: false,
                supports_folders: true,
                supports_threads: false,
                supports_categories: false,
                supports_webhooks: false,
            },
            Self::Smtp => Capabilities {
                can_send: true,
                can_receive: false,
                supports_labels: false,
                supports_folders: false,
                supports_threads: false,
                supports_categories: false,
                supports_webhooks: false,
            },
        }
    }

    pub fn supports(&self, feature: Feature) -> bool {
        self.capabilities().supports(feature)
    }

    /// Configuration fields that must be present, in camelCase wire form.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Gmail | Self::Outlook => &["clientId", "clientSecret", "refreshToken"],
            Self::Imap | Self::Smtp => &["host", "port", "username", "password"],
        }
    }

    /// Whether the provider authenticates through OAuth.
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Self::Gmail | Self::Outlook)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a provider can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_send: bool,
    pub can_receive: bool,
    pub supports_labels: bool,
    pub supports_folders: bool,
    pub supports_threads: bool,
    pub supports_categories: bool,
    pub supports_webhooks: bool,
}

impl Capabilities {
    pub fn supports(&self, feature: Feature) -> bool {
        match feature {
            Feature::Send => self.can_send,
            Feature::Receive => self.can_receive,
            Feature::Labels => self.supports_labels,
            Feature::Folders => self.supports_folders,
            Feature::Threads => self.supports_threads,
            Feature::Categories => self.supports_categories,
            Feature::Webhooks => self.supports_webhooks,
        }
    }
}

/// A single capability, for `supports` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Send,
    Receive,
    Labels,
    Folders,
    Threads,
    Categories,
    Webhooks,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Labels => "labels",
            Self::Folders => "folders",
            Self::Threads => "threads",
            Self::Categories => "categories",
            Self::Webhooks => "webhooks",
        };
        f.write_str(name)
    }
}

/// Google OAuth client plus the user's refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: Secret,
    pub refresh_token: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret>,
}

/// Microsoft identity platform client plus the user's refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrosoftCredentials {
    pub client_id: String,
    pub client_secret: Secret,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    pub refresh_token: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<Secret>,
}

fn default_tenant() -> String {
    "common".to_string()
}

/// Host/port/login settings shared by IMAP and SMTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCredentials {
    pub host: String,
    pub port: u16,
    /// Implicit TLS. For SMTP, `false` means STARTTLS.
    #[serde(default = "default_secure")]
    pub secure: bool,
    pub username: String,
    pub password: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

fn default_secure() -> bool {
    true
}

/// Provider credentials, keyed by provider type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderCredentials {
    Gmail(GoogleCredentials),
    Outlook(MicrosoftCredentials),
    Imap(ServerCredentials),
    Smtp(ServerCredentials),
}

impl ProviderCredentials {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Gmail(_) => ProviderKind::Gmail,
            Self::Outlook(_) => ProviderKind::Outlook,
            Self::Imap(_) => ProviderKind::Imap,
            Self::Smtp(_) => ProviderKind::Smtp,
        }
    }

    /// Login identity for server-based providers.
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Imap(s) | Self::Smtp(s) => Some(&s.username),
            Self::Gmail(_) | Self::Outlook(_) => None,
        }
    }
}

/// A persisted provider connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub user_id: UserId,
    pub kind: ProviderKind,
    /// Mailbox address of the connection.
    pub email: String,
    pub display_name: Option<String>,
    /// Vault-sealed [`ProviderCredentials`]. Never plaintext.
    #[serde(skip_serializing)]
    pub encrypted_credentials: String,
    pub is_active: bool,
    /// At most one default per user.
    pub is_default: bool,
    /// historyId, deltaLink or `uidvalidity:uid`, depending on the provider.
    pub sync_token: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProviderConfig {
    pub fn capabilities(&self) -> Capabilities {
        self.kind.capabilities()
    }
}

/// A push-notification subscription registered with a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: String,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub kind: ProviderKind,
    /// Provider-side subscription id (Graph) or the watched address (Gmail).
    pub subscription_id: String,
    pub resource: String,
    /// Shared value echoed back by Graph notifications.
    pub client_state: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
