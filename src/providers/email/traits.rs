//! Email provider trait definition.
//!
//! This module defines the [`EmailProvider`] trait which abstracts over the
//! supported mail backends (Gmail API, Microsoft Graph, IMAP, SMTP). Every
//! adapter implements it so the management and sync services can drive any
//! connection the same way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, Capabilities, Feature, NewEmail, ProviderKind};

/// Result type alias for email provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during email provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Credentials were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The access token is no longer valid. A refresh may fix it.
    #[error("access token expired")]
    TokenExpired,

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// OAuth state did not match an issued, unexpired state.
    #[error("invalid OAuth state")]
    InvalidState,

    /// Webhook signature missing or wrong.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// The provider cannot perform this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether one remediation attempt (refresh or wait) may help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::RateLimited { .. })
    }
}

/// Outcome of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    /// Mailbox address or login the provider reports.
    pub identity: Option<String>,
}

/// An email to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    /// Sender mailbox. Gmail and Graph ignore it in favour of the account.
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Message-ID of the email being replied to.
    pub in_reply_to: Option<String>,
    pub attachments: Vec<OutgoingAttachment>,
}

/// An attachment to be sent with an outgoing email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingAttachment {
    /// Filename for the attachment.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Raw attachment data.
    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
}

mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

/// Parameters for a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Continue from `since_token` instead of listing from scratch.
    pub incremental: bool,
    /// historyId, deltaLink or `uidvalidity:uid` from the previous pass.
    pub since_token: Option<String>,
    /// Upper bound on messages fetched in one pass.
    pub max_results: u32,
}

impl SyncRequest {
    pub fn full(max_results: u32) -> Self {
        Self {
            incremental: false,
            since_token: None,
            max_results,
        }
    }

    /// Incremental when a token is available, full otherwise.
    pub fn since(token: Option<String>, max_results: u32) -> Self {
        Self {
            incremental: token.is_some(),
            since_token: token,
            max_results,
        }
    }
}

/// Messages fetched by a sync pass and the token to continue from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub emails: Vec<NewEmail>,
    pub next_token: Option<String>,
}

/// Where a provider should deliver push notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    /// HTTPS endpoint for Graph notifications.
    pub callback_url: String,
    /// Echoed back in Graph notifications.
    pub client_state: String,
    /// Pub/Sub topic for Gmail watches.
    pub topic: Option<String>,
}

/// A subscription the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub subscription_id: String,
    pub resource: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Trait for email provider implementations.
///
/// Operations a provider cannot perform return
/// [`ProviderError::Unsupported`]; callers check [`EmailProvider::capabilities`]
/// first so they can fail before any network call.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Returns the type of this provider.
    fn kind(&self) -> ProviderKind;

    /// Static capability matrix for this provider.
    fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    fn supports(&self, feature: Feature) -> bool {
        self.capabilities().supports(feature)
    }

    /// Performs a lightweight handshake and reports the identity.
    async fn test_connection(&self) -> Result<ConnectionStatus>;

    /// Obtains a fresh access token. A no-op for password-based providers.
    async fn refresh_token(&self) -> Result<()> {
        Ok(())
    }

    /// Sends an email and returns the provider's message id.
    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let _ = email;
        Err(ProviderError::Unsupported(format!("{} cannot send", self.kind())))
    }

    /// Fetches messages, incrementally when the request carries a token.
    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        let _ = request;
        Err(ProviderError::Unsupported(format!("{} cannot receive", self.kind())))
    }

    /// Registers for push notifications.
    async fn register_webhook(&self, target: &WebhookTarget) -> Result<WebhookRegistration> {
        let _ = target;
        Err(ProviderError::Unsupported(format!("{} has no webhooks", self.kind())))
    }

    /// Cancels a push subscription.
    async fn unregister_webhook(&self, subscription_id: &str) -> Result<()> {
        let _ = subscription_id;
        Err(ProviderError::Unsupported(format!("{} has no webhooks", self.kind())))
    }
}
