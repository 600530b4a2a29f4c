//! Email provider implementations.
//!
//! This module contains the [`EmailProvider`] trait and implementations for
//! the supported backends:
//!
//! - [`GmailProvider`] - Gmail REST API with OAuth 2.0
//! - [`OutlookProvider`] - Microsoft Graph with OAuth 2.0
//! - [`ImapProvider`] - IMAP over implicit TLS, receive only
//! - [`SmtpProvider`] - SMTP relay, send only
//!
//! Around the adapters sit the OAuth flow ([`OAuthFlow`]), webhook
//! verification ([`WebhookVerifier`]), the one-shot remediation helper
//! ([`with_remediation`]) and the [`ProviderConnector`] seam the services use
//! to obtain live adapters.

mod factory;
mod gmail;
pub mod http;
mod imap;
pub mod mime;
mod oauth;
mod outlook;
mod remediation;
mod smtp;
#[cfg(test)]
pub(crate) mod test_server;
mod traits;
mod webhook;

pub use factory::{ApiEndpoints, ProviderConnector, ProviderFactory};
pub use gmail::GmailProvider;
pub use imap::{ImapProvider, UidCursor};
pub use oauth::{
    AuthorizationRequest, OAuthClient, OAuthEndpoints, OAuthFlow, RedeemedState, TokenPersistence,
    TokenSet, TokenSink, STATE_TTL_MINUTES,
};
pub use outlook::OutlookProvider;
pub use remediation::{with_remediation, MAX_INLINE_WAIT_SECS};
pub use smtp::SmtpProvider;
pub use traits::{
    ConnectionStatus, EmailProvider, OutgoingAttachment, OutgoingEmail, ProviderError, Result,
    SyncBatch, SyncRequest, WebhookRegistration, WebhookTarget,
};
pub use webhook::{parse_event, GraphNotification, WebhookDelivery, WebhookEvent, WebhookVerifier};
