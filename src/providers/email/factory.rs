//! Builds live adapters from stored connections.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::gmail::{GmailProvider, GMAIL_API_BASE};
use super::imap::ImapProvider;
use super::oauth::{OAuthFlow, TokenPersistence, TokenSink};
use super::outlook::{OutlookProvider, GRAPH_API_BASE};
use super::smtp::SmtpProvider;
use super::{EmailProvider, ProviderError, Result};
use crate::domain::{ProviderConfig, ProviderCredentials};

/// REST API roots. Overridden in tests and for sovereign clouds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiEndpoints {
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            gmail_api_base: GMAIL_API_BASE.to_string(),
            graph_api_base: GRAPH_API_BASE.to_string(),
        }
    }
}

/// Turns a connection and its decrypted credentials into a provider.
///
/// Services depend on this trait so tests can hand out fakes.
pub trait ProviderConnector: Send + Sync {
    fn connect(
        &self,
        config: &ProviderConfig,
        credentials: ProviderCredentials,
    ) -> Result<Arc<dyn EmailProvider>>;
}

/// Connector for the real Gmail, Graph, IMAP and SMTP adapters.
pub struct ProviderFactory {
    http: reqwest::Client,
    oauth: Arc<OAuthFlow>,
    endpoints: ApiEndpoints,
    token_sink: Option<Arc<dyn TokenSink>>,
}

impl ProviderFactory {
    pub fn new(http: reqwest::Client, oauth: Arc<OAuthFlow>, endpoints: ApiEndpoints) -> Self {
        Self {
            http,
            oauth,
            endpoints,
            token_sink: None,
        }
    }

    /// OAuth adapters write tokens they refresh on their own to `sink`.
    pub fn with_token_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.token_sink = Some(sink);
        self
    }

    fn persistence(&self, config: &ProviderConfig) -> Option<TokenPersistence> {
        self.token_sink.as_ref().map(|sink| {
            TokenPersistence::new(Arc::clone(sink), config.user_id.clone(), config.id.clone())
        })
    }
}

impl ProviderConnector for ProviderFactory {
    fn connect(
        &self,
        config: &ProviderConfig,
        credentials: ProviderCredentials,
    ) -> Result<Arc<dyn EmailProvider>> {
        if credentials.kind() != config.kind {
            return Err(ProviderError::InvalidRequest(format!(
                "credentials are for {}, connection is {}",
                credentials.kind(),
                config.kind
            )));
        }

        let provider: Arc<dyn EmailProvider> = match credentials {
            ProviderCredentials::Gmail(creds) => {
                let mut gmail =
                    GmailProvider::new(self.http.clone(), self.oauth.clone(), creds, &config.email)
                        .with_api_base(&self.endpoints.gmail_api_base)
                        .for_connection(config.id.clone());
                if let Some(persistence) = self.persistence(config) {
                    gmail = gmail.with_token_persistence(persistence);
                }
                Arc::new(gmail)
            }
            ProviderCredentials::Outlook(creds) => {
                let mut outlook = OutlookProvider::new(self.http.clone(), self.oauth.clone(), creds)
                    .with_api_base(&self.endpoints.graph_api_base)
                    .for_connection(config.id.clone());
                if let Some(persistence) = self.persistence(config) {
                    outlook = outlook.with_token_persistence(persistence);
                }
                Arc::new(outlook)
            }
            ProviderCredentials::Imap(creds) => {
                Arc::new(ImapProvider::new(creds)?.for_connection(config.id.clone()))
            }
            ProviderCredentials::Smtp(creds) => Arc::new(SmtpProvider::new(creds)?),
        };
        Ok(provider)
    }
}
