//! Gmail API provider implementation.
//!
//! # API Usage
//!
//! This provider uses the Gmail API v1:
//! - `users.getProfile` for connection tests and the starting historyId
//! - `users.messages.list` and `users.messages.get?format=raw` for full sync
//! - `users.history.list` for incremental sync
//! - `users.messages.send` for sending emails
//! - `users.watch` and `users.stop` for Pub/Sub push notifications

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::http;
use super::mime;
use super::oauth::{OAuthFlow, TokenPersistence};
use super::{
    ConnectionStatus, EmailProvider, OutgoingEmail, ProviderError, Result, SyncBatch, SyncRequest,
    WebhookRegistration, WebhookTarget,
};
use crate::domain::{
    system_folders, Direction, FolderId, GoogleCredentials, NewEmail, ProviderId, ProviderKind,
    Secret,
};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Gmail profile response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
    history_id: Option<String>,
}

/// Gmail message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail message in `raw` format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    raw: String,
    internal_date: Option<String>,
}

/// Gmail history list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<History>>,
    history_id: Option<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct History {
    id: String,
    messages_added: Option<Vec<HistoryMessage>>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    topic_name: &'a str,
    label_ids: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    history_id: String,
    /// Milliseconds since the epoch, as a string.
    expiration: Option<String>,
}

/// Gmail API provider.
///
/// Holds the decrypted credentials for one connection and a cached access
/// token. A missing token is obtained on first use. Refreshed tokens go to
/// the connection's [`TokenPersistence`] when one is attached.
pub struct GmailProvider {
    client: reqwest::Client,
    oauth: Arc<OAuthFlow>,
    credentials: GoogleCredentials,
    api_base: String,
    /// Connected mailbox; used as the webhook resource.
    email: String,
    provider_id: Option<ProviderId>,
    access_token: RwLock<Option<Secret>>,
    refresh_secret: RwLock<Secret>,
    persistence: Option<TokenPersistence>,
}

impl GmailProvider {
    pub fn new(
        client: reqwest::Client,
        oauth: Arc<OAuthFlow>,
        credentials: GoogleCredentials,
        email: impl Into<String>,
    ) -> Self {
        let access_token = credentials.access_token.clone();
        let refresh_secret = credentials.refresh_token.clone();
        Self {
            client,
            oauth,
            credentials,
            api_base: GMAIL_API_BASE.to_string(),
            email: email.into(),
            provider_id: None,
            access_token: RwLock::new(access_token),
            refresh_secret: RwLock::new(refresh_secret),
            persistence: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Stamps synced emails with the connection they came from.
    pub fn for_connection(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn with_token_persistence(mut self, persistence: TokenPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Builds authorization headers, refreshing first if no token is cached.
    async fn auth_headers(&self) -> Result<HeaderMap> {
        if self.access_token.read().await.is_none() {
            self.refresh_token().await?;
        }
        let guard = self.access_token.read().await;
        let token = guard
            .as_ref()
            .ok_or_else(|| ProviderError::Authentication("not authenticated".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.expose()))
                .map_err(|e| ProviderError::Internal(format!("invalid header: {}", e)))?,
        );
        Ok(headers)
    }

    /// Makes an authenticated GET request to the Gmail API.
    async fn get<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        self.get_query(endpoint, &[]).await
    }

    async fn get_query<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, endpoint);
        let response = self
            .client
            .get(&url)
            .query(query)
            .headers(self.auth_headers().await?)
            .send()
            .await
            .map_err(http::connection_error)?;
        http::json(response).await
    }

    /// Makes an authenticated POST request to the Gmail API.
    async fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base, endpoint);
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers().await?)
            .json(body)
            .send()
            .await
            .map_err(http::connection_error)?;
        http::check(response).await
    }

    async fn fetch_message(&self, id: &str) -> Result<Option<NewEmail>> {
        let message: RawMessage = self
            .get(&format!("/messages/{}?format=raw", id))
            .await?;
        Ok(self.to_new_email(message))
    }

    fn to_new_email(&self, message: RawMessage) -> Option<NewEmail> {
        let raw = decode_raw(&message.raw)?;
        let Some(parsed) = mime::parse_raw(&raw) else {
            warn!(message_id = %message.id, "Skipping unparseable Gmail message");
            return None;
        };

        let labels = message.label_ids.unwrap_or_default();
        let has = |label: &str| labels.iter().any(|l| l == label);
        let direction = if has("SENT") {
            Direction::Outbound
        } else {
            Direction::Inbound
        };

        let fallback_date = parsed.date;
        let mut email = parsed.into_new_email(direction);
        email.provider_id = self.provider_id.clone();
        email.provider_message_id = Some(message.id);
        email.thread_id = message.thread_id;
        email.is_read = !has("UNREAD");
        email.is_starred = has("STARRED");
        email.is_important = has("IMPORTANT");
        email.folder_id = folder_for_labels(&labels);
        email.timestamp = message
            .internal_date
            .as_deref()
            .and_then(parse_millis)
            .or(fallback_date);
        Some(email)
    }

    async fn full_sync(&self, max_results: u32) -> Result<SyncBatch> {
        let profile: Profile = self.get("/profile").await?;
        let list: MessageListResponse = self
            .get(&format!("/messages?maxResults={}", max_results))
            .await?;

        let mut emails = Vec::new();
        for message in list.messages.unwrap_or_default() {
            if let Some(email) = self.fetch_message(&message.id).await? {
                emails.push(email);
            }
        }
        debug!(count = emails.len(), "Gmail full sync fetched messages");
        Ok(SyncBatch {
            emails,
            next_token: profile.history_id,
        })
    }

    /// Walks `history.list` pages until the mailbox head or `max_results`
    /// new messages. A capped pass returns the last history record it
    /// consumed, so the next pass resumes there instead of at the head.
    async fn incremental_sync(&self, history_id: &str, max_results: u32) -> Result<SyncBatch> {
        let limit = max_results.max(1) as usize;
        let page_size = max_results.max(1).to_string();
        let mut ids: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut last_record: Option<String> = None;

        let cursor = 'pages: loop {
            let mut query = vec![
                ("startHistoryId", history_id),
                ("historyTypes", "messageAdded"),
                ("maxResults", page_size.as_str()),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: HistoryListResponse = self.get_query("/history", &query).await?;

            for record in page.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if seen.insert(added.message.id.clone()) {
                        ids.push(added.message.id);
                    }
                }
                last_record = Some(record.id);
                if ids.len() >= limit && page.next_page_token.is_some() {
                    break 'pages last_record;
                }
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break page.history_id.or(last_record),
            }
        };
        debug!(count = ids.len(), "Gmail history listed added messages");

        let mut emails = Vec::new();
        for id in ids {
            match self.fetch_message(&id).await {
                Ok(Some(email)) => emails.push(email),
                Ok(None) => {}
                // Added then deleted before we got to it.
                Err(ProviderError::NotFound(_)) => debug!(message_id = %id, "Message vanished"),
                Err(e) => return Err(e),
            }
        }
        Ok(SyncBatch {
            emails,
            next_token: cursor.or_else(|| Some(history_id.to_string())),
        })
    }
}

fn folder_for_labels(labels: &[String]) -> Option<FolderId> {
    let folder = if labels.iter().any(|l| l == "TRASH") {
        system_folders::TRASH
    } else if labels.iter().any(|l| l == "SPAM") {
        system_folders::SPAM
    } else if labels.iter().any(|l| l == "DRAFT") {
        system_folders::DRAFTS
    } else if labels.iter().any(|l| l == "SENT") {
        system_folders::SENT
    } else if labels.iter().any(|l| l == "INBOX") {
        system_folders::INBOX
    } else {
        system_folders::ARCHIVE
    };
    Some(FolderId::from(folder))
}

/// Gmail returns base64url, with or without padding.
fn decode_raw(raw: &str) -> Option<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| warn!(error = %e, "Invalid base64 in Gmail raw message"))
        .ok()
}

fn parse_millis(value: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value.parse().ok()?)
}

#[async_trait]
impl EmailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        let profile: Profile = self.get("/profile").await?;
        Ok(ConnectionStatus {
            connected: true,
            identity: Some(profile.email_address),
        })
    }

    async fn refresh_token(&self) -> Result<()> {
        let current = self.refresh_secret.read().await.clone();
        let tokens = self
            .oauth
            .refresh(
                ProviderKind::Gmail,
                &self.credentials.client_id,
                &self.credentials.client_secret,
                "",
                &current,
            )
            .await?;
        *self.access_token.write().await = Some(tokens.access_token.clone());
        if let Some(rotated) = &tokens.refresh_token {
            *self.refresh_secret.write().await = rotated.clone();
        }
        if let Some(persistence) = &self.persistence {
            persistence.store(&tokens).await;
        }
        Ok(())
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let (message, _) = mime::build_message(email)?;
        let encoded = BASE64_URL_SAFE_NO_PAD.encode(message.formatted());

        #[derive(Serialize)]
        struct SendRequest {
            raw: String,
        }

        #[derive(Deserialize)]
        struct SendResponse {
            id: String,
        }

        let response: SendResponse = self
            .post("/messages/send", &SendRequest { raw: encoded })
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))?;

        info!(message_id = %response.id, "Email sent via Gmail API");
        Ok(response.id)
    }

    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        match (request.incremental, request.since_token.as_deref()) {
            (true, Some(history_id)) => {
                match self.incremental_sync(history_id, request.max_results).await {
                    // historyId too old; Gmail asks for a full resync.
                    Err(ProviderError::NotFound(_)) => {
                        warn!("Gmail history expired, falling back to full sync");
                        self.full_sync(request.max_results).await
                    }
                    other => other,
                }
            }
            _ => self.full_sync(request.max_results).await,
        }
    }

    async fn register_webhook(&self, target: &WebhookTarget) -> Result<WebhookRegistration> {
        let topic = target.topic.as_deref().ok_or_else(|| {
            ProviderError::InvalidRequest("Gmail watch requires a Pub/Sub topic".to_string())
        })?;
        let response: WatchResponse = self
            .post(
                "/watch",
                &WatchRequest {
                    topic_name: topic,
                    label_ids: vec!["INBOX"],
                },
            )
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))?;

        info!(history_id = %response.history_id, "Gmail watch registered");
        Ok(WebhookRegistration {
            subscription_id: self.email.clone(),
            resource: topic.to_string(),
            expires_at: response.expiration.as_deref().and_then(parse_millis),
        })
    }

    async fn unregister_webhook(&self, _subscription_id: &str) -> Result<()> {
        self.post("/stop", &serde_json::json!({})).await?;
        info!("Gmail watch stopped");
        Ok(())
    }
}
