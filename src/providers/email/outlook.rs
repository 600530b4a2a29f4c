//! Microsoft Graph provider implementation.
//!
//! Uses `/me` for connection tests, `/me/sendMail` for sending, the
//! `/me/mailFolders/inbox/messages/delta` query for sync and
//! `/subscriptions` for change notifications.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::http;
use super::mime;
use super::oauth::{OAuthFlow, TokenPersistence};
use super::{
    ConnectionStatus, EmailProvider, OutgoingEmail, ProviderError, Result, SyncBatch, SyncRequest,
    WebhookRegistration, WebhookTarget,
};
use crate::domain::{
    Address, Direction, EmailContent, MicrosoftCredentials, NewEmail, ProviderId, ProviderKind,
    Recipients, Secret,
};

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph caps mail subscriptions at just under three days.
const SUBSCRIPTION_MINUTES: i64 = 4230;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

impl GraphRecipient {
    fn to_address(&self) -> Option<Address> {
        let email = self.email_address.address.clone()?;
        Some(Address {
            email,
            name: self.email_address.name.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    internet_message_id: Option<String>,
    conversation_id: Option<String>,
    subject: Option<String>,
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    body: Option<GraphBody>,
    received_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    is_read: bool,
    importance: Option<String>,
    flag: Option<GraphFlag>,
    #[serde(default)]
    categories: Vec<String>,
    /// Present on delta entries for deleted messages.
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFlag {
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest<'a> {
    change_type: &'a str,
    notification_url: &'a str,
    resource: &'a str,
    expiration_date_time: DateTime<Utc>,
    client_state: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    resource: String,
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Microsoft Graph provider.
pub struct OutlookProvider {
    client: reqwest::Client,
    oauth: Arc<OAuthFlow>,
    credentials: MicrosoftCredentials,
    api_base: String,
    provider_id: Option<ProviderId>,
    access_token: RwLock<Option<Secret>>,
    refresh_secret: RwLock<Secret>,
    persistence: Option<TokenPersistence>,
}

impl OutlookProvider {
    pub fn new(
        client: reqwest::Client,
        oauth: Arc<OAuthFlow>,
        credentials: MicrosoftCredentials,
    ) -> Self {
        let access_token = credentials.access_token.clone();
        let refresh_secret = credentials.refresh_token.clone();
        Self {
            client,
            oauth,
            credentials,
            api_base: GRAPH_API_BASE.to_string(),
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

    pub fn for_connection(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    /// Where refreshed tokens are written back to.
    pub fn with_token_persistence(mut self, persistence: TokenPersistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

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

    /// GET against an absolute URL (delta links are absolute).
    async fn get_url<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers().await?)
            .send()
            .await
            .map_err(http::connection_error)?;
        http::json(response).await
    }

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

    fn to_new_email(&self, message: GraphMessage, mailbox: Option<&str>) -> NewEmail {
        let sender = message
            .from
            .as_ref()
            .and_then(GraphRecipient::to_address)
            .unwrap_or_else(|| Address::new(""));
        let direction = match mailbox {
            Some(own) if sender.email.eq_ignore_ascii_case(own) => Direction::Outbound,
            _ => Direction::Inbound,
        };

        let content = match message.body {
            Some(GraphBody {
                content_type: Some(kind),
                content: Some(body),
            }) if kind.eq_ignore_ascii_case("html") => EmailContent::html(body),
            Some(GraphBody {
                content: Some(body), ..
            }) => EmailContent::text(body),
            _ => EmailContent::default(),
        };

        let mut email = match direction {
            Direction::Inbound => NewEmail::inbound(sender, message.subject.unwrap_or_default()),
            Direction::Outbound => NewEmail::outbound(sender, message.subject.unwrap_or_default()),
        };
        email.recipients = Recipients {
            to: message.to_recipients.iter().filter_map(GraphRecipient::to_address).collect(),
            cc: message.cc_recipients.iter().filter_map(GraphRecipient::to_address).collect(),
            bcc: Vec::new(),
        };
        email.content = content;
        email.provider_id = self.provider_id.clone();
        email.provider_message_id = Some(message.internet_message_id.unwrap_or(message.id));
        email.thread_id = message.conversation_id;
        email.is_read = message.is_read || direction == Direction::Outbound;
        email.is_important = message
            .importance
            .is_some_and(|i| i.eq_ignore_ascii_case("high"));
        email.is_starred = message
            .flag
            .and_then(|f| f.flag_status)
            .is_some_and(|s| s.eq_ignore_ascii_case("flagged"));
        email.labels = message.categories;
        email.timestamp = message.received_date_time;
        email
    }
}

fn recipients_json(addresses: &[Address]) -> Vec<serde_json::Value> {
    addresses
        .iter()
        .map(|a| json!({ "emailAddress": { "address": a.email, "name": a.name } }))
        .collect()
}

fn send_payload(email: &OutgoingEmail, message_id: &str) -> serde_json::Value {
    let (content_type, content) = match (&email.body_html, &email.body_text) {
        (Some(html), _) => ("HTML", html.clone()),
        (None, Some(text)) => ("Text", text.clone()),
        (None, None) => ("Text", String::new()),
    };
    let attachments: Vec<_> = email
        .attachments
        .iter()
        .map(|a| {
            json!({
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": a.filename,
                "contentType": a.content_type,
                "contentBytes": BASE64_STANDARD.encode(&a.data),
            })
        })
        .collect();

    json!({
        "message": {
            "subject": email.subject,
            "body": { "contentType": content_type, "content": content },
            "toRecipients": recipients_json(&email.to),
            "ccRecipients": recipients_json(&email.cc),
            "bccRecipients": recipients_json(&email.bcc),
            "internetMessageId": message_id,
            "attachments": attachments,
        },
        "saveToSentItems": true,
    })
}

#[async_trait]
impl EmailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        let user: GraphUser = self.get_url(&format!("{}/me", self.api_base)).await?;
        Ok(ConnectionStatus {
            connected: true,
            identity: user.mail.or(user.user_principal_name),
        })
    }

    /// Microsoft rotates refresh tokens on most refreshes.
    async fn refresh_token(&self) -> Result<()> {
        let current = self.refresh_secret.read().await.clone();
        let tokens = self
            .oauth
            .refresh(
                ProviderKind::Outlook,
                &self.credentials.client_id,
                &self.credentials.client_secret,
                &self.credentials.tenant_id,
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

    /// `sendMail` returns 202 with no body, so the id is generated locally.
    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let message_id = mime::generate_message_id();
        self.post("/me/sendMail", &send_payload(email, &message_id))
            .await?;
        info!(message_id = %message_id, "Email sent via Microsoft Graph");
        Ok(message_id)
    }

    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        let mut url = match (request.incremental, &request.since_token) {
            (true, Some(delta_link)) => delta_link.clone(),
            _ => format!(
                "{}/me/mailFolders/inbox/messages/delta?$top={}",
                self.api_base,
                request.max_results.min(50)
            ),
        };
        let mailbox = self.test_connection().await.ok().and_then(|s| s.identity);

        let mut emails = Vec::new();
        loop {
            let page: DeltaPage = self.get_url(&url).await?;
            for message in page.value {
                if message.removed.is_some() {
                    continue;
                }
                emails.push(self.to_new_email(message, mailbox.as_deref()));
            }
            if let Some(delta) = page.delta_link {
                debug!(count = emails.len(), "Graph delta sync complete");
                return Ok(SyncBatch {
                    emails,
                    next_token: Some(delta),
                });
            }
            match page.next_link {
                Some(next) if (emails.len() as u32) < request.max_results => url = next,
                // Resume from the next page on the following pass.
                Some(next) => {
                    return Ok(SyncBatch {
                        emails,
                        next_token: Some(next),
                    })
                }
                None => {
                    return Ok(SyncBatch {
                        emails,
                        next_token: request.since_token.clone(),
                    })
                }
            }
        }
    }

    async fn register_webhook(&self, target: &WebhookTarget) -> Result<WebhookRegistration> {
        let body = SubscriptionRequest {
            change_type: "created",
            notification_url: &target.callback_url,
            resource: "me/mailFolders('Inbox')/messages",
            expiration_date_time: Utc::now() + Duration::minutes(SUBSCRIPTION_MINUTES),
            client_state: &target.client_state,
        };
        let subscription: SubscriptionResponse = self
            .post("/subscriptions", &body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse response: {}", e)))?;

        info!(subscription_id = %subscription.id, "Graph subscription created");
        Ok(WebhookRegistration {
            subscription_id: subscription.id,
            resource: subscription.resource,
            expires_at: subscription.expiration_date_time,
        })
    }

    async fn unregister_webhook(&self, subscription_id: &str) -> Result<()> {
        let url = format!("{}/subscriptions/{}", self.api_base, subscription_id);
        let response = self
            .client
            .delete(&url)
            .headers(self.auth_headers().await?)
            .send()
            .await
            .map_err(http::connection_error)?;
        match http::check(response).await {
            // Already expired on the Graph side.
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::{OAuthEndpoints, OutgoingAttachment};

    fn provider() -> OutlookProvider {
        OutlookProvider::new(
            reqwest::Client::new(),
            Arc::new(OAuthFlow::new(reqwest::Client::new(), OAuthEndpoints::default())),
            MicrosoftCredentials {
                client_id: "client".into(),
                client_secret: Secret::new("secret"),
                tenant_id: "common".into(),
                refresh_token: Secret::new("refresh"),
                access_token: Some(Secret::new("access")),
            },
        )
        .for_connection(ProviderId::from("p2"))
    }

    fn graph_message() -> GraphMessage {
        serde_json::from_value(json!({
            "id": "AAMk1",
            "internetMessageId": "<m1@contoso.com>",
            "conversationId": "c1",
            "subject": "Invoice question",
            "from": { "emailAddress": { "address": "bob@contoso.com", "name": "Bob" } },
            "toRecipients": [ { "emailAddress": { "address": "me@contoso.com" } } ],
            "body": { "contentType": "html", "content": "<p>Hi</p>" },
            "receivedDateTime": "2025-07-01T09:30:00Z",
            "isRead": false,
            "importance": "high",
            "flag": { "flagStatus": "flagged" },
            "categories": ["Clients"]
        }))
        .unwrap()
    }

    #[test]
    fn graph_message_maps_to_new_email() {
        let email = provider().to_new_email(graph_message(), Some("me@contoso.com"));

        assert_eq!(email.direction, Direction::Inbound);
        assert_eq!(email.sender, Address::with_name("bob@contoso.com", "Bob"));
        assert_eq!(email.provider_message_id.as_deref(), Some("<m1@contoso.com>"));
        assert_eq!(email.thread_id.as_deref(), Some("c1"));
        assert_eq!(email.content.html.as_deref(), Some("<p>Hi</p>"));
        assert!(email.is_important);
        assert!(email.is_starred);
        assert!(!email.is_read);
        assert_eq!(email.labels, vec!["Clients".to_string()]);
        assert!(email.validation_errors().is_empty());
    }

    #[test]
    fn own_messages_are_outbound() {
        let email = provider().to_new_email(graph_message(), Some("BOB@contoso.com"));
        assert_eq!(email.direction, Direction::Outbound);
        assert!(email.is_read);
    }

    #[test]
    fn removed_entries_deserialize() {
        let page: DeltaPage = serde_json::from_value(json!({
            "value": [ { "id": "x", "@removed": { "reason": "deleted" } } ],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/delta?token=abc"
        }))
        .unwrap();
        assert!(page.value[0].removed.is_some());
        assert!(page.delta_link.is_some());
    }

    #[test]
    fn send_payload_prefers_html_and_encodes_attachments() {
        let email = OutgoingEmail {
            from: Address::new("me@contoso.com"),
            to: vec![Address::with_name("bob@contoso.com", "Bob")],
            cc: vec![],
            bcc: vec![],
            subject: "Quote Q-7".into(),
            body_text: Some("plain".into()),
            body_html: Some("<b>rich</b>".into()),
            in_reply_to: None,
            attachments: vec![OutgoingAttachment {
                filename: "q.pdf".into(),
                content_type: "application/pdf".into(),
                data: b"PDF".to_vec(),
            }],
        };
        let payload = send_payload(&email, "<id@courier.local>");

        assert_eq!(payload["message"]["body"]["contentType"], "HTML");
        assert_eq!(
            payload["message"]["toRecipients"][0]["emailAddress"]["address"],
            "bob@contoso.com"
        );
        assert_eq!(payload["message"]["attachments"][0]["contentBytes"], "UERG");
        assert_eq!(payload["message"]["internetMessageId"], "<id@courier.local>");
    }

    #[tokio::test]
    async fn expired_access_token_refresh_keeps_the_rotated_refresh_token() {
        let server = crate::providers::email::test_server::TestServer::start(vec![
            (
                "/oauth2/v2.0/token",
                json!({ "access_token": "fresh", "refresh_token": "rotated" }).to_string(),
            ),
            ("/me", json!({ "mail": "me@contoso.com" }).to_string()),
        ])
        .await;
        let endpoints = OAuthEndpoints {
            microsoft_authority: server.base().to_string(),
            ..OAuthEndpoints::default()
        };
        let provider = OutlookProvider::new(
            reqwest::Client::new(),
            Arc::new(OAuthFlow::new(reqwest::Client::new(), endpoints)),
            MicrosoftCredentials {
                client_id: "client".into(),
                client_secret: Secret::new("secret"),
                tenant_id: "common".into(),
                refresh_token: Secret::new("original"),
                access_token: None,
            },
        )
        .with_api_base(server.base());

        let status = provider.test_connection().await.unwrap();
        assert_eq!(status.identity.as_deref(), Some("me@contoso.com"));
        provider.refresh_token().await.unwrap();

        assert_eq!(*provider.refresh_secret.read().await, Secret::new("rotated"));
        let bodies = server.bodies();
        assert!(bodies[0].contains("refresh_token=original"));
        assert!(bodies.last().unwrap().contains("refresh_token=rotated"));
    }
}
