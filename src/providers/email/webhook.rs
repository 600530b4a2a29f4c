//! Webhook signature verification and payload decoding.
//!
//! Deliveries are signed with HMAC-SHA256 over the raw body using a secret
//! shared per provider. The signature travels hex-encoded, optionally
//! prefixed with `sha256=`.

use std::collections::HashMap;

use base64::prelude::*;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ProviderError, Result};
use crate::domain::{ProviderKind, Secret};

/// An inbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub provider: ProviderKind,
    pub body: String,
    pub signature: Option<String>,
}

/// What a verified delivery is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    /// Gmail Pub/Sub push: new history for a mailbox.
    Gmail {
        email_address: String,
        history_id: String,
    },
    /// Graph change notifications.
    Outlook(Vec<GraphNotification>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNotification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub resource: String,
}

#[derive(Debug, Deserialize)]
struct PubSubEnvelope {
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPush {
    email_address: String,
    history_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphEnvelope {
    value: Vec<GraphNotification>,
}

/// HMAC-SHA256 signer and verifier keyed per provider.
pub struct WebhookVerifier {
    keys: HashMap<ProviderKind, hmac::Key>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("providers", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secrets: &HashMap<ProviderKind, Secret>) -> Self {
        let keys = secrets
            .iter()
            .filter(|(_, secret)| !secret.is_empty())
            .map(|(kind, secret)| {
                (
                    *kind,
                    hmac::Key::new(hmac::HMAC_SHA256, secret.expose().as_bytes()),
                )
            })
            .collect();
        Self { keys }
    }

    /// Hex signature for `body`. Used by tests and local relays.
    pub fn sign(&self, provider: ProviderKind, body: &[u8]) -> Result<String> {
        let key = self.key(provider)?;
        Ok(hex_encode(hmac::sign(key, body).as_ref()))
    }

    /// Checks the delivery's signature in constant time.
    pub fn verify(&self, delivery: &WebhookDelivery) -> Result<()> {
        let key = self.key(delivery.provider)?;
        let Some(signature) = delivery.signature.as_deref() else {
            warn!(provider = %delivery.provider, "Rejected unsigned webhook");
            return Err(ProviderError::InvalidSignature);
        };
        let signature = signature.trim();
        let hex = signature.strip_prefix("sha256=").unwrap_or(signature);
        let tag = hex_decode(hex).ok_or(ProviderError::InvalidSignature)?;

        hmac::verify(key, delivery.body.as_bytes(), &tag).map_err(|_| {
            warn!(provider = %delivery.provider, "Rejected webhook with bad signature");
            ProviderError::InvalidSignature
        })
    }

    /// Verifies, then decodes the payload.
    pub fn open(&self, delivery: &WebhookDelivery) -> Result<WebhookEvent> {
        self.verify(delivery)?;
        parse_event(delivery.provider, &delivery.body)
    }

    fn key(&self, provider: ProviderKind) -> Result<&hmac::Key> {
        // No secret configured: nothing can be verified, so nothing is accepted.
        self.keys.get(&provider).ok_or(ProviderError::InvalidSignature)
    }
}

/// Decodes a verified payload.
pub fn parse_event(provider: ProviderKind, body: &str) -> Result<WebhookEvent> {
    let invalid = |e: String| ProviderError::InvalidRequest(format!("webhook payload: {}", e));
    match provider {
        ProviderKind::Gmail => {
            let envelope: PubSubEnvelope =
                serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
            let data = BASE64_STANDARD
                .decode(envelope.message.data.trim())
                .or_else(|_| BASE64_URL_SAFE.decode(envelope.message.data.trim()))
                .map_err(|e| invalid(e.to_string()))?;
            let push: GmailPush =
                serde_json::from_slice(&data).map_err(|e| invalid(e.to_string()))?;
            // historyId arrives as a number or a string.
            let history_id = match push.history_id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            Ok(WebhookEvent::Gmail {
                email_address: push.email_address,
                history_id,
            })
        }
        ProviderKind::Outlook => {
            let envelope: GraphEnvelope =
                serde_json::from_str(body).map_err(|e| invalid(e.to_string()))?;
            Ok(WebhookEvent::Outlook(envelope.value))
        }
        other => Err(ProviderError::Unsupported(format!("{} has no webhooks", other))),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
