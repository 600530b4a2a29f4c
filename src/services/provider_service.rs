//! Provider connection management.
//!
//! Owns everything about a user's connections to external mail services:
//!
//! - validating and persisting connection settings, with every secret sealed
//!   by the [`CredentialVault`] before it reaches the database
//! - the OAuth authorize/callback/refresh/revoke sequence
//! - webhook registration and verification of inbound notifications
//! - a cache of live adapters, dropped whenever a connection changes
//! - connection statistics and usage tracking

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use crate::config::{OAuthConfig, WebhookConfig};
use crate::domain::{
    is_valid_email, EmailActivity, Feature, ProviderConfig, ProviderCredentials, ProviderId,
    ProviderKind, Secret, SyncHistoryEntry, UserId, WebhookSubscription,
};
use crate::error::{EngineError, Result};
use crate::providers::email::{
    with_remediation, AuthorizationRequest, ConnectionStatus, EmailProvider, OAuthClient,
    OAuthFlow, ProviderConnector, ProviderError, TokenSet, TokenSink, WebhookDelivery,
    WebhookEvent, WebhookTarget, WebhookVerifier,
};
use crate::storage::queries::{self, providers::ProviderUpdate};
use crate::storage::{CredentialVault, Database, KeychainAccess};

/// A new connection as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSetup {
    /// Provider type name, e.g. `gmail`.
    pub provider: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Provider settings in camelCase wire form, secrets included.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Changes to an existing connection. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderChanges {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_active: Option<bool>,
    /// Settings to merge over the stored ones.
    pub config: Option<Map<String, Value>>,
}

/// Parameters of an OAuth redirect back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCallback {
    pub code: String,
    pub state: String,
    /// The state the caller stored when it started the flow.
    pub expected_state: String,
}

/// Tokens obtained by a callback, with the user the flow was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthGrant {
    pub user_id: UserId,
    pub kind: ProviderKind,
    pub tokens: TokenSet,
}

/// Health of one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub total_emails: u64,
    pub synced_today: u64,
    pub last_sync_time: Option<chrono::DateTime<Utc>>,
    pub error_count: u64,
    /// Percentage of successful syncs; 100 when none have run.
    pub success_rate: f64,
}

/// One provider operation, for usage tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub operation: String,
    pub email_count: u64,
    pub duration_ms: u64,
    pub success: bool,
}

/// A connection that a verified webhook says has new mail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebhookTargetConnection {
    pub user_id: UserId,
    pub provider_id: ProviderId,
}

fn markup_or_control(value: &str) -> bool {
    value.contains('<') || value.contains('>') || value.chars().any(char::is_control)
}

/// Every missing required field, then any value with markup or control characters.
fn validate_settings(kind: ProviderKind, config: &Map<String, Value>) -> Result<()> {
    let missing: Vec<String> = kind
        .required_fields()
        .iter()
        .filter(|field| match config.get(**field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .map(|field| field.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::MissingConfiguration(missing));
    }

    for (field, value) in config {
        if let Value::String(s) = value {
            if markup_or_control(s) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "{field} contains markup or control characters"
                )));
            }
        }
    }
    Ok(())
}

fn check_text(field: &str, value: &str) -> Result<()> {
    if markup_or_control(value) {
        return Err(EngineError::InvalidConfiguration(format!(
            "{field} contains markup or control characters"
        )));
    }
    Ok(())
}

fn credentials_from(
    kind: ProviderKind,
    config: &Map<String, Value>,
) -> Result<ProviderCredentials> {
    let mut tagged = config.clone();
    tagged.insert("provider".into(), Value::String(kind.as_str().into()));
    serde_json::from_value(Value::Object(tagged))
        .map_err(|e| EngineError::InvalidConfiguration(format!("{kind} settings: {e}")))
}

fn credentials_to_map(credentials: &ProviderCredentials) -> Result<Map<String, Value>> {
    match serde_json::to_value(credentials)? {
        Value::Object(mut map) => {
            map.remove("provider");
            Ok(map)
        }
        _ => Err(EngineError::Internal("credentials did not serialize to an object".into())),
    }
}

fn oauth_config_key(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Gmail => "oauth.google",
        ProviderKind::Outlook => "oauth.microsoft",
        ProviderKind::Imap | ProviderKind::Smtp => "oauth",
    }
}

/// Writes refreshed OAuth tokens back into a connection's sealed credentials.
///
/// Adapters refreshing on their own (a 401 mid-send) and
/// [`ProviderService::refresh_oauth_token`] both end here.
#[derive(Debug, Clone)]
pub struct SealedTokenStore {
    db: Database,
    vault: Arc<CredentialVault>,
}

impl SealedTokenStore {
    pub fn new(db: Database, vault: Arc<CredentialVault>) -> Self {
        Self { db, vault }
    }

    pub async fn save(&self, user_id: &UserId, id: &ProviderId, tokens: &TokenSet) -> Result<()> {
        let config = queries::providers::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| EngineError::not_found("provider", id))?;
        let mut credentials = self.vault.open_credentials(user_id, &config.encrypted_credentials)?;

        let (access, refresh) = match &mut credentials {
            ProviderCredentials::Gmail(c) => (&mut c.access_token, &mut c.refresh_token),
            ProviderCredentials::Outlook(c) => (&mut c.access_token, &mut c.refresh_token),
            ProviderCredentials::Imap(_) | ProviderCredentials::Smtp(_) => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "{} does not use OAuth",
                    config.kind
                )))
            }
        };
        *access = Some(tokens.access_token.clone());
        if let Some(rotated) = &tokens.refresh_token {
            *refresh = rotated.clone();
        }

        let update = ProviderUpdate {
            encrypted_credentials: Some(self.vault.seal_credentials(user_id, &credentials)?),
            ..Default::default()
        };
        queries::providers::update(&self.db, user_id, id, &update).await?;
        debug!(
            provider_id = %id,
            rotated = tokens.refresh_token.is_some(),
            "Stored refreshed tokens"
        );
        Ok(())
    }
}

#[async_trait]
impl TokenSink for SealedTokenStore {
    async fn store_tokens(
        &self,
        user_id: &UserId,
        provider_id: &ProviderId,
        tokens: &TokenSet,
    ) -> std::result::Result<(), ProviderError> {
        self.save(user_id, provider_id, tokens)
            .await
            .map_err(|e| ProviderError::Internal(e.to_string()))
    }
}

/// Connection management for all users.
pub struct ProviderService {
    db: Database,
    vault: Arc<CredentialVault>,
    connector: Arc<dyn ProviderConnector>,
    oauth: Arc<OAuthFlow>,
    oauth_config: OAuthConfig,
    webhooks: WebhookConfig,
    keychain: Option<KeychainAccess>,
    events: Arc<EventBus>,
    tokens: SealedTokenStore,
    adapters: RwLock<HashMap<ProviderId, Arc<dyn EmailProvider>>>,
    verifier: OnceCell<WebhookVerifier>,
}

impl ProviderService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        vault: Arc<CredentialVault>,
        connector: Arc<dyn ProviderConnector>,
        oauth: Arc<OAuthFlow>,
        oauth_config: OAuthConfig,
        webhooks: WebhookConfig,
        keychain: Option<KeychainAccess>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tokens: SealedTokenStore::new(db.clone(), Arc::clone(&vault)),
            db,
            vault,
            connector,
            oauth,
            oauth_config,
            webhooks,
            keychain,
            events,
            adapters: RwLock::new(HashMap::new()),
            verifier: OnceCell::new(),
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Validates, seals and stores a new connection.
    ///
    /// Nothing is persisted unless every check passes. The user's first
    /// connection becomes the default.
    pub async fn configure(
        &self,
        user_id: &UserId,
        setup: ProviderSetup,
    ) -> Result<ProviderConfig> {
        let name = setup.provider.trim().to_ascii_lowercase();
        let kind = ProviderKind::parse(&name)
            .ok_or_else(|| EngineError::UnsupportedProvider(setup.provider.clone()))?;

        validate_settings(kind, &setup.config)?;
        check_text("email", &setup.email)?;
        if let Some(display_name) = &setup.display_name {
            check_text("displayName", display_name)?;
        }
        if !is_valid_email(setup.email.trim()) {
            return Err(EngineError::InvalidConfiguration("email is not an address".into()));
        }

        let credentials = credentials_from(kind, &setup.config)?;
        let sealed = self.vault.seal_credentials(user_id, &credentials)?;

        let existing = queries::providers::list(&self.db, user_id, false).await?;
        let now = Utc::now();
        let config = ProviderConfig {
            id: ProviderId::generate(),
            user_id: user_id.clone(),
            kind,
            email: setup.email.trim().to_string(),
            display_name: setup.display_name,
            encrypted_credentials: sealed,
            is_active: true,
            is_default: false,
            sync_token: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        queries::providers::insert(&self.db, &config).await?;

        let mut config = config;
        if setup.is_default || existing.is_empty() {
            queries::providers::set_default(&self.db, user_id, &config.id).await?;
            config.is_default = true;
        }

        info!(
            user_id = %user_id,
            provider = %kind,
            provider_id = %config.id,
            "Configured provider connection"
        );
        self.events.emit(EngineEvent::ProviderConfigured {
            user_id: user_id.clone(),
            provider_id: config.id.clone(),
            kind,
        });
        Ok(config)
    }

    pub async fn get_providers(&self, user_id: &UserId) -> Result<Vec<ProviderConfig>> {
        Ok(queries::providers::list(&self.db, user_id, false).await?)
    }

    pub async fn get_provider(&self, user_id: &UserId, id: &ProviderId) -> Result<ProviderConfig> {
        queries::providers::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| EngineError::not_found("provider", id))
    }

    /// The requested connection, or the user's default.
    pub async fn resolve(
        &self,
        user_id: &UserId,
        id: Option<&ProviderId>,
    ) -> Result<ProviderConfig> {
        match id {
            Some(id) => self.get_provider(user_id, id).await,
            None => queries::providers::get_default(&self.db, user_id)
                .await?
                .ok_or_else(|| EngineError::not_found("default provider", user_id)),
        }
    }

    pub async fn update_provider(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        changes: ProviderChanges,
    ) -> Result<ProviderConfig> {
        let current = self.get_provider(user_id, id).await?;

        if let Some(email) = &changes.email {
            check_text("email", email)?;
            if !is_valid_email(email.trim()) {
                return Err(EngineError::InvalidConfiguration("email is not an address".into()));
            }
        }
        if let Some(display_name) = &changes.display_name {
            check_text("displayName", display_name)?;
        }

        let encrypted_credentials = match &changes.config {
            Some(patch) => {
                let stored = self.vault.open_credentials(user_id, &current.encrypted_credentials)?;
                let mut merged = credentials_to_map(&stored)?;
                for (field, value) in patch {
                    merged.insert(field.clone(), value.clone());
                }
                validate_settings(current.kind, &merged)?;
                let credentials = credentials_from(current.kind, &merged)?;
                Some(self.vault.seal_credentials(user_id, &credentials)?)
            }
            None => None,
        };

        let update = ProviderUpdate {
            email: changes.email.map(|e| e.trim().to_string()),
            display_name: changes.display_name,
            encrypted_credentials,
            is_active: changes.is_active,
        };
        queries::providers::update(&self.db, user_id, id, &update).await?;
        self.forget_adapter(id).await;

        info!(user_id = %user_id, provider_id = %id, "Updated provider connection");
        self.get_provider(user_id, id).await
    }

    /// Removes a connection, cancelling its webhook subscriptions first.
    pub async fn delete_provider(&self, user_id: &UserId, id: &ProviderId) -> Result<()> {
        let config = self.get_provider(user_id, id).await?;

        let subscriptions = queries::providers::list_subscriptions(&self.db, user_id, id).await?;
        if !subscriptions.is_empty() {
            match self.adapter_for(&config).await {
                Ok(adapter) => {
                    for sub in &subscriptions {
                        if let Err(e) = adapter.unregister_webhook(&sub.subscription_id).await {
                            warn!(
                                provider_id = %id,
                                subscription = %sub.subscription_id,
                                error = %e,
                                "Failed to cancel webhook while deleting provider"
                            );
                        }
                    }
                }
                Err(e) => warn!(provider_id = %id, error = %e, "No adapter to cancel webhooks"),
            }
        }

        let removed = queries::providers::delete(&self.db, user_id, id).await?;
        if removed == 0 {
            return Err(EngineError::not_found("provider", id));
        }
        self.forget_adapter(id).await;

        info!(user_id = %user_id, provider_id = %id, "Deleted provider connection");
        self.events.emit(EngineEvent::ProviderRemoved {
            user_id: user_id.clone(),
            provider_id: id.clone(),
        });
        Ok(())
    }

    /// Makes `id` the only default in one transaction.
    pub async fn set_default_provider(&self, user_id: &UserId, id: &ProviderId) -> Result<()> {
        if !queries::providers::set_default(&self.db, user_id, id).await? {
            return Err(EngineError::not_found("provider", id));
        }
        info!(user_id = %user_id, provider_id = %id, "Set default provider");
        Ok(())
    }

    // ========================================================================
    // Adapters
    // ========================================================================

    /// Live adapter for a connection, cached until the connection changes.
    pub async fn adapter(
        &self,
        user_id: &UserId,
        id: &ProviderId,
    ) -> Result<Arc<dyn EmailProvider>> {
        if let Some(adapter) = self.adapters.read().await.get(id) {
            return Ok(Arc::clone(adapter));
        }
        let config = self.get_provider(user_id, id).await?;
        self.adapter_for(&config).await
    }

    /// Live adapter for a connection already loaded by the caller.
    pub async fn adapter_for(&self, config: &ProviderConfig) -> Result<Arc<dyn EmailProvider>> {
        if !config.is_active {
            return Err(EngineError::InvalidOperation(format!(
                "provider {} is inactive",
                config.id
            )));
        }
        if let Some(adapter) = self.adapters.read().await.get(&config.id) {
            return Ok(Arc::clone(adapter));
        }

        let credentials = self
            .vault
            .open_credentials(&config.user_id, &config.encrypted_credentials)?;
        let adapter = self.connector.connect(config, credentials)?;
        self.adapters
            .write()
            .await
            .insert(config.id.clone(), Arc::clone(&adapter));
        debug!(provider_id = %config.id, provider = %config.kind, "Connected adapter");
        Ok(adapter)
    }

    async fn forget_adapter(&self, id: &ProviderId) {
        self.adapters.write().await.remove(id);
    }

    pub async fn test_connection(
        &self,
        user_id: &UserId,
        id: &ProviderId,
    ) -> Result<ConnectionStatus> {
        let adapter = self.adapter(user_id, id).await?;
        let status = with_remediation(adapter.as_ref(), || adapter.test_connection()).await?;
        info!(
            user_id = %user_id,
            provider_id = %id,
            connected = status.connected,
            "Tested provider connection"
        );
        Ok(status)
    }

    // ========================================================================
    // OAuth
    // ========================================================================

    fn oauth_client(&self, kind: ProviderKind) -> Result<&OAuthClient> {
        if !kind.uses_oauth() {
            return Err(EngineError::UnsupportedOperation(format!("{kind} does not use OAuth")));
        }
        self.oauth_config
            .client(kind)
            .ok_or_else(|| EngineError::MissingConfiguration(vec![oauth_config_key(kind).into()]))
    }

    /// Authorization URL with a fresh single-use state and PKCE challenge.
    pub fn initiate_oauth(
        &self,
        user_id: &UserId,
        kind: ProviderKind,
    ) -> Result<AuthorizationRequest> {
        let client = self.oauth_client(kind)?;
        let request = self.oauth.authorize(kind, user_id, client)?;
        info!(user_id = %user_id, provider = %kind, "Started OAuth flow");
        Ok(request)
    }

    /// Checks the state, then exchanges the code. A bad state never reaches
    /// the token endpoint.
    pub async fn handle_oauth_callback(
        &self,
        kind: ProviderKind,
        callback: &OAuthCallback,
    ) -> Result<OAuthGrant> {
        let client = self.oauth_client(kind)?;
        let redeemed = self
            .oauth
            .redeem_state(kind, &callback.state, &callback.expected_state)?;
        let tokens = self
            .oauth
            .exchange_code(kind, client, &callback.code, &redeemed.pkce_verifier)
            .await?;
        info!(user_id = %redeemed.user_id, provider = %kind, "Completed OAuth flow");
        Ok(OAuthGrant {
            user_id: redeemed.user_id,
            kind,
            tokens,
        })
    }

    /// Obtains a new access token and stores it sealed.
    pub async fn refresh_oauth_token(&self, user_id: &UserId, id: &ProviderId) -> Result<TokenSet> {
        let config = self.get_provider(user_id, id).await?;
        let credentials = self.vault.open_credentials(user_id, &config.encrypted_credentials)?;

        let tokens = match &credentials {
            ProviderCredentials::Gmail(c) => {
                self.oauth
                    .refresh(
                        ProviderKind::Gmail,
                        &c.client_id,
                        &c.client_secret,
                        "common",
                        &c.refresh_token,
                    )
                    .await?
            }
            ProviderCredentials::Outlook(c) => {
                self.oauth
                    .refresh(
                        ProviderKind::Outlook,
                        &c.client_id,
                        &c.client_secret,
                        &c.tenant_id,
                        &c.refresh_token,
                    )
                    .await?
            }
            ProviderCredentials::Imap(_) | ProviderCredentials::Smtp(_) => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "{} does not use OAuth",
                    config.kind
                )))
            }
        };

        self.tokens.save(user_id, id, &tokens).await?;
        self.forget_adapter(id).await;

        info!(user_id = %user_id, provider_id = %id, "Refreshed OAuth token");
        Ok(tokens)
    }

    /// Revokes the refresh token and deactivates the connection.
    pub async fn revoke_oauth_token(&self, user_id: &UserId, id: &ProviderId) -> Result<()> {
        let config = self.get_provider(user_id, id).await?;
        let credentials = self.vault.open_credentials(user_id, &config.encrypted_credentials)?;
        let token: &Secret = match &credentials {
            ProviderCredentials::Gmail(c) => &c.refresh_token,
            ProviderCredentials::Outlook(c) => &c.refresh_token,
            ProviderCredentials::Imap(_) | ProviderCredentials::Smtp(_) => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "{} does not use OAuth",
                    config.kind
                )))
            }
        };
        self.oauth.revoke(config.kind, token).await?;

        let update = ProviderUpdate {
            is_active: Some(false),
            ..Default::default()
        };
        queries::providers::update(&self.db, user_id, id, &update).await?;
        self.forget_adapter(id).await;

        info!(user_id = %user_id, provider_id = %id, "Revoked OAuth token");
        Ok(())
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    /// Subscribes a connection to push notifications.
    pub async fn register_webhook(
        &self,
        user_id: &UserId,
        id: &ProviderId,
    ) -> Result<WebhookSubscription> {
        let config = self.get_provider(user_id, id).await?;
        if !config.kind.supports(Feature::Webhooks) {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} has no webhooks",
                config.kind
            )));
        }

        let target = match config.kind {
            ProviderKind::Gmail => WebhookTarget {
                callback_url: self.webhooks.callback_url.clone().unwrap_or_default(),
                client_state: uuid::Uuid::new_v4().to_string(),
                topic: Some(self.webhooks.gmail_topic.clone().ok_or_else(|| {
                    EngineError::MissingConfiguration(vec!["webhooks.gmail_topic".into()])
                })?),
            },
            _ => WebhookTarget {
                callback_url: self.webhooks.callback_url.clone().ok_or_else(|| {
                    EngineError::MissingConfiguration(vec!["webhooks.callback_url".into()])
                })?,
                client_state: uuid::Uuid::new_v4().to_string(),
                topic: None,
            },
        };

        let adapter = self.adapter_for(&config).await?;
        let registration =
            with_remediation(adapter.as_ref(), || adapter.register_webhook(&target)).await?;

        let subscription = WebhookSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            provider_id: id.clone(),
            kind: config.kind,
            subscription_id: registration.subscription_id,
            resource: registration.resource,
            client_state: Some(target.client_state),
            expires_at: registration.expires_at,
            created_at: Utc::now(),
        };
        queries::providers::insert_subscription(&self.db, &subscription).await?;

        info!(
            user_id = %user_id,
            provider_id = %id,
            subscription = %subscription.subscription_id,
            "Registered webhook"
        );
        Ok(subscription)
    }

    /// Cancels a subscription with the provider and forgets it.
    pub async fn unregister_webhook(
        &self,
        user_id: &UserId,
        subscription_row_id: &str,
    ) -> Result<()> {
        let subscription = self
            .find_user_subscription(user_id, subscription_row_id)
            .await?
            .ok_or_else(|| EngineError::not_found("webhook subscription", subscription_row_id))?;

        let adapter = self.adapter(user_id, &subscription.provider_id).await?;
        with_remediation(adapter.as_ref(), || {
            adapter.unregister_webhook(&subscription.subscription_id)
        })
        .await?;
        queries::providers::delete_subscription(&self.db, user_id, &subscription.id).await?;

        info!(
            user_id = %user_id,
            subscription = %subscription.subscription_id,
            "Unregistered webhook"
        );
        Ok(())
    }

    pub async fn list_webhooks(
        &self,
        user_id: &UserId,
        id: &ProviderId,
    ) -> Result<Vec<WebhookSubscription>> {
        Ok(queries::providers::list_subscriptions(&self.db, user_id, id).await?)
    }

    async fn find_user_subscription(
        &self,
        user_id: &UserId,
        subscription_row_id: &str,
    ) -> Result<Option<WebhookSubscription>> {
        for config in queries::providers::list(&self.db, user_id, false).await? {
            let subs = queries::providers::list_subscriptions(&self.db, user_id, &config.id).await?;
            if let Some(sub) = subs.into_iter().find(|s| s.id == subscription_row_id) {
                return Ok(Some(sub));
            }
        }
        Ok(None)
    }

    async fn verifier(&self) -> &WebhookVerifier {
        self.verifier
            .get_or_init(|| async {
                let mut secrets = self.webhooks.secrets.clone();
                if let Some(keychain) = &self.keychain {
                    for kind in [ProviderKind::Gmail, ProviderKind::Outlook] {
                        if secrets.contains_key(&kind) {
                            continue;
                        }
                        match keychain.webhook_secret(kind).await {
                            Ok(Some(secret)) => {
                                secrets.insert(kind, secret);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                debug!(
                                    provider = %kind,
                                    error = %e,
                                    "No webhook secret in keychain"
                                )
                            }
                        }
                    }
                }
                WebhookVerifier::new(&secrets)
            })
            .await
    }

    /// Verifies a delivery and resolves the connections it concerns.
    ///
    /// Unsigned or mis-signed deliveries fail with `InvalidWebhookSignature`
    /// before the payload is looked at.
    pub async fn resolve_webhook(
        &self,
        delivery: &WebhookDelivery,
    ) -> Result<Vec<WebhookTargetConnection>> {
        let event = self.verifier().await.open(delivery)?;

        let mut targets: Vec<WebhookTargetConnection> = Vec::new();
        match event {
            WebhookEvent::Gmail {
                email_address,
                history_id,
            } => {
                debug!(history_id = %history_id, "Gmail push received");
                let found = queries::providers::find_subscription(&self.db, &email_address).await?;
                if let Some(sub) = found {
                    targets.push(WebhookTargetConnection {
                        user_id: sub.user_id,
                        provider_id: sub.provider_id,
                    });
                }
            }
            WebhookEvent::Outlook(notifications) => {
                for notification in notifications {
                    let subscription_id = &notification.subscription_id;
                    let Some(sub) =
                        queries::providers::find_subscription(&self.db, subscription_id).await?
                    else {
                        warn!(
                            subscription = %notification.subscription_id,
                            "Notification for unknown subscription"
                        );
                        continue;
                    };
                    if sub.client_state.is_some() && sub.client_state != notification.client_state {
                        warn!(
                            subscription = %notification.subscription_id,
                            "Notification clientState mismatch"
                        );
                        return Err(EngineError::InvalidWebhookSignature);
                    }
                    let target = WebhookTargetConnection {
                        user_id: sub.user_id,
                        provider_id: sub.provider_id,
                    };
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
        }

        if targets.is_empty() {
            warn!(provider = %delivery.provider, "Verified webhook matched no connection");
        }
        Ok(targets)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub async fn get_provider_stats(
        &self,
        user_id: &UserId,
        id: &ProviderId,
    ) -> Result<ProviderStats> {
        let config = self.get_provider(user_id, id).await?;
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(|| Utc::now() - Duration::hours(24));

        let total_emails = queries::emails::count_from_provider(&self.db, user_id, id, None).await?;
        let synced_today =
            queries::emails::count_from_provider(&self.db, user_id, id, Some(start_of_day)).await?;
        let totals = queries::activity::sync_totals(&self.db, user_id, id).await?;

        let success_rate = if totals.syncs == 0 {
            100.0
        } else {
            (totals.syncs - totals.failures) as f64 / totals.syncs as f64 * 100.0
        };

        Ok(ProviderStats {
            total_emails,
            synced_today,
            last_sync_time: config.last_synced_at.or(totals.last_success),
            error_count: totals.failures,
            success_rate,
        })
    }

    pub async fn get_sync_history(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        limit: u32,
    ) -> Result<Vec<SyncHistoryEntry>> {
        Ok(queries::activity::list_syncs(&self.db, user_id, id, limit).await?)
    }

    pub async fn track_provider_usage(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        usage: &ProviderUsage,
    ) -> Result<()> {
        let activity = EmailActivity {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            email_id: None,
            provider_id: Some(id.clone()),
            action: "provider_usage".to_string(),
            details: serde_json::to_value(usage)?,
            created_at: Utc::now(),
        };
        queries::activity::record_activity(&self.db, &activity).await?;
        debug!(
            user_id = %user_id,
            provider_id = %id,
            operation = %usage.operation,
            success = usage.success,
            "Tracked provider usage"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::test_server::TestServer;
    use crate::providers::email::{ApiEndpoints, OAuthEndpoints, ProviderFactory};
    use crate::services::testing::{gmail_setup, smtp_setup, FakeConnector};
    use std::sync::atomic::Ordering;

    struct Fixture {
        service: ProviderService,
        connector: Arc<FakeConnector>,
        db: Database,
        user: UserId,
    }

    async fn fixture_with(oauth_config: OAuthConfig, webhooks: WebhookConfig) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let connector = Arc::new(FakeConnector::new());
        let oauth = Arc::new(OAuthFlow::new(reqwest::Client::new(), OAuthEndpoints::default()));
        let service = ProviderService::new(
            db.clone(),
            Arc::new(CredentialVault::ephemeral().unwrap()),
            connector.clone(),
            oauth,
            oauth_config,
            webhooks,
            None,
            Arc::new(EventBus::new()),
        );
        Fixture {
            service,
            connector,
            db,
            user: UserId::from("user-1"),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(OAuthConfig::default(), WebhookConfig::default()).await
    }

    fn setup(value: Value) -> ProviderSetup {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn configure_seals_credentials_and_defaults_first_connection() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();

        assert!(config.is_default);
        assert!(!config.encrypted_credentials.contains("client-secret"));
        assert!(!config.encrypted_credentials.contains("refresh-token"));

        let second = f
            .service
            .configure(&f.user, setup(smtp_setup("me@example.com")))
            .await
            .unwrap();
        assert!(!second.is_default);
    }

    #[tokio::test]
    async fn token_refreshed_inside_an_adapter_is_sealed_into_the_connection() {
        let server = TestServer::start(vec![
            (
                "/token",
                serde_json::json!({
                    "access_token": "fresh",
                    "refresh_token": "rotated",
                    "expires_in": 3600
                })
                .to_string(),
            ),
            ("/profile", serde_json::json!({ "emailAddress": "me@gmail.com" }).to_string()),
        ])
        .await;
        let db = Database::open_in_memory().await.unwrap();
        let vault = Arc::new(CredentialVault::ephemeral().unwrap());
        let http = reqwest::Client::new();
        let oauth = Arc::new(OAuthFlow::new(
            http.clone(),
            OAuthEndpoints {
                google_token_url: format!("{}/token", server.base()),
                ..OAuthEndpoints::default()
            },
        ));
        let factory = ProviderFactory::new(
            http,
            oauth.clone(),
            ApiEndpoints {
                gmail_api_base: server.base().to_string(),
                ..ApiEndpoints::default()
            },
        )
        .with_token_sink(Arc::new(SealedTokenStore::new(db.clone(), vault.clone())));
        let service = ProviderService::new(
            db,
            vault.clone(),
            Arc::new(factory),
            oauth,
            OAuthConfig::default(),
            WebhookConfig::default(),
            None,
            Arc::new(EventBus::new()),
        );
        let user = UserId::from("user-1");
        let config = service
            .configure(&user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();

        // No access token is stored yet, so the adapter refreshes first.
        let status = service.test_connection(&user, &config.id).await.unwrap();
        assert_eq!(status.identity.as_deref(), Some("me@gmail.com"));

        let stored = service.get_provider(&user, &config.id).await.unwrap();
        let ProviderCredentials::Gmail(credentials) = vault
            .open_credentials(&user, &stored.encrypted_credentials)
            .unwrap()
        else {
            panic!("expected Gmail credentials");
        };
        assert_eq!(credentials.refresh_token, Secret::new("rotated"));
        assert_eq!(credentials.access_token, Some(Secret::new("fresh")));
    }

    #[tokio::test]
    async fn missing_fields_are_all_reported_and_nothing_is_stored() {
        let f = fixture().await;
        let err = f
            .service
            .configure(
                &f.user,
                setup(serde_json::json!({
                    "provider": "gmail",
                    "email": "me@gmail.com",
                    "config": { "clientId": "id" }
                })),
            )
            .await
            .unwrap_err();

        match err {
            EngineError::MissingConfiguration(fields) => {
                assert_eq!(fields, vec!["clientSecret".to_string(), "refreshToken".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(f.service.get_providers(&f.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn markup_in_settings_is_rejected() {
        let f = fixture().await;
        let mut value = gmail_setup("me@gmail.com");
        value["config"]["clientId"] = Value::String("<script>alert(\"xss\")</script>".into());

        let err = f.service.configure(&f.user, setup(value)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Invalid configuration format");
    }

    #[tokio::test]
    async fn unknown_provider_is_unsupported() {
        let f = fixture().await;
        let mut value = gmail_setup("me@yahoo.com");
        value["provider"] = Value::String("yahoo".into());

        let err = f.service.configure(&f.user, setup(value)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedProvider(p) if p == "yahoo"));
    }

    #[tokio::test]
    async fn adapters_are_cached_until_the_connection_changes() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();

        f.service.test_connection(&f.user, &config.id).await.unwrap();
        f.service.test_connection(&f.user, &config.id).await.unwrap();
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);

        f.service
            .update_provider(
                &f.user,
                &config.id,
                ProviderChanges {
                    display_name: Some("Work".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.service.test_connection(&f.user, &config.id).await.unwrap();
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn update_merges_settings_and_reseals() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(smtp_setup("me@example.com")))
            .await
            .unwrap();

        let mut patch = Map::new();
        patch.insert("host".into(), Value::String("mail.example.org".into()));
        let updated = f
            .service
            .update_provider(
                &f.user,
                &config.id,
                ProviderChanges {
                    email: Some("new@example.com".into()),
                    config: Some(patch),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.email, "new@example.com");
        assert_ne!(updated.encrypted_credentials, config.encrypted_credentials);
    }

    #[tokio::test]
    async fn inactive_connections_have_no_adapter() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();
        f.service
            .update_provider(
                &f.user,
                &config.id,
                ProviderChanges {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = f.service.adapter(&f.user, &config.id).await.err().unwrap();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn set_default_and_delete() {
        let f = fixture().await;
        let first = f
            .service
            .configure(&f.user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();
        let second = f
            .service
            .configure(&f.user, setup(smtp_setup("me@example.com")))
            .await
            .unwrap();

        f.service.set_default_provider(&f.user, &second.id).await.unwrap();
        assert_eq!(f.service.resolve(&f.user, None).await.unwrap().id, second.id);

        f.service.delete_provider(&f.user, &second.id).await.unwrap();
        assert_eq!(f.service.resolve(&f.user, None).await.unwrap().id, first.id);
        assert!(matches!(
            f.service.delete_provider(&f.user, &second.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn oauth_requires_app_configuration() {
        let f = fixture().await;
        assert!(matches!(
            f.service.initiate_oauth(&f.user, ProviderKind::Gmail),
            Err(EngineError::MissingConfiguration(_))
        ));
        assert!(matches!(
            f.service.initiate_oauth(&f.user, ProviderKind::Smtp),
            Err(EngineError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn oauth_callback_with_wrong_state_fails_closed() {
        let oauth_config = OAuthConfig {
            google: Some(OAuthClient {
                client_id: "client".into(),
                client_secret: Secret::from("secret"),
                redirect_uri: "http://localhost/callback".into(),
                tenant_id: "common".into(),
            }),
            ..Default::default()
        };
        let f = fixture_with(oauth_config, WebhookConfig::default()).await;

        let request = f.service.initiate_oauth(&f.user, ProviderKind::Gmail).unwrap();
        assert!(request.auth_url.contains("code_challenge_method=S256"));

        let err = f
            .service
            .handle_oauth_callback(
                ProviderKind::Gmail,
                &OAuthCallback {
                    code: "code".into(),
                    state: "forged".into(),
                    expected_state: request.state.clone(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState));
    }

    #[tokio::test]
    async fn outlook_webhooks_resolve_to_their_connection() {
        let mut secrets = HashMap::new();
        secrets.insert(ProviderKind::Outlook, Secret::from("hook-secret"));
        let webhooks = WebhookConfig {
            callback_url: Some("https://courier.example.com/hooks".into()),
            gmail_topic: None,
            secrets: secrets.clone(),
        };
        let f = fixture_with(OAuthConfig::default(), webhooks).await;

        let mut value = gmail_setup("me@outlook.com");
        value["provider"] = Value::String("outlook".into());
        let config = f.service.configure(&f.user, setup(value)).await.unwrap();
        let sub = f.service.register_webhook(&f.user, &config.id).await.unwrap();

        let body = serde_json::json!({
            "value": [{
                "subscriptionId": sub.subscription_id,
                "clientState": sub.client_state,
                "resource": "me/messages/1"
            }]
        })
        .to_string();
        let signer = WebhookVerifier::new(&secrets);
        let delivery = WebhookDelivery {
            provider: ProviderKind::Outlook,
            signature: Some(signer.sign(ProviderKind::Outlook, body.as_bytes()).unwrap()),
            body,
        };

        let targets = f.service.resolve_webhook(&delivery).await.unwrap();
        assert_eq!(
            targets,
            vec![WebhookTargetConnection {
                user_id: f.user.clone(),
                provider_id: config.id.clone(),
            }]
        );

        let unsigned = WebhookDelivery {
            signature: None,
            ..delivery
        };
        assert!(matches!(
            f.service.resolve_webhook(&unsigned).await,
            Err(EngineError::InvalidWebhookSignature)
        ));
    }

    #[tokio::test]
    async fn webhooks_need_a_capable_provider() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(smtp_setup("me@example.com")))
            .await
            .unwrap();
        assert!(matches!(
            f.service.register_webhook(&f.user, &config.id).await,
            Err(EngineError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn stats_reflect_sync_history() {
        let f = fixture().await;
        let config = f
            .service
            .configure(&f.user, setup(gmail_setup("me@gmail.com")))
            .await
            .unwrap();

        for success in [true, true, false, true] {
            queries::activity::record_sync(
                &f.db,
                &SyncHistoryEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: f.user.clone(),
                    provider_id: config.id.clone(),
                    synced_at: Utc::now(),
                    emails_count: 2,
                    success,
                    incremental: true,
                    error: (!success).then(|| "boom".to_string()),
                },
            )
            .await
            .unwrap();
        }

        let stats = f.service.get_provider_stats(&f.user, &config.id).await.unwrap();
        assert_eq!(stats.error_count, 1);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(
            f.service.get_sync_history(&f.user, &config.id, 10).await.unwrap().len(),
            4
        );

        f.service
            .track_provider_usage(
                &f.user,
                &config.id,
                &ProviderUsage {
                    operation: "send".into(),
                    email_count: 1,
                    duration_ms: 120,
                    success: true,
                },
            )
            .await
            .unwrap();
        let logged = queries::activity::list_activity(&f.db, &f.user, Some("provider_usage"), 10)
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
    }
}
