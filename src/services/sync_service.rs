//! Sync service for email synchronization.
//!
//! The [`SyncService`] pulls mail from remote providers into local storage.
//! Syncs run on demand, when a verified webhook names a connection, or on a
//! per-connection timer. Each pass continues from the connection's stored
//! token (historyId, deltaLink or `uidvalidity:uid`) and skips messages that
//! are already stored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{EngineEvent, EventBus};
use super::provider_service::ProviderService;
use super::timers::TimerRegistry;
use crate::config::SyncConfig;
use crate::domain::{Feature, ProviderConfig, ProviderId, SyncHistoryEntry, UserId};
use crate::error::{EngineError, Result};
use crate::providers::email::{with_remediation, SyncRequest, WebhookDelivery};
use crate::storage::{queries, MailStore};

/// Result of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub provider_id: ProviderId,
    /// Number of new emails stored.
    pub emails_received: usize,
    /// Messages already stored from an earlier pass.
    pub duplicates_skipped: usize,
    /// Whether the pass continued from a token.
    pub incremental: bool,
    /// Token the next pass continues from.
    pub next_token: Option<String>,
    /// Per-message failures. The pass itself still succeeded.
    pub errors: Vec<String>,
    /// Set when the timer was stopped mid-pass and nothing was written.
    pub discarded: bool,
    pub duration_ms: u64,
}

impl SyncResult {
    /// Returns true if the sync completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.discarded
    }
}

/// Status of a connection's sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Sync has never run.
    Never,
    /// Sync is currently in progress.
    InProgress,
    /// Last sync completed successfully.
    Success,
    /// Last sync failed.
    Failed,
}

/// Background and on-demand synchronization for every connection.
///
/// Timers are keyed `sync:{provider_id}`. Starting a timer for a connection
/// that already has one replaces it. Stopping a timer lets a request in
/// flight finish, but its result is discarded before anything is written.
pub struct SyncService {
    providers: Arc<ProviderService>,
    store: MailStore,
    events: Arc<EventBus>,
    timers: TimerRegistry,
    settings: RwLock<SyncConfig>,
    status: RwLock<HashMap<ProviderId, SyncStatus>>,
}

fn timer_key(id: &ProviderId) -> String {
    format!("sync:{id}")
}

impl SyncService {
    pub fn new(
        providers: Arc<ProviderService>,
        store: MailStore,
        events: Arc<EventBus>,
        settings: SyncConfig,
    ) -> Self {
        Self {
            providers,
            store,
            events,
            timers: TimerRegistry::new(),
            settings: RwLock::new(settings),
            status: RwLock::new(HashMap::new()),
        }
    }

    /// Updates sync settings. Running timers keep their period until restarted.
    pub async fn update_settings(&self, settings: SyncConfig) {
        *self.settings.write().await = settings;
    }

    pub async fn status(&self, id: &ProviderId) -> SyncStatus {
        self.status
            .read()
            .await
            .get(id)
            .copied()
            .unwrap_or(SyncStatus::Never)
    }

    /// Synchronizes one connection now.
    pub async fn sync_provider(&self, user_id: &UserId, id: &ProviderId) -> Result<SyncResult> {
        self.run(user_id, id, None).await
    }

    /// Synchronizes every active receiving connection of a user.
    ///
    /// A failing connection does not stop the others; its error is reported
    /// in its result.
    pub async fn sync_all(&self, user_id: &UserId) -> Result<Vec<SyncResult>> {
        let connections = queries::providers::list(self.store.db(), user_id, true).await?;
        let mut results = Vec::new();
        for config in connections.iter().filter(|c| c.kind.supports(Feature::Receive)) {
            results.push(self.run_reporting(user_id, &config.id).await);
        }
        Ok(results)
    }

    /// Verifies a webhook delivery and syncs every connection it names.
    ///
    /// Only a bad delivery fails the call. Each target's own failure, such
    /// as a pass already running, lands in that target's result.
    pub async fn handle_webhook(&self, delivery: &WebhookDelivery) -> Result<Vec<SyncResult>> {
        let targets = self.providers.resolve_webhook(delivery).await?;
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.run_reporting(&target.user_id, &target.provider_id).await);
        }
        Ok(results)
    }

    /// Runs one pass, folding a failure into the result.
    async fn run_reporting(&self, user_id: &UserId, id: &ProviderId) -> SyncResult {
        match self.run(user_id, id, None).await {
            Ok(result) => result,
            Err(e) => {
                warn!(provider_id = %id, error = %e, "Sync failed");
                SyncResult {
                    provider_id: id.clone(),
                    errors: vec![e.to_string()],
                    ..Default::default()
                }
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Starts the periodic sync for a connection, replacing any running one.
    pub async fn start_sync(self: &Arc<Self>, user_id: &UserId, id: &ProviderId) -> Result<()> {
        let config = self.providers.get_provider(user_id, id).await?;
        if !config.kind.supports(Feature::Receive) {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} cannot receive mail",
                config.kind
            )));
        }

        let period = Duration::from_secs(self.settings.read().await.interval_secs.max(1));
        let service = Arc::clone(self);
        let user = user_id.clone();
        let provider = id.clone();
        self.timers.start(timer_key(id), Duration::ZERO, period, move |token| {
            let service = Arc::clone(&service);
            let user = user.clone();
            let provider = provider.clone();
            async move {
                if let Err(e) = service.run(&user, &provider, Some(&token)).await {
                    warn!(provider_id = %provider, error = %e, "Scheduled sync failed");
                }
            }
        });
        Ok(())
    }

    /// Stops the periodic sync for a connection. Returns false if none ran.
    pub fn stop_sync(&self, id: &ProviderId) -> bool {
        self.timers.stop(&timer_key(id))
    }

    /// Starts timers for every active receiving connection.
    pub async fn start_all(self: &Arc<Self>) -> Result<usize> {
        let connections = queries::providers::list_all_active(self.store.db()).await?;
        let mut started = 0;
        for config in connections.iter().filter(|c| c.kind.supports(Feature::Receive)) {
            self.start_sync(&config.user_id, &config.id).await?;
            started += 1;
        }
        info!(started, "Started background sync");
        Ok(started)
    }

    pub fn stop_all(&self) {
        let stopped = self.timers.stop_prefixed("sync:");
        info!(stopped, "Stopped background sync");
    }

    pub fn is_running(&self, id: &ProviderId) -> bool {
        self.timers.is_running(&timer_key(id))
    }

    /// Stops the timer and forgets the status of a removed connection.
    pub async fn forget(&self, id: &ProviderId) {
        self.stop_sync(id);
        self.status.write().await.remove(id);
    }

    // ========================================================================
    // Sync pass
    // ========================================================================

    async fn run(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        token: Option<&CancellationToken>,
    ) -> Result<SyncResult> {
        {
            let mut status = self.status.write().await;
            if status.get(id) == Some(&SyncStatus::InProgress) {
                return Err(EngineError::InvalidOperation(format!(
                    "sync already running for provider {id}"
                )));
            }
            status.insert(id.clone(), SyncStatus::InProgress);
        }

        let start = Instant::now();
        let result = self.do_sync(user_id, id, token).await;

        let status = if result.is_ok() {
            SyncStatus::Success
        } else {
            SyncStatus::Failed
        };
        self.status.write().await.insert(id.clone(), status);

        match result {
            Ok(mut sync_result) => {
                sync_result.duration_ms = start.elapsed().as_millis() as u64;
                if !sync_result.discarded {
                    self.events.emit(EngineEvent::SyncCompleted {
                        user_id: user_id.clone(),
                        provider_id: id.clone(),
                        emails: sync_result.emails_received as u64,
                        incremental: sync_result.incremental,
                    });
                }
                Ok(sync_result)
            }
            Err(e) => {
                error!(user_id = %user_id, provider_id = %id, error = %e, "Sync failed");
                self.record_history(user_id, id, 0, false, false, Some(e.to_string()))
                    .await;
                self.events.emit(EngineEvent::SyncFailed {
                    user_id: user_id.clone(),
                    provider_id: id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn do_sync(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        token: Option<&CancellationToken>,
    ) -> Result<SyncResult> {
        let config = self.providers.get_provider(user_id, id).await?;
        if !config.kind.supports(Feature::Receive) {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} cannot receive mail",
                config.kind
            )));
        }
        let adapter = self.providers.adapter_for(&config).await?;

        let max_results = self.settings.read().await.max_results;
        let request = SyncRequest::since(config.sync_token.clone(), max_results);
        debug!(
            provider_id = %id,
            incremental = request.incremental,
            "Fetching changes"
        );
        let batch = with_remediation(adapter.as_ref(), || adapter.sync_emails(&request)).await?;

        if token.is_some_and(CancellationToken::is_cancelled) {
            info!(provider_id = %id, "Sync stopped mid-pass, discarding fetched batch");
            return Ok(SyncResult {
                provider_id: id.clone(),
                incremental: request.incremental,
                discarded: true,
                ..Default::default()
            });
        }

        let mut result = SyncResult {
            provider_id: id.clone(),
            incremental: request.incremental,
            ..Default::default()
        };
        self.store_batch(user_id, &config, batch.emails, &mut result).await?;

        let next_token = batch.next_token.or(config.sync_token);
        queries::providers::update_sync_state(
            self.store.db(),
            user_id,
            id,
            next_token.clone(),
            Utc::now(),
        )
        .await?;
        result.next_token = next_token;

        self.record_history(
            user_id,
            id,
            result.emails_received as u64,
            true,
            result.incremental,
            None,
        )
        .await;

        info!(
            user_id = %user_id,
            provider_id = %id,
            received = result.emails_received,
            duplicates = result.duplicates_skipped,
            errors = result.errors.len(),
            "Sync completed"
        );
        Ok(result)
    }

    async fn store_batch(
        &self,
        user_id: &UserId,
        config: &ProviderConfig,
        emails: Vec<crate::domain::NewEmail>,
        result: &mut SyncResult,
    ) -> Result<()> {
        for mut email in emails {
            email.provider_id = Some(config.id.clone());
            if let Some(message_id) = &email.provider_message_id {
                if self
                    .store
                    .find_by_provider_message(user_id, &config.id, message_id)
                    .await?
                    .is_some()
                {
                    result.duplicates_skipped += 1;
                    continue;
                }
            }

            match self.store.store_email(user_id, email).await {
                Ok(stored) => {
                    result.emails_received += 1;
                    self.events.emit(EngineEvent::EmailStored {
                        user_id: user_id.clone(),
                        email_id: stored.id,
                    });
                }
                Err(EngineError::InvalidEmailData(errors)) => {
                    warn!(provider_id = %config.id, ?errors, "Skipping malformed synced message");
                    result.errors.push(errors.join(", "));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn record_history(
        &self,
        user_id: &UserId,
        id: &ProviderId,
        emails_count: u64,
        success: bool,
        incremental: bool,
        error: Option<String>,
    ) {
        let entry = SyncHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            provider_id: id.clone(),
            synced_at: Utc::now(),
            emails_count,
            success,
            incremental,
            error,
        };
        if let Err(e) = queries::activity::record_sync(self.store.db(), &entry).await {
            warn!(provider_id = %id, error = %e, "Failed to record sync history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OAuthConfig, WebhookConfig};
    use crate::domain::{Address, EmailContent, NewEmail, ProviderKind, Secret, WebhookSubscription};
    use crate::providers::email::{OAuthEndpoints, OAuthFlow, SyncBatch, WebhookVerifier};
    use crate::services::provider_service::ProviderSetup;
    use crate::services::testing::{gmail_setup, smtp_setup, FakeConnector};
    use crate::storage::{CredentialVault, Database};

    struct Fixture {
        service: Arc<SyncService>,
        providers: Arc<ProviderService>,
        connector: Arc<FakeConnector>,
        store: MailStore,
        user: UserId,
    }

    async fn fixture() -> Fixture {
        fixture_with(WebhookConfig::default()).await
    }

    async fn fixture_with(webhooks: WebhookConfig) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let connector = Arc::new(FakeConnector::new());
        let events = Arc::new(EventBus::new());
        let providers = Arc::new(ProviderService::new(
            db.clone(),
            Arc::new(CredentialVault::ephemeral().unwrap()),
            connector.clone(),
            Arc::new(OAuthFlow::new(reqwest::Client::new(), OAuthEndpoints::default())),
            OAuthConfig::default(),
            webhooks,
            None,
            events.clone(),
        ));
        let store = MailStore::new(db);
        let service = Arc::new(SyncService::new(
            providers.clone(),
            store.clone(),
            events,
            SyncConfig {
                interval_secs: 60,
                max_results: 50,
            },
        ));
        Fixture {
            service,
            providers,
            connector,
            store,
            user: UserId::from("user-1"),
        }
    }

    fn message(id: &str, subject: &str) -> NewEmail {
        NewEmail::inbound(Address::new("client@example.com"), subject)
            .content(EmailContent::text("hello"))
            .provider_message(None, id)
    }

    async fn gmail(f: &Fixture) -> ProviderId {
        let setup: ProviderSetup = serde_json::from_value(gmail_setup("me@gmail.com")).unwrap();
        f.providers.configure(&f.user, setup).await.unwrap().id
    }

    #[tokio::test]
    async fn sync_continues_from_the_stored_token_and_skips_duplicates() {
        let f = fixture().await;
        let id = gmail(&f).await;
        let fake = f.connector.provider(ProviderKind::Gmail);

        fake.queue_sync(SyncBatch {
            emails: vec![message("m1", "First"), message("m2", "Second")],
            next_token: Some("history-10".into()),
        });
        let first = f.service.sync_provider(&f.user, &id).await.unwrap();
        assert_eq!(first.emails_received, 2);
        assert!(!first.incremental);

        fake.queue_sync(SyncBatch {
            emails: vec![message("m2", "Second"), message("m3", "Third")],
            next_token: Some("history-12".into()),
        });
        let second = f.service.sync_provider(&f.user, &id).await.unwrap();
        assert!(second.incremental);
        assert_eq!(second.emails_received, 1);
        assert_eq!(second.duplicates_skipped, 1);

        let requests = fake.sync_requests.lock().unwrap().clone();
        assert_eq!(requests[1].since_token.as_deref(), Some("history-10"));

        let config = f.providers.get_provider(&f.user, &id).await.unwrap();
        assert_eq!(config.sync_token.as_deref(), Some("history-12"));
        assert_eq!(f.service.status(&id).await, SyncStatus::Success);
        assert_eq!(f.store.stats(&f.user).await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn webhook_syncs_every_target_even_when_one_is_busy() {
        let secrets = HashMap::from([(ProviderKind::Outlook, Secret::new("hook-secret"))]);
        let f = fixture_with(WebhookConfig {
            secrets: secrets.clone(),
            ..WebhookConfig::default()
        })
        .await;

        let mut connections = Vec::new();
        for (email, subscription) in [("a@contoso.com", "sub-a"), ("b@contoso.com", "sub-b")] {
            let setup: ProviderSetup = serde_json::from_value(serde_json::json!({
                "provider": "outlook",
                "email": email,
                "config": {
                    "clientId": "client-id",
                    "clientSecret": "client-secret",
                    "refreshToken": "refresh-token"
                }
            }))
            .unwrap();
            let id = f.providers.configure(&f.user, setup).await.unwrap().id;
            queries::providers::insert_subscription(
                f.store.db(),
                &WebhookSubscription {
                    id: format!("row-{subscription}"),
                    user_id: f.user.clone(),
                    provider_id: id.clone(),
                    kind: ProviderKind::Outlook,
                    subscription_id: subscription.into(),
                    resource: "me/messages".into(),
                    client_state: None,
                    expires_at: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();
            connections.push(id);
        }

        // The first connection is mid-pass on its timer.
        f.service
            .status
            .write()
            .await
            .insert(connections[0].clone(), SyncStatus::InProgress);
        f.connector.provider(ProviderKind::Outlook).queue_sync(SyncBatch {
            emails: vec![message("<n1@contoso.com>", "New")],
            next_token: Some("delta-1".into()),
        });

        let body = r#"{"value":[{"subscriptionId":"sub-a"},{"subscriptionId":"sub-b"}]}"#;
        let delivery = WebhookDelivery {
            provider: ProviderKind::Outlook,
            body: body.to_string(),
            signature: Some(
                WebhookVerifier::new(&secrets)
                    .sign(ProviderKind::Outlook, body.as_bytes())
                    .unwrap(),
            ),
        };
        let results = f.service.handle_webhook(&delivery).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].provider_id, connections[0]);
        assert!(!results[0].is_success());
        assert_eq!(results[1].provider_id, connections[1]);
        assert_eq!(results[1].emails_received, 1);
    }

    #[tokio::test]
    async fn empty_batch_keeps_the_previous_token() {
        let f = fixture().await;
        let id = gmail(&f).await;
        let fake = f.connector.provider(ProviderKind::Gmail);

        fake.queue_sync(SyncBatch {
            emails: vec![],
            next_token: Some("history-5".into()),
        });
        f.service.sync_provider(&f.user, &id).await.unwrap();
        let result = f.service.sync_provider(&f.user, &id).await.unwrap();

        assert_eq!(result.next_token.as_deref(), Some("history-5"));
    }

    #[tokio::test]
    async fn send_only_connections_cannot_sync() {
        let f = fixture().await;
        let setup: ProviderSetup = serde_json::from_value(smtp_setup("me@example.com")).unwrap();
        let id = f.providers.configure(&f.user, setup).await.unwrap().id;

        assert!(matches!(
            f.service.sync_provider(&f.user, &id).await,
            Err(EngineError::UnsupportedOperation(_))
        ));
        assert_eq!(f.service.status(&id).await, SyncStatus::Failed);
        assert!(f.service.start_sync(&f.user, &id).await.is_err());
    }

    #[tokio::test]
    async fn sync_history_records_each_pass() {
        let f = fixture().await;
        let id = gmail(&f).await;
        f.connector.provider(ProviderKind::Gmail).queue_sync(SyncBatch {
            emails: vec![message("m1", "First")],
            next_token: None,
        });

        f.service.sync_provider(&f.user, &id).await.unwrap();
        let history = f.providers.get_sync_history(&f.user, &id, 10).await.unwrap();

        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].emails_count, 1);
    }

    #[tokio::test]
    async fn timers_are_replaced_and_stopped_per_connection() {
        let f = fixture().await;
        let id = gmail(&f).await;

        f.service.start_sync(&f.user, &id).await.unwrap();
        f.service.start_sync(&f.user, &id).await.unwrap();
        assert!(f.service.is_running(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(f.service.stop_sync(&id));
        assert!(!f.service.is_running(&id));
        let syncs = f.connector.provider(ProviderKind::Gmail).sync_requests.lock().unwrap().len();
        assert!(syncs >= 1);
    }
}
