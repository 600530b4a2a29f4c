//! courier - email integration and recovery engine
//!
//! This crate provides provider adapters for Gmail, Microsoft Graph, IMAP and
//! SMTP, local mail storage, attachment handling, business-document mail, and
//! backup, restore and export of stored mail.
//!
//! [`Engine`] wires every service from an [`EngineConfig`]:
//!
//! ```no_run
//! # async fn run() -> courier::Result<()> {
//! let engine = courier::Engine::builder(courier::EngineConfig::load()?)
//!     .build()
//!     .await?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod providers;
pub mod services;
pub mod storage;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub use config::EngineConfig;
pub use error::{EngineError, Result};

use domain::UserId;
use providers::email::{OAuthFlow, ProviderConnector, ProviderFactory};
use services::{
    AttachmentService, BusinessService, DispatchReport, DocumentStore, EventBus,
    ManagementService, ProviderService, RecoveryService, SealedTokenStore, SettingsService,
    SqliteDocumentStore, SyncService, TemplateService,
};
use storage::{CredentialVault, Database, FsObjectStore, KeychainAccess, MailStore, ObjectStore};

/// Assembles an [`Engine`], substituting any of its infrastructure.
///
/// Anything not supplied is built from the config: an on-disk database, a
/// filesystem object store, a vault keyed from config or the OS keychain, and
/// the real provider adapters.
pub struct EngineBuilder {
    config: EngineConfig,
    database: Option<Database>,
    objects: Option<Arc<dyn ObjectStore>>,
    vault: Option<CredentialVault>,
    connector: Option<Arc<dyn ProviderConnector>>,
    documents: Option<Arc<dyn DocumentStore>>,
    keychain: Option<KeychainAccess>,
    use_keychain: bool,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            database: None,
            objects: None,
            vault: None,
            connector: None,
            documents: None,
            keychain: None,
            use_keychain: true,
        }
    }

    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn vault(mut self, vault: CredentialVault) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ProviderConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn document_store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Uses a keychain under a custom service name.
    pub fn keychain(mut self, keychain: KeychainAccess) -> Self {
        self.keychain = Some(keychain);
        self.use_keychain = true;
        self
    }

    /// Never touches the OS keychain. Webhook secrets then come only from
    /// config, and a vault key must be supplied.
    pub fn without_keychain(mut self) -> Self {
        self.keychain = None;
        self.use_keychain = false;
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let keychain = if self.use_keychain {
            Some(self.keychain.unwrap_or_default())
        } else {
            None
        };

        let db = match self.database {
            Some(db) => db,
            None => {
                let path = config.database_path()?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        EngineError::Internal(format!("creating {}: {e}", parent.display()))
                    })?;
                }
                info!(path = %path.display(), "Opening database");
                Database::open(&path).await?
            }
        };

        let objects: Arc<dyn ObjectStore> = match self.objects {
            Some(objects) => objects,
            None => Arc::new(FsObjectStore::new(
                config.object_store_root()?,
                config.public_base_url.clone(),
            )),
        };

        let vault = match (self.vault, &config.vault_master_key, &keychain) {
            (Some(vault), _, _) => vault,
            (None, Some(key), _) => CredentialVault::from_base64(key.expose())?,
            (None, None, Some(keychain)) => CredentialVault::from_keychain(keychain).await?,
            (None, None, None) => {
                return Err(EngineError::MissingConfiguration(vec![
                    "vault_master_key".into(),
                ]))
            }
        };

        let vault = Arc::new(vault);

        let http = reqwest::Client::new();
        let oauth = Arc::new(OAuthFlow::new(http.clone(), config.oauth.endpoints.clone()));
        let connector: Arc<dyn ProviderConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                ProviderFactory::new(http, oauth.clone(), config.api.clone()).with_token_sink(
                    Arc::new(SealedTokenStore::new(db.clone(), Arc::clone(&vault))),
                ),
            ),
        };

        let events = Arc::new(EventBus::new());
        let store = MailStore::new(db.clone());
        let templates = Arc::new(TemplateService::new());

        let providers = Arc::new(ProviderService::new(
            db.clone(),
            vault,
            connector,
            oauth,
            config.oauth.clone(),
            config.webhooks.clone(),
            keychain,
            events.clone(),
        ));
        let sync = Arc::new(SyncService::new(
            providers.clone(),
            store.clone(),
            events.clone(),
            config.sync.clone(),
        ));
        let management = Arc::new(ManagementService::new(
            store.clone(),
            providers.clone(),
            templates.clone(),
            events.clone(),
            config.bulk_send.clone(),
        ));
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(SqliteDocumentStore::new(db.clone())));
        let business = Arc::new(BusinessService::new(
            management.clone(),
            documents,
            db.clone(),
            events.clone(),
            config.business.clone(),
            config.bulk_send.clone(),
        ));
        let attachments = Arc::new(AttachmentService::new(
            db.clone(),
            objects.clone(),
            events.clone(),
            config.attachments.clone(),
        ));
        let recovery = Arc::new(RecoveryService::new(
            store,
            objects,
            events.clone(),
            config.backup.clone(),
        ));
        let settings = Arc::new(SettingsService::new(
            db.clone(),
            events.clone(),
            config.settings_cache_capacity,
        ));

        Ok(Engine {
            config,
            db,
            events,
            templates,
            providers,
            sync,
            management,
            business,
            attachments,
            recovery,
            settings,
        })
    }
}

/// Every engine service, sharing one database and event bus.
pub struct Engine {
    config: EngineConfig,
    db: Database,
    events: Arc<EventBus>,
    templates: Arc<TemplateService>,
    providers: Arc<ProviderService>,
    sync: Arc<SyncService>,
    management: Arc<ManagementService>,
    business: Arc<BusinessService>,
    attachments: Arc<AttachmentService>,
    recovery: Arc<RecoveryService>,
    settings: Arc<SettingsService>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn templates(&self) -> &Arc<TemplateService> {
        &self.templates
    }

    pub fn providers(&self) -> &Arc<ProviderService> {
        &self.providers
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    pub fn management(&self) -> &Arc<ManagementService> {
        &self.management
    }

    pub fn business(&self) -> &Arc<BusinessService> {
        &self.business
    }

    pub fn attachments(&self) -> &Arc<AttachmentService> {
        &self.attachments
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn settings(&self) -> &Arc<SettingsService> {
        &self.settings
    }

    /// Starts sync timers for every active receiving connection and timers
    /// for every enabled backup schedule.
    pub async fn start(&self) -> Result<()> {
        let connections = self.sync.start_all().await?;
        let schedules = self.recovery.start_schedules().await?;
        info!(connections, schedules, "Engine started");
        Ok(())
    }

    /// Sends follow-up steps that have come due, for every user.
    pub async fn dispatch_follow_ups(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let users: BTreeSet<UserId> = storage::queries::activity::due_scheduled(&self.db, now)
            .await?
            .into_iter()
            .map(|log| log.user_id)
            .collect();

        let mut total = DispatchReport::default();
        for user_id in users {
            match self.business.dispatch_due_follow_ups(&user_id, now).await {
                Ok(report) => {
                    total.sent += report.sent;
                    total.failed += report.failed;
                    total.cancelled += report.cancelled;
                }
                Err(e) => warn!(user_id = %user_id, error = %e, "Follow-up dispatch failed"),
            }
        }
        Ok(total)
    }

    /// Stops every timer. Requests in flight finish but are not recorded.
    pub fn shutdown(&self) {
        self.sync.stop_all();
        let schedules = self.recovery.stop_schedules();
        info!(schedules, "Engine stopped");
    }
}
