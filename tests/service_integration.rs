//! Integration tests for the engine.
//!
//! These tests drive cross-module scenarios through the public `Engine` API
//! with an in-memory database, an in-memory object store and a scripted
//! provider. Each service module contains its own unit tests for detailed
//! logic testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use courier::config::OAuthConfig;
use courier::domain::{
    Address, BusinessDocument, ClientId, ClientInfo, DocumentId, DocumentKind, DocumentStatus,
    EmailContent, NewEmail, ProviderConfig, ProviderCredentials, ProviderKind, UserId,
};
use courier::providers::email::{
    ConnectionStatus, EmailProvider, OAuthClient, OutgoingEmail, ProviderConnector, Result,
    SyncBatch, SyncRequest,
};
use courier::services::{
    BackupOptions, BusinessSendOptions, EngineEvent, OAuthCallback, ProviderSetup,
    RestoreOptions, SendRequest,
};
use courier::storage::{
    ConflictStrategy, CredentialVault, Database, MailStore, MemoryObjectStore,
};
use courier::{Engine, EngineConfig, EngineError};
use pretty_assertions::assert_eq;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct ScriptedProvider {
    sent: Mutex<Vec<OutgoingEmail>>,
    batches: Mutex<VecDeque<SyncBatch>>,
    requests: Mutex<Vec<SyncRequest>>,
}

#[async_trait]
impl EmailProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        Ok(ConnectionStatus {
            connected: true,
            identity: None,
        })
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("sent-{}", sent.len()))
    }

    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct ScriptedConnector(Arc<ScriptedProvider>);

impl ProviderConnector for ScriptedConnector {
    fn connect(
        &self,
        _config: &ProviderConfig,
        _credentials: ProviderCredentials,
    ) -> Result<Arc<dyn EmailProvider>> {
        Ok(self.0.clone())
    }
}

struct Harness {
    engine: Engine,
    provider: Arc<ScriptedProvider>,
    user: UserId,
}

async fn harness() -> Harness {
    let mut config = EngineConfig::default();
    config.bulk_send.delay_ms = 0;
    config.oauth = OAuthConfig {
        google: Some(OAuthClient {
            client_id: "client-id".into(),
            client_secret: "client-secret".into(),
            redirect_uri: "https://app.example.com/oauth/callback".into(),
            tenant_id: "common".into(),
        }),
        ..Default::default()
    };

    let provider = Arc::new(ScriptedProvider::default());
    let engine = Engine::builder(config)
        .database(Database::open_in_memory().await.unwrap())
        .object_store(Arc::new(MemoryObjectStore::new()))
        .vault(CredentialVault::ephemeral().unwrap())
        .connector(Arc::new(ScriptedConnector(provider.clone())))
        .without_keychain()
        .build()
        .await
        .unwrap();

    Harness {
        engine,
        provider,
        user: UserId::from("user-1"),
    }
}

async fn connect_gmail(h: &Harness) -> ProviderConfig {
    let setup: ProviderSetup = serde_json::from_value(serde_json::json!({
        "provider": "gmail",
        "email": "me@gmail.com",
        "config": {
            "clientId": "client-id",
            "clientSecret": "client-secret",
            "refreshToken": "refresh-token"
        }
    }))
    .unwrap();
    h.engine.providers().configure(&h.user, setup).await.unwrap()
}

fn inbound(id: &str, subject: &str) -> NewEmail {
    NewEmail::inbound(Address::new("sender@example.com"), subject)
        .content(EmailContent::text("Hello there"))
        .provider_message(None, id)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn invoice_email_marks_the_invoice_sent() {
    let h = harness().await;
    connect_gmail(&h).await;
    let mut events = h.engine.events().subscribe();

    let invoice = BusinessDocument {
        id: DocumentId::from("inv-7"),
        user_id: h.user.clone(),
        kind: DocumentKind::Invoice,
        number: "INV-007".into(),
        amount_cents: 42_050,
        currency: "EUR".into(),
        status: DocumentStatus::Draft,
        client: ClientInfo {
            id: Some(ClientId::from("client-9")),
            name: "Globex".into(),
            company: None,
            email: Some("ap@globex.example".into()),
        },
        issue_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
        due_date: NaiveDate::from_ymd_opt(2025, 3, 31),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let business = h.engine.business();
    business.documents().save_document(&invoice).await.unwrap();

    let result = business
        .send_invoice_email(&h.user, &invoice.id, BusinessSendOptions::default())
        .await
        .unwrap();
    assert!(result.status_changed);

    let sent = h.provider.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to[0].email, "ap@globex.example");
    assert!(sent[0].subject.contains("INV-007"));

    let stored = business
        .documents()
        .get_document(&h.user, DocumentKind::Invoice, &invoice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, DocumentStatus::Sent);

    let mut saw_business_event = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::BusinessEmailSent { .. }) {
            saw_business_event = true;
        }
    }
    assert!(saw_business_event);
}

#[tokio::test]
async fn encrypted_backup_restores_deleted_mail() {
    let h = harness().await;
    let store = MailStore::new(h.engine.database().clone());
    let mut ids = Vec::new();
    for i in 0..5 {
        let email = store
            .store_email(&h.user, inbound(&format!("<m{i}@example.com>"), &format!("Report {i}")))
            .await
            .unwrap();
        ids.push(email.id);
    }

    let recovery = h.engine.recovery();
    let backup = recovery
        .create_backup(
            &h.user,
            BackupOptions {
                batch_size: Some(2),
                ..BackupOptions::full().encrypted("correct horse")
            },
        )
        .await
        .unwrap();
    assert_eq!(backup.email_count, 5);
    assert!(backup.encrypted);
    assert_eq!(backup.chunk_count, 3);

    for id in &ids[..3] {
        store.permanently_delete_email(&h.user, id).await.unwrap();
    }
    assert_eq!(store.stats(&h.user).await.unwrap().total, 2);

    let wrong = recovery
        .restore_backup(
            &h.user,
            &backup.id,
            RestoreOptions {
                strategy: ConflictStrategy::Skip,
                password: Some("wrong".into()),
            },
        )
        .await;
    assert!(matches!(wrong, Err(EngineError::BackupValidationFailed(_))));
    assert_eq!(store.stats(&h.user).await.unwrap().total, 2);

    let report = recovery
        .restore_backup(
            &h.user,
            &backup.id,
            RestoreOptions {
                strategy: ConflictStrategy::Skip,
                password: Some("correct horse".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(report.restored_count, 3);
    assert_eq!(report.skipped_count, 2);
    assert_eq!(store.stats(&h.user).await.unwrap().total, 5);
    assert_eq!(store.get_email(&h.user, &ids[0]).await.unwrap().subject, "Report 0");
}

#[tokio::test]
async fn second_sync_continues_from_the_stored_token() {
    let h = harness().await;
    let connection = connect_gmail(&h).await;

    h.provider.batches.lock().unwrap().push_back(SyncBatch {
        emails: vec![inbound("<a@example.com>", "A"), inbound("<b@example.com>", "B")],
        next_token: Some("history-100".into()),
    });
    let first = h.engine.sync().sync_provider(&h.user, &connection.id).await.unwrap();
    assert_eq!(first.emails_received, 2);

    h.provider.batches.lock().unwrap().push_back(SyncBatch {
        emails: vec![inbound("<b@example.com>", "B"), inbound("<c@example.com>", "C")],
        next_token: Some("history-104".into()),
    });
    let second = h.engine.sync().sync_provider(&h.user, &connection.id).await.unwrap();
    assert!(second.incremental);
    assert_eq!(second.emails_received, 1);
    assert_eq!(second.duplicates_skipped, 1);

    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests[1].since_token.as_deref(), Some("history-100"));
}

#[tokio::test]
async fn oauth_callback_rejects_a_mismatched_state() {
    let h = harness().await;
    let providers = h.engine.providers();
    let request = providers.initiate_oauth(&h.user, ProviderKind::Gmail).unwrap();
    assert!(request.auth_url.contains("code_challenge"));

    let mismatched = providers
        .handle_oauth_callback(
            ProviderKind::Gmail,
            &OAuthCallback {
                code: "code".into(),
                state: request.state.clone(),
                expected_state: "something-else".into(),
            },
        )
        .await;
    assert!(matches!(mismatched, Err(EngineError::InvalidState)));

    let unknown = providers
        .handle_oauth_callback(
            ProviderKind::Gmail,
            &OAuthCallback {
                code: "code".into(),
                state: "never-issued".into(),
                expected_state: "never-issued".into(),
            },
        )
        .await;
    assert!(matches!(unknown, Err(EngineError::InvalidState)));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_side_effect() {
    let h = harness().await;
    connect_gmail(&h).await;

    let err = h
        .engine
        .management()
        .send_email(&h.user, SendRequest::default())
        .await
        .unwrap_err();
    let EngineError::InvalidEmailData(errors) = err else {
        panic!("expected InvalidEmailData");
    };
    assert!(!errors.is_empty());
    assert!(h.provider.sent.lock().unwrap().is_empty());

    let settings = h
        .engine
        .settings()
        .update_settings(&h.user, serde_json::json!({ "display": { "emailsPerPage": 0 } }))
        .await;
    assert!(matches!(settings, Err(EngineError::InvalidSettings(_))));
    assert_eq!(
        h.engine.settings().get_settings(&h.user).await.unwrap().display.emails_per_page,
        50
    );
}
