//! Hand-written provider fakes shared by the service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::{ProviderConfig, ProviderCredentials, ProviderKind};
use crate::providers::email::{
    ConnectionStatus, EmailProvider, OutgoingEmail, ProviderConnector, ProviderError, Result,
    SyncBatch, SyncRequest, WebhookRegistration, WebhookTarget,
};

/// Scripted provider. Unscripted sends succeed with `msg-N`.
pub struct FakeProvider {
    kind: ProviderKind,
    pub sent: Mutex<Vec<OutgoingEmail>>,
    pub send_failures: Mutex<VecDeque<ProviderError>>,
    pub sync_batches: Mutex<VecDeque<SyncBatch>>,
    pub sync_requests: Mutex<Vec<SyncRequest>>,
    pub webhooks: Mutex<Vec<WebhookTarget>>,
    pub refreshes: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            sent: Mutex::new(Vec::new()),
            send_failures: Mutex::new(VecDeque::new()),
            sync_batches: Mutex::new(VecDeque::new()),
            sync_requests: Mutex::new(Vec::new()),
            webhooks: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_send(&self, error: ProviderError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn queue_sync(&self, batch: SyncBatch) {
        self.sync_batches.lock().unwrap().push_back(batch);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn test_connection(&self) -> Result<ConnectionStatus> {
        Ok(ConnectionStatus {
            connected: true,
            identity: Some("fake@example.com".to_string()),
        })
    }

    async fn refresh_token(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_email(&self, email: &OutgoingEmail) -> Result<String> {
        if !self.kind.capabilities().can_send {
            return Err(ProviderError::Unsupported("send".into()));
        }
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }

    async fn sync_emails(&self, request: &SyncRequest) -> Result<SyncBatch> {
        self.sync_requests.lock().unwrap().push(request.clone());
        Ok(self
            .sync_batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn register_webhook(&self, target: &WebhookTarget) -> Result<WebhookRegistration> {
        self.webhooks.lock().unwrap().push(target.clone());
        Ok(WebhookRegistration {
            subscription_id: format!("sub-{}", self.webhooks.lock().unwrap().len()),
            resource: "me/mailFolders('Inbox')/messages".to_string(),
            expires_at: None,
        })
    }

    async fn unregister_webhook(&self, _subscription_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Hands out one [`FakeProvider`] per provider kind.
#[derive(Default)]
pub struct FakeConnector {
    providers: Mutex<HashMap<ProviderKind, Arc<FakeProvider>>>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, kind: ProviderKind) -> Arc<FakeProvider> {
        Arc::clone(
            self.providers
                .lock()
                .unwrap()
                .entry(kind)
                .or_insert_with(|| Arc::new(FakeProvider::new(kind))),
        )
    }
}

impl ProviderConnector for FakeConnector {
    fn connect(
        &self,
        config: &ProviderConfig,
        credentials: ProviderCredentials,
    ) -> Result<Arc<dyn EmailProvider>> {
        assert_eq!(credentials.kind(), config.kind);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.provider(config.kind))
    }
}

/// Wire-form setup for a Gmail connection.
pub fn gmail_setup(email: &str) -> serde_json::Value {
    serde_json::json!({
        "provider": "gmail",
        "email": email,
        "config": {
            "clientId": "client-id",
            "clientSecret": "client-secret",
            "refreshToken": "refresh-token"
        }
    })
}

/// Wire-form setup for an SMTP connection.
pub fn smtp_setup(email: &str) -> serde_json::Value {
    serde_json::json!({
        "provider": "smtp",
        "email": email,
        "config": {
            "host": "smtp.example.com",
            "port": 465,
            "username": email,
            "password": "app-password"
        }
    })
}
