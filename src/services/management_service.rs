//! Email management orchestration.
//!
//! The [`ManagementService`] composes storage, the provider adapters and
//! template rendering into the workflows callers use: sending (single and
//! bulk), reading, labelling, filing and deleting mail. Every mutation is
//! announced on the [`EventBus`].
//!
//! # Send pipeline
//!
//! ```text
//! Validated -> TemplateApplied (optional) -> ProviderSent -> Stored -> EventEmitted
//! ```
//!
//! A failure before `ProviderSent` returns an error and nothing leaves the
//! engine. Once the provider has accepted the message, later failures are
//! reported as receipt warnings and never undo the send.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use super::provider_service::ProviderService;
use super::template_service::{EmailTemplate, RenderedTemplate, TemplateService, TemplateVars};
use crate::config::BulkSendConfig;
use crate::domain::{
    system_folders, Address, ClientId, DocumentRef, Email, EmailActivity, EmailContent, EmailId,
    EmailPatch, Feature, Folder, FolderId, FolderUpdate, Label, NewEmail, NewFolder, ProviderId,
    Recipients, UserId,
};
use crate::error::{EngineError, Result};
use crate::providers::email::{with_remediation, OutgoingAttachment, OutgoingEmail};
use crate::storage::queries::emails::{EmailQuery, EmailStats, SearchFilters};
use crate::storage::queries::folders::FolderStats;
use crate::storage::{queries, EmailPage, MailStore};

/// An email to send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendRequest {
    /// Connection to send through. The user's default when absent.
    pub provider_id: Option<ProviderId>,
    /// Sender shown on the local copy. The connection's mailbox when absent.
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Template to render subject and bodies from.
    pub template_id: Option<String>,
    pub variables: TemplateVars,
    pub attachments: Vec<OutgoingAttachment>,
    pub labels: Vec<String>,
    pub is_important: bool,
    pub in_reply_to: Option<String>,
    pub client_id: Option<ClientId>,
    pub related_documents: Vec<DocumentRef>,
}

impl SendRequest {
    pub fn new(to: Address, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to],
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    pub fn template(mut self, template_id: impl Into<String>, variables: TemplateVars) -> Self {
        self.template_id = Some(template_id.into());
        self.variables = variables;
        self
    }

    pub fn via(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn related(mut self, documents: Vec<DocumentRef>) -> Self {
        self.related_documents = documents;
        self
    }

    /// Every problem with the request, in a stable order.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.to.iter().all(|a| a.email.trim().is_empty()) {
            errors.push("Recipient email is required".to_string());
        } else if self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .any(|a| !a.is_valid())
        {
            errors.push("Invalid recipient email format".to_string());
        }
        if self.template_id.is_none() {
            if self.subject.trim().is_empty() {
                errors.push("Subject is required".to_string());
            }
            let content = EmailContent {
                text: self.text.clone(),
                html: self.html.clone(),
            };
            if content.is_empty() {
                errors.push("Email content is required".to_string());
            }
        }
        errors
    }

    fn recipient_summary(&self) -> String {
        self.to
            .iter()
            .map(|a| a.email.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Stage of the send pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStage {
    Validated,
    TemplateApplied,
    ProviderSent,
    Stored,
    EventEmitted,
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    /// Stages reached, in order.
    pub stages: Vec<SendStage>,
    /// Identifier assigned by the provider.
    pub message_id: String,
    pub provider_id: ProviderId,
    /// Subject as sent, after template rendering.
    pub subject: String,
    /// Local copy in the sent folder, absent if storing it failed.
    pub email: Option<Email>,
    /// Problems after the provider accepted the message.
    pub warnings: Vec<String>,
}

impl SendReceipt {
    pub fn reached(&self, stage: SendStage) -> bool {
        self.stages.contains(&stage)
    }
}

/// One entry of a bulk send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendResult {
    pub index: usize,
    pub recipient: String,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percentage, 0 when nothing was sent.
    pub success_rate: f64,
}

impl BulkSendSummary {
    pub fn from_results(results: &[BulkSendResult]) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.success).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64 * 100.0
        };
        Self {
            total,
            successful,
            failed: total - successful,
            success_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendReport {
    pub results: Vec<BulkSendResult>,
    pub summary: BulkSendSummary,
    pub batch_count: usize,
}

/// Runs `items` through `op` in batches: concurrent within a batch, with a
/// pause between batches. Results keep the input order.
pub(crate) async fn run_batched<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    delay: Duration,
    op: F,
) -> (Vec<R>, usize)
where
    F: Fn(usize, T) -> Fut,
    Fut: std::future::Future<Output = R>,
{
    let batch_size = batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut batch_count = 0;
    let mut items = items.into_iter().enumerate().peekable();

    while items.peek().is_some() {
        if batch_count > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let batch: Vec<_> = items.by_ref().take(batch_size).collect();
        batch_count += 1;
        debug!(batch = batch_count, size = batch.len(), "Sending batch");
        results.extend(join_all(batch.into_iter().map(|(index, item)| op(index, item))).await);
    }
    (results, batch_count)
}

/// Orchestrates mail workflows for all users.
pub struct ManagementService {
    store: MailStore,
    providers: Arc<ProviderService>,
    templates: Arc<TemplateService>,
    events: Arc<EventBus>,
    bulk: BulkSendConfig,
}

impl ManagementService {
    pub fn new(
        store: MailStore,
        providers: Arc<ProviderService>,
        templates: Arc<TemplateService>,
        events: Arc<EventBus>,
        bulk: BulkSendConfig,
    ) -> Self {
        Self {
            store,
            providers,
            templates,
            events,
            bulk,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends an email and keeps a copy in the sent folder.
    pub async fn send_email(&self, user_id: &UserId, request: SendRequest) -> Result<SendReceipt> {
        let errors = request.validation_errors();
        if !errors.is_empty() {
            debug!(user_id = %user_id, ?errors, "Rejected send request");
            return Err(EngineError::InvalidEmailData(errors));
        }
        let mut stages = vec![SendStage::Validated];
        let mut warnings = Vec::new();

        let mut request = request;
        if let Some(template_id) = request.template_id.clone() {
            let rendered = self.templates.render(&template_id, &request.variables)?;
            if !rendered.unresolved.is_empty() {
                warnings.push(format!(
                    "Unresolved template variables: {}",
                    rendered.unresolved.join(", ")
                ));
            }
            apply_rendered(&mut request, rendered);
            let content = EmailContent {
                text: request.text.clone(),
                html: request.html.clone(),
            };
            if content.is_empty() {
                return Err(EngineError::InvalidEmailData(vec![
                    "Email content is required".to_string(),
                ]));
            }
            stages.push(SendStage::TemplateApplied);
        }

        let config = self
            .providers
            .resolve(user_id, request.provider_id.as_ref())
            .await?;
        if !config.kind.supports(Feature::Send) {
            return Err(EngineError::UnsupportedOperation(format!(
                "{} cannot send mail",
                config.kind
            )));
        }
        let adapter = self.providers.adapter_for(&config).await?;

        let from = request.from.clone().unwrap_or_else(|| Address {
            email: config.email.clone(),
            name: config.display_name.clone(),
        });
        let outgoing = OutgoingEmail {
            from: from.clone(),
            to: request.to.clone(),
            cc: request.cc.clone(),
            bcc: request.bcc.clone(),
            subject: request.subject.clone(),
            body_text: request.text.clone(),
            body_html: request.html.clone(),
            in_reply_to: request.in_reply_to.clone(),
            attachments: request.attachments.clone(),
        };
        let message_id =
            with_remediation(adapter.as_ref(), || adapter.send_email(&outgoing)).await?;
        stages.push(SendStage::ProviderSent);
        info!(
            user_id = %user_id,
            provider_id = %config.id,
            message_id = %message_id,
            "Email sent"
        );

        let mut local = NewEmail::outbound(from, request.subject.clone())
            .to(Recipients {
                to: request.to.clone(),
                cc: request.cc.clone(),
                bcc: request.bcc.clone(),
            })
            .content(EmailContent {
                text: request.text.clone(),
                html: request.html.clone(),
            })
            .folder(system_folders::sent())
            .provider_message(Some(config.id.clone()), message_id.clone())
            .labels(request.labels.clone())
            .related(request.related_documents.clone());
        local.is_read = true;
        local.is_important = request.is_important;
        local.client_id = request.client_id.clone();

        let email = match self.store.store_email(user_id, local).await {
            Ok(email) => {
                stages.push(SendStage::Stored);
                Some(email)
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    message_id = %message_id,
                    error = %e,
                    "Email sent but local copy not stored"
                );
                warnings.push(format!("Email sent but not stored locally: {e}"));
                None
            }
        };

        let activity = EmailActivity {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            email_id: email.as_ref().map(|e| e.id.clone()),
            provider_id: Some(config.id.clone()),
            action: "email_sent".to_string(),
            details: serde_json::json!({
                "messageId": message_id,
                "recipient": request.recipient_summary(),
                "subject": request.subject,
                "templateId": request.template_id,
                "hasAttachments": !request.attachments.is_empty(),
            }),
            created_at: Utc::now(),
        };
        if let Err(e) = queries::activity::record_activity(self.store.db(), &activity).await {
            warn!(user_id = %user_id, error = %e, "Failed to record send activity");
            warnings.push(format!("Send activity not recorded: {e}"));
        }

        self.events.emit(EngineEvent::EmailSent {
            user_id: user_id.clone(),
            email_id: email.as_ref().map(|e| e.id.clone()),
            provider_id: config.id.clone(),
            message_id: message_id.clone(),
        });
        stages.push(SendStage::EventEmitted);

        Ok(SendReceipt {
            stages,
            message_id,
            provider_id: config.id,
            subject: request.subject,
            email,
            warnings,
        })
    }

    /// Sends many emails in batches. Each failure is captured on its own.
    pub async fn bulk_send(&self, user_id: &UserId, requests: Vec<SendRequest>) -> BulkSendReport {
        let total = requests.len();
        let (results, batch_count) = run_batched(
            requests,
            self.bulk.batch_size,
            Duration::from_millis(self.bulk.delay_ms),
            |index, request| async move {
                let recipient = request.recipient_summary();
                match self.send_email(user_id, request).await {
                    Ok(receipt) => BulkSendResult {
                        index,
                        recipient,
                        success: true,
                        message_id: Some(receipt.message_id),
                        error: None,
                    },
                    Err(e) => BulkSendResult {
                        index,
                        recipient,
                        success: false,
                        message_id: None,
                        error: Some(e.to_string()),
                    },
                }
            },
        )
        .await;

        let summary = BulkSendSummary::from_results(&results);
        info!(
            user_id = %user_id,
            total,
            successful = summary.successful,
            failed = summary.failed,
            batches = batch_count,
            "Bulk send finished"
        );
        BulkSendReport {
            results,
            summary,
            batch_count,
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    pub async fn fetch_emails(&self, user_id: &UserId, query: &EmailQuery) -> Result<EmailPage> {
        self.store.fetch_emails(user_id, query).await
    }

    pub async fn get_email(&self, user_id: &UserId, email_id: &EmailId) -> Result<Email> {
        self.store.get_email(user_id, email_id).await
    }

    pub async fn search_emails(
        &self,
        user_id: &UserId,
        text: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<Email>> {
        self.store.search_emails(user_id, text, filters).await
    }

    pub async fn get_email_stats(&self, user_id: &UserId) -> Result<EmailStats> {
        self.store.stats(user_id).await
    }

    // ========================================================================
    // Flags, deletion
    // ========================================================================

    pub async fn mark_as_read(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        is_read: bool,
    ) -> Result<Email> {
        self.patch(user_id, email_id, EmailPatch::read(is_read)).await
    }

    pub async fn star_email(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        is_starred: bool,
    ) -> Result<Email> {
        self.patch(user_id, email_id, EmailPatch::starred(is_starred)).await
    }

    async fn patch(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        patch: EmailPatch,
    ) -> Result<Email> {
        let email = self.store.update_email(user_id, email_id, &patch).await?;
        self.events.emit(EngineEvent::EmailUpdated {
            user_id: user_id.clone(),
            email_id: email_id.clone(),
        });
        Ok(email)
    }

    /// Applies one patch to many emails. Returns the number changed.
    pub async fn bulk_update(
        &self,
        user_id: &UserId,
        ids: &[EmailId],
        patch: &EmailPatch,
    ) -> Result<usize> {
        let changed = self.store.batch_update(user_id, ids, patch).await?;
        for id in ids {
            self.events.emit(EngineEvent::EmailUpdated {
                user_id: user_id.clone(),
                email_id: id.clone(),
            });
        }
        Ok(changed)
    }

    /// Soft-deletes, or removes for good when `permanent`.
    pub async fn delete_email(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        permanent: bool,
    ) -> Result<()> {
        if permanent {
            self.store.permanently_delete_email(user_id, email_id).await?;
        } else {
            self.store.delete_email(user_id, email_id).await?;
        }
        info!(user_id = %user_id, email_id = %email_id, permanent, "Deleted email");
        self.events.emit(EngineEvent::EmailDeleted {
            user_id: user_id.clone(),
            email_id: email_id.clone(),
            permanent,
        });
        Ok(())
    }

    pub async fn restore_email(&self, user_id: &UserId, email_id: &EmailId) -> Result<Email> {
        let email = self.store.restore_email(user_id, email_id).await?;
        self.events.emit(EngineEvent::EmailRestored {
            user_id: user_id.clone(),
            email_id: email_id.clone(),
        });
        Ok(email)
    }

    // ========================================================================
    // Folders
    // ========================================================================

    pub async fn get_folders(&self, user_id: &UserId) -> Result<Vec<Folder>> {
        self.store.list_folders(user_id).await
    }

    pub async fn create_folder(&self, user_id: &UserId, folder: NewFolder) -> Result<Folder> {
        self.store.create_folder(user_id, folder).await
    }

    pub async fn update_folder(
        &self,
        user_id: &UserId,
        folder_id: &FolderId,
        update: &FolderUpdate,
    ) -> Result<Folder> {
        self.store.update_folder(user_id, folder_id, update).await
    }

    /// Deletes a custom folder. Its emails move to the inbox.
    pub async fn delete_folder(&self, user_id: &UserId, folder_id: &FolderId) -> Result<usize> {
        self.store.delete_folder(user_id, folder_id).await
    }

    pub async fn get_folder_stats(
        &self,
        user_id: &UserId,
        folder_id: &FolderId,
    ) -> Result<FolderStats> {
        self.store.folder_stats(user_id, folder_id).await
    }

    pub async fn move_to_folder(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        folder_id: &FolderId,
    ) -> Result<Email> {
        let email = self.store.move_to_folder(user_id, email_id, folder_id).await?;
        self.events.emit(EngineEvent::EmailMoved {
            user_id: user_id.clone(),
            email_id: email_id.clone(),
            folder_id: folder_id.clone(),
        });
        Ok(email)
    }

    // ========================================================================
    // Labels
    // ========================================================================

    pub async fn get_labels(&self, user_id: &UserId) -> Result<Vec<Label>> {
        self.store.list_labels(user_id).await
    }

    pub async fn create_label(
        &self,
        user_id: &UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Label> {
        self.store.create_label(user_id, name, color).await
    }

    /// Applies a label by id or name, creating the label on first use.
    ///
    /// Applying a label the email already carries writes nothing, emits
    /// nothing and returns the email unchanged.
    pub async fn apply_label(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        label: &str,
    ) -> Result<Email> {
        let email = self.store.get_email(user_id, email_id).await?;
        if let Some(existing) = self.store.find_label(user_id, label).await? {
            if email.has_label(&existing.name) {
                debug!(email_id = %email_id, label = %existing.name, "Label already applied");
                return Ok(email);
            }
        }

        let label = self.store.resolve_or_create_label(user_id, label).await?;
        if !self.store.attach_label(user_id, email_id, &label.id).await? {
            return Ok(email);
        }
        self.events.emit(EngineEvent::LabelApplied {
            user_id: user_id.clone(),
            email_id: email_id.clone(),
            label: label.name,
        });
        self.store.get_email(user_id, email_id).await
    }

    pub async fn remove_label(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        label: &str,
    ) -> Result<Email> {
        let found = self
            .store
            .find_label(user_id, label)
            .await?
            .ok_or_else(|| EngineError::not_found("label", label))?;
        if self.store.detach_label(user_id, email_id, &found.id).await? {
            self.events.emit(EngineEvent::LabelRemoved {
                user_id: user_id.clone(),
                email_id: email_id.clone(),
                label: found.name,
            });
        }
        self.store.get_email(user_id, email_id).await
    }

    // ========================================================================
    // Templates
    // ========================================================================

    pub fn get_templates(&self) -> Vec<EmailTemplate> {
        self.templates.list()
    }

    pub fn save_template(&self, template: EmailTemplate) {
        self.templates.register(template);
    }

    pub fn apply_template(
        &self,
        template_id: &str,
        variables: &TemplateVars,
    ) -> Result<RenderedTemplate> {
        self.templates.render(template_id, variables)
    }
}

fn apply_rendered(request: &mut SendRequest, rendered: RenderedTemplate) {
    request.subject = rendered.subject;
    if rendered.html.is_some() {
        request.html = rendered.html;
    }
    if rendered.text.is_some() {
        request.text = rendered.text;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OAuthConfig, WebhookConfig};
    use crate::domain::ProviderKind;
    use crate::providers::email::{OAuthEndpoints, OAuthFlow, ProviderError};
    use crate::services::provider_service::ProviderSetup;
    use crate::services::testing::{gmail_setup, FakeConnector};
    use crate::storage::{CredentialVault, Database};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        service: ManagementService,
        connector: Arc<FakeConnector>,
        events: Arc<EventBus>,
        user: UserId,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let connector = Arc::new(FakeConnector::new());
        let events = Arc::new(EventBus::new());
        let providers = Arc::new(ProviderService::new(
            db.clone(),
            Arc::new(CredentialVault::ephemeral().unwrap()),
            connector.clone(),
            Arc::new(OAuthFlow::new(reqwest::Client::new(), OAuthEndpoints::default())),
            OAuthConfig::default(),
            WebhookConfig::default(),
            None,
            events.clone(),
        ));
        let user = UserId::from("user-1");
        let setup: ProviderSetup = serde_json::from_value(gmail_setup("me@gmail.com")).unwrap();
        providers.configure(&user, setup).await.unwrap();

        let service = ManagementService::new(
            MailStore::new(db),
            providers,
            Arc::new(TemplateService::new()),
            events.clone(),
            BulkSendConfig {
                batch_size: 2,
                delay_ms: 0,
            },
        );
        Fixture {
            service,
            connector,
            events,
            user,
        }
    }

    fn count_events(bus: &EventBus, name: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.add_event_listener(name, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[tokio::test]
    async fn validation_reports_every_problem_before_any_network_call() {
        let f = fixture().await;
        let request = SendRequest {
            to: vec![Address::new("")],
            ..Default::default()
        };

        let err = f.service.send_email(&f.user, request).await.unwrap_err();
        match err {
            EngineError::InvalidEmailData(errors) => {
                assert!(errors.contains(&"Recipient email is required".to_string()));
                assert!(errors.contains(&"Email content is required".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = f
            .service
            .send_email(&f.user, SendRequest::new(Address::new("invalid-email"), "Hi").text("x"))
            .await
            .unwrap_err();
        let expected = vec!["Invalid recipient email format".to_string()];
        assert!(matches!(err, EngineError::InvalidEmailData(ref e) if e == &expected));
        assert_eq!(f.connector.provider(ProviderKind::Gmail).sent_count(), 0);
    }

    #[tokio::test]
    async fn send_stores_a_copy_and_emits_an_event() {
        let f = fixture().await;
        let sent_events = count_events(&f.events, "email:sent");

        let receipt = f
            .service
            .send_email(
                &f.user,
                SendRequest::new(Address::new("client@example.com"), "Hello").text("Body"),
            )
            .await
            .unwrap();

        assert_eq!(
            receipt.stages,
            vec![
                SendStage::Validated,
                SendStage::ProviderSent,
                SendStage::Stored,
                SendStage::EventEmitted
            ]
        );
        assert!(receipt.warnings.is_empty());
        let email = receipt.email.unwrap();
        assert_eq!(email.folder_id, system_folders::sent());
        assert_eq!(email.provider_message_id.as_deref(), Some("msg-1"));
        assert!(email.is_read);
        assert_eq!(sent_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn templates_fill_subject_and_body() {
        let f = fixture().await;
        let mut vars = TemplateVars::new();
        vars.insert("client_name".into(), "Acme <Ltd>".into());
        vars.insert("document_number".into(), "INV-001".into());

        let receipt = f
            .service
            .send_email(
                &f.user,
                SendRequest::new(Address::new("client@example.com"), "").template("invoice", vars),
            )
            .await
            .unwrap();

        assert!(receipt.reached(SendStage::TemplateApplied));
        let sent = f.connector.provider(ProviderKind::Gmail).sent.lock().unwrap()[0].clone();
        assert!(sent.subject.contains("INV-001"));
        assert!(sent.body_html.unwrap().contains("Acme &lt;Ltd&gt;"));
        assert!(!receipt.warnings.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_is_surfaced_after_one_remediation() {
        let f = fixture().await;
        let fake = f.connector.provider(ProviderKind::Gmail);
        fake.fail_next_send(ProviderError::RateLimited {
            retry_after_secs: Some(0),
        });
        fake.fail_next_send(ProviderError::RateLimited {
            retry_after_secs: Some(0),
        });

        let err = f
            .service
            .send_email(
                &f.user,
                SendRequest::new(Address::new("client@example.com"), "Hi").text("x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
        assert_eq!(fake.sent_count(), 0);
    }

    #[tokio::test]
    async fn bulk_send_batches_and_captures_failures() {
        let f = fixture().await;
        let requests = vec![
            SendRequest::new(Address::new("a@example.com"), "1").text("x"),
            SendRequest::new(Address::new("not-an-address"), "2").text("x"),
            SendRequest::new(Address::new("c@example.com"), "3").text("x"),
        ];

        let report = f.service.bulk_send(&f.user, requests).await;

        assert_eq!(report.batch_count, 2);
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.successful, 2);
        assert_eq!(report.summary.failed, 1);
        assert!(!report.results[1].success);
        assert_eq!(report.results[2].index, 2);
    }

    #[tokio::test]
    async fn apply_label_is_idempotent() {
        let f = fixture().await;
        let applied = count_events(&f.events, "label:applied");
        let receipt = f
            .service
            .send_email(
                &f.user,
                SendRequest::new(Address::new("client@example.com"), "Hello").text("Body"),
            )
            .await
            .unwrap();
        let email_id = receipt.email.unwrap().id;

        let first = f.service.apply_label(&f.user, &email_id, "clients").await.unwrap();
        let second = f.service.apply_label(&f.user, &email_id, "clients").await.unwrap();

        assert_eq!(first.labels, vec!["clients".to_string()]);
        assert_eq!(first, second);
        assert_eq!(applied.load(Ordering::SeqCst), 1);

        let removed = f.service.remove_label(&f.user, &email_id, "clients").await.unwrap();
        assert!(removed.labels.is_empty());
    }

    #[tokio::test]
    async fn flags_and_deletion_emit_events() {
        let f = fixture().await;
        let deleted = count_events(&f.events, "email:deleted");
        let receipt = f
            .service
            .send_email(
                &f.user,
                SendRequest::new(Address::new("client@example.com"), "Hello").text("Body"),
            )
            .await
            .unwrap();
        let email_id = receipt.email.unwrap().id;

        let starred = f.service.star_email(&f.user, &email_id, true).await.unwrap();
        assert!(starred.is_starred);

        f.service.delete_email(&f.user, &email_id, false).await.unwrap();
        let restored = f.service.restore_email(&f.user, &email_id).await.unwrap();
        assert!(restored.deleted_at.is_none());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }
}
