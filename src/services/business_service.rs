//! Business document email integration.
//!
//! Sends invoices, quotes and payment reminders through the generic send
//! path, records every attempt in the business email log, and runs
//! automated follow-up sequences as scheduled log rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::events::{EngineEvent, EventBus};
use super::management_service::{
    run_batched, BulkSendReport, BulkSendResult, BulkSendSummary, ManagementService, SendReceipt,
    SendRequest,
};
use super::template_service::TemplateVars;
use crate::config::{BulkSendConfig, BusinessProfile};
use crate::domain::{
    Address, BusinessDocument, BusinessEmailLog, ClientId, DeliveryStatus, DocumentId,
    DocumentKind, DocumentRef, DocumentStatus, FollowUpSequence, ProviderId, ReminderLevel, UserId,
};
use crate::error::{EngineError, Result};
use crate::storage::queries::{self, activity::LogFilter};
use crate::storage::Database;

/// Access to the host application's invoices and quotes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(
        &self,
        user_id: &UserId,
        kind: DocumentKind,
        id: &DocumentId,
    ) -> Result<Option<BusinessDocument>>;

    async fn save_document(&self, document: &BusinessDocument) -> Result<()>;

    /// Moves a draft to `status`. Returns false if it was not a draft.
    async fn promote_draft(
        &self,
        user_id: &UserId,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<bool>;
}

/// [`DocumentStore`] over the `business_documents` table.
pub struct SqliteDocumentStore {
    db: Database,
}

impl SqliteDocumentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_document(
        &self,
        user_id: &UserId,
        kind: DocumentKind,
        id: &DocumentId,
    ) -> Result<Option<BusinessDocument>> {
        Ok(queries::documents::get(&self.db, user_id, kind, id).await?)
    }

    async fn save_document(&self, document: &BusinessDocument) -> Result<()> {
        Ok(queries::documents::upsert(&self.db, document).await?)
    }

    async fn promote_draft(
        &self,
        user_id: &UserId,
        id: &DocumentId,
        status: DocumentStatus,
    ) -> Result<bool> {
        Ok(queries::documents::promote_draft(&self.db, user_id, id, status).await?)
    }
}

/// Per-send options for business emails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusinessSendOptions {
    /// Overrides the client's email on the document.
    pub recipient: Option<String>,
    /// Overrides the default template for the email type.
    pub template_id: Option<String>,
    pub custom_message: Option<String>,
    pub provider_id: Option<ProviderId>,
}

/// What kind of business email to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusinessEmailKind {
    Invoice,
    Quote,
    Reminder { level: ReminderLevel },
}

impl BusinessEmailKind {
    fn document_kind(&self) -> DocumentKind {
        match self {
            Self::Invoice | Self::Reminder { .. } => DocumentKind::Invoice,
            Self::Quote => DocumentKind::Quote,
        }
    }

    fn email_type(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice_sent",
            Self::Quote => "quote_sent",
            Self::Reminder { level } => level.email_type(),
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Quote => "quote",
            Self::Reminder { level } => level.template_id(),
        }
    }

    /// Status a draft moves to once the email is out.
    fn promotes_to(&self) -> Option<DocumentStatus> {
        match self {
            Self::Invoice | Self::Quote => Some(DocumentStatus::Sent),
            Self::Reminder { .. } => None,
        }
    }
}

/// A successful business send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessSendResult {
    pub receipt: SendReceipt,
    pub document_id: DocumentId,
    pub email_type: String,
    /// Whether the document moved out of draft.
    pub status_changed: bool,
}

/// The immediate send and the rows scheduled for later steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpPlan {
    pub first: BusinessSendResult,
    pub scheduled: Vec<BusinessEmailLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    /// Steps dropped because the invoice was paid or cancelled.
    pub cancelled: usize,
}

/// One entry of a business bulk send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessEmailJob {
    #[serde(flatten)]
    pub kind: BusinessEmailKind,
    pub document_id: DocumentId,
    #[serde(default)]
    pub options: BusinessSendOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryOptions {
    pub limit: Option<u32>,
    /// Email types to keep. All when empty.
    pub types: Vec<String>,
}

const HISTORY_ROW_LIMIT: u32 = 10_000;

fn document_entity(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Invoice => "invoice",
        DocumentKind::Quote => "quote",
    }
}

/// Business email workflows on top of [`ManagementService`].
pub struct BusinessService {
    management: Arc<ManagementService>,
    documents: Arc<dyn DocumentStore>,
    db: Database,
    events: Arc<EventBus>,
    profile: BusinessProfile,
    bulk: BulkSendConfig,
}

impl BusinessService {
    pub fn new(
        management: Arc<ManagementService>,
        documents: Arc<dyn DocumentStore>,
        db: Database,
        events: Arc<EventBus>,
        profile: BusinessProfile,
        bulk: BulkSendConfig,
    ) -> Self {
        Self {
            management,
            documents,
            db,
            events,
            profile,
            bulk,
        }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub async fn send_invoice_email(
        &self,
        user_id: &UserId,
        invoice_id: &DocumentId,
        options: BusinessSendOptions,
    ) -> Result<BusinessSendResult> {
        self.send(user_id, BusinessEmailKind::Invoice, invoice_id, options).await
    }

    pub async fn send_quote_email(
        &self,
        user_id: &UserId,
        quote_id: &DocumentId,
        options: BusinessSendOptions,
    ) -> Result<BusinessSendResult> {
        self.send(user_id, BusinessEmailKind::Quote, quote_id, options).await
    }

    pub async fn send_payment_reminder(
        &self,
        user_id: &UserId,
        invoice_id: &DocumentId,
        level: ReminderLevel,
        options: BusinessSendOptions,
    ) -> Result<BusinessSendResult> {
        self.send(user_id, BusinessEmailKind::Reminder { level }, invoice_id, options)
            .await
    }

    /// Sends the first reminder now and schedules the rest of the sequence.
    ///
    /// The invoice and recipient are resolved before anything is sent. Once
    /// the first reminder is out, a step that cannot be scheduled becomes a
    /// warning on its receipt.
    pub async fn send_automated_follow_up_sequence(
        &self,
        user_id: &UserId,
        invoice_id: &DocumentId,
        sequence: FollowUpSequence,
        options: BusinessSendOptions,
    ) -> Result<FollowUpPlan> {
        let steps = sequence.steps();
        let Some(((_, first_level), later)) = steps.split_first() else {
            return Err(EngineError::InvalidOperation("empty follow-up sequence".into()));
        };

        let document = self.document(user_id, DocumentKind::Invoice, invoice_id).await?;
        let recipient = self.recipient(&document, &options)?;

        let mut first = self
            .send(
                user_id,
                BusinessEmailKind::Reminder { level: *first_level },
                invoice_id,
                options.clone(),
            )
            .await?;

        let now = Utc::now();
        let mut scheduled = Vec::with_capacity(later.len());
        for (days, level) in later {
            let log = BusinessEmailLog {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user_id.clone(),
                client_id: document.client.id.clone(),
                document_kind: Some(DocumentKind::Invoice),
                document_id: Some(document.id.clone()),
                document_number: Some(document.number.clone()),
                amount_cents: Some(document.amount_cents),
                currency: Some(document.currency.clone()),
                email_type: level.email_type().to_string(),
                status: DeliveryStatus::Scheduled,
                recipient_email: recipient.clone(),
                subject: String::new(),
                template_id: Some(level.template_id().to_string()),
                message_id: None,
                error: None,
                scheduled_for: Some(now + chrono::Duration::days(*days)),
                created_at: now,
            };
            match queries::activity::insert_log(&self.db, &log).await {
                Ok(()) => scheduled.push(log),
                Err(e) => {
                    warn!(
                        user_id = %user_id,
                        invoice_id = %invoice_id,
                        error = %e,
                        "Failed to schedule follow-up"
                    );
                    first
                        .receipt
                        .warnings
                        .push(format!("{} not scheduled: {e}", level.email_type()));
                }
            }
        }

        info!(
            user_id = %user_id,
            invoice_id = %invoice_id,
            ?sequence,
            scheduled = scheduled.len(),
            "Started follow-up sequence"
        );
        Ok(FollowUpPlan { first, scheduled })
    }

    /// Sends every scheduled follow-up of `user_id` that is due at `now`.
    ///
    /// Steps for invoices that were paid or cancelled in the meantime are
    /// dropped instead of sent.
    pub async fn dispatch_due_follow_ups(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport> {
        let due = queries::activity::due_scheduled(&self.db, now).await?;
        let mut report = DispatchReport::default();

        for log in due.into_iter().filter(|l| &l.user_id == user_id) {
            let Some(document_id) = log.document_id.clone() else {
                continue;
            };
            let document = self
                .documents
                .get_document(user_id, DocumentKind::Invoice, &document_id)
                .await?;
            let settled = document
                .as_ref()
                .map_or(true, |d| {
                    matches!(d.status, DocumentStatus::Paid | DocumentStatus::Cancelled)
                });
            if settled {
                queries::activity::resolve_scheduled(
                    &self.db,
                    &log.id,
                    DeliveryStatus::Failed,
                    None,
                    Some("cancelled: invoice settled".into()),
                )
                .await?;
                report.cancelled += 1;
                continue;
            }

            let level =
                ReminderLevel::from_email_type(&log.email_type).unwrap_or(ReminderLevel::Gentle);
            let options = BusinessSendOptions {
                recipient: Some(log.recipient_email.clone()),
                template_id: log.template_id.clone(),
                ..Default::default()
            };
            match self
                .deliver(user_id, BusinessEmailKind::Reminder { level }, &document_id, &options)
                .await
            {
                Ok((_, receipt)) => {
                    queries::activity::resolve_scheduled(
                        &self.db,
                        &log.id,
                        DeliveryStatus::Sent,
                        Some(receipt.message_id),
                        None,
                    )
                    .await?;
                    report.sent += 1;
                }
                Err(e) => {
                    warn!(log_id = %log.id, error = %e, "Scheduled follow-up failed");
                    queries::activity::resolve_scheduled(
                        &self.db,
                        &log.id,
                        DeliveryStatus::Failed,
                        None,
                        Some(e.to_string()),
                    )
                    .await?;
                    report.failed += 1;
                }
            }
        }

        if report != DispatchReport::default() {
            info!(
                user_id = %user_id,
                sent = report.sent,
                failed = report.failed,
                cancelled = report.cancelled,
                "Dispatched follow-ups"
            );
        }
        Ok(report)
    }

    /// Sends many business emails in batches, capturing each failure.
    pub async fn bulk_send_business_emails(
        &self,
        user_id: &UserId,
        jobs: Vec<BusinessEmailJob>,
    ) -> BulkSendReport {
        let (results, batch_count) = run_batched(
            jobs,
            self.bulk.batch_size,
            Duration::from_millis(self.bulk.delay_ms),
            |index, job| async move {
                let recipient = job.options.recipient.clone().unwrap_or_default();
                match self.send(user_id, job.kind, &job.document_id, job.options).await {
                    Ok(result) => BulkSendResult {
                        index,
                        recipient,
                        success: true,
                        message_id: Some(result.receipt.message_id),
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
            total = summary.total,
            successful = summary.successful,
            "Bulk business send finished"
        );
        BulkSendReport {
            results,
            summary,
            batch_count,
        }
    }

    /// Business emails exchanged with one client, newest first.
    pub async fn get_client_email_history(
        &self,
        user_id: &UserId,
        client_id: &ClientId,
        options: &HistoryOptions,
    ) -> Result<Vec<BusinessEmailLog>> {
        let filter = LogFilter {
            client_id: Some(client_id.clone()),
            limit: if options.types.is_empty() {
                options.limit
            } else {
                Some(HISTORY_ROW_LIMIT)
            },
            ..Default::default()
        };
        let mut logs = queries::activity::list_logs(&self.db, user_id, &filter).await?;
        if !options.types.is_empty() {
            logs.retain(|l| options.types.contains(&l.email_type));
            if let Some(limit) = options.limit {
                logs.truncate(limit as usize);
            }
        }
        Ok(logs)
    }

    /// Appends a row to the business email log on behalf of the caller.
    pub async fn log_email_activity(
        &self,
        user_id: &UserId,
        mut entry: BusinessEmailLog,
    ) -> Result<BusinessEmailLog> {
        entry.user_id = user_id.clone();
        if entry.id.is_empty() {
            entry.id = uuid::Uuid::new_v4().to_string();
        }
        queries::activity::insert_log(&self.db, &entry).await?;
        Ok(entry)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn document(
        &self,
        user_id: &UserId,
        kind: DocumentKind,
        id: &DocumentId,
    ) -> Result<BusinessDocument> {
        self.documents
            .get_document(user_id, kind, id)
            .await?
            .ok_or_else(|| EngineError::not_found(document_entity(kind), id))
    }

    fn recipient(
        &self,
        document: &BusinessDocument,
        options: &BusinessSendOptions,
    ) -> Result<String> {
        options
            .recipient
            .clone()
            .or_else(|| document.client.email.clone())
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| {
                EngineError::InvalidEmailData(vec!["Recipient email is required".into()])
            })
    }

    fn variables(
        &self,
        document: &BusinessDocument,
        options: &BusinessSendOptions,
    ) -> TemplateVars {
        let today = Utc::now().date_naive();
        let mut vars = TemplateVars::new();
        vars.insert("client_name".into(), document.client.name.clone());
        vars.insert(
            "client_company".into(),
            document.client.company.clone().unwrap_or_else(|| document.client.name.clone()),
        );
        vars.insert("document_number".into(), document.number.clone());
        vars.insert("total_amount".into(), document.formatted_amount());
        vars.insert("currency".into(), document.currency.clone());
        vars.insert("issue_date".into(), document.issue_date.format("%Y-%m-%d").to_string());
        if let Some(due) = document.due_date {
            vars.insert("due_date".into(), due.format("%Y-%m-%d").to_string());
        }
        vars.insert("days_overdue".into(), document.days_overdue(today).to_string());
        vars.insert(
            "custom_message".into(),
            options.custom_message.clone().unwrap_or_default(),
        );
        vars.insert("company_name".into(), self.profile.company_name.clone());
        for (key, value) in [
            ("company_email", &self.profile.email),
            ("company_phone", &self.profile.phone),
            ("company_address", &self.profile.address),
            ("company_website", &self.profile.website),
        ] {
            vars.insert(key.into(), value.clone().unwrap_or_default());
        }
        vars
    }

    /// Sends without logging.
    async fn deliver(
        &self,
        user_id: &UserId,
        kind: BusinessEmailKind,
        document_id: &DocumentId,
        options: &BusinessSendOptions,
    ) -> Result<(BusinessDocument, SendReceipt)> {
        let document = self.document(user_id, kind.document_kind(), document_id).await?;
        let recipient = self.recipient(&document, options)?;
        let template = options
            .template_id
            .clone()
            .unwrap_or_else(|| kind.default_template().to_string());

        let mut request = SendRequest::new(
            Address::with_name(recipient, document.client.name.clone()),
            "",
        )
            .template(template, self.variables(&document, options))
            .related(vec![DocumentRef {
                kind: document.kind,
                id: document.id.clone(),
            }]);
        request.provider_id = options.provider_id.clone();
        request.client_id = document.client.id.clone();

        let receipt = self.management.send_email(user_id, request).await?;
        Ok((document, receipt))
    }

    async fn send(
        &self,
        user_id: &UserId,
        kind: BusinessEmailKind,
        document_id: &DocumentId,
        options: BusinessSendOptions,
    ) -> Result<BusinessSendResult> {
        let template_id = options
            .template_id
            .clone()
            .unwrap_or_else(|| kind.default_template().to_string());

        match self.deliver(user_id, kind, document_id, &options).await {
            Ok((document, mut receipt)) => {
                // Already sent: a failed promotion is reported as a warning.
                let promotion = match kind.promotes_to() {
                    Some(status) => {
                        Some(self.documents.promote_draft(user_id, &document.id, status).await)
                    }
                    None => None,
                };
                let status_changed = match promotion {
                    Some(Ok(changed)) => changed,
                    Some(Err(e)) => {
                        warn!(
                            user_id = %user_id,
                            document_id = %document.id,
                            error = %e,
                            "Sent, but failed to update document status"
                        );
                        receipt.warnings.push(format!("document status not updated: {e}"));
                        false
                    }
                    None => false,
                };
                self.log(
                    user_id,
                    kind,
                    Some(&document),
                    DeliveryStatus::Sent,
                    &template_id,
                    receipt.to_addresses(),
                    &receipt.subject,
                    Some(receipt.message_id.clone()),
                    None,
                )
                .await;
                self.events.emit(EngineEvent::BusinessEmailSent {
                    user_id: user_id.clone(),
                    document_id: document.id.clone(),
                    email_type: kind.email_type().to_string(),
                });
                info!(
                    user_id = %user_id,
                    document_id = %document.id,
                    email_type = kind.email_type(),
                    status_changed,
                    "Business email sent"
                );
                Ok(BusinessSendResult {
                    receipt,
                    document_id: document.id,
                    email_type: kind.email_type().to_string(),
                    status_changed,
                })
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    document_id = %document_id,
                    email_type = kind.email_type(),
                    error = %e,
                    "Business email failed"
                );
                let document = self
                    .documents
                    .get_document(user_id, kind.document_kind(), document_id)
                    .await
                    .ok()
                    .flatten();
                let recipient = document
                    .as_ref()
                    .and_then(|d| self.recipient(d, &options).ok())
                    .or(options.recipient.clone())
                    .unwrap_or_default();
                self.log(
                    user_id,
                    kind,
                    document.as_ref(),
                    DeliveryStatus::Failed,
                    &template_id,
                    recipient,
                    "",
                    None,
                    Some(e.to_string()),
                )
                .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log(
        &self,
        user_id: &UserId,
        kind: BusinessEmailKind,
        document: Option<&BusinessDocument>,
        status: DeliveryStatus,
        template_id: &str,
        recipient: String,
        subject: &str,
        message_id: Option<String>,
        error: Option<String>,
    ) {
        let entry = BusinessEmailLog {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            client_id: document.and_then(|d| d.client.id.clone()),
            document_kind: Some(kind.document_kind()),
            document_id: document.map(|d| d.id.clone()),
            document_number: document.map(|d| d.number.clone()),
            amount_cents: document.map(|d| d.amount_cents),
            currency: document.map(|d| d.currency.clone()),
            email_type: kind.email_type().to_string(),
            status,
            recipient_email: recipient,
            subject: subject.to_string(),
            template_id: Some(template_id.to_string()),
            message_id,
            error,
            scheduled_for: None,
            created_at: Utc::now(),
        };
        if let Err(e) = queries::activity::insert_log(&self.db, &entry).await {
            warn!(user_id = %user_id, error = %e, "Failed to write business email log");
        }
    }
}

impl SendReceipt {
    fn to_addresses(&self) -> String {
        self.email
            .as_ref()
            .map(|e| {
                e.recipients
                    .to
                    .iter()
                    .map(|a| a.email.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    }
}
