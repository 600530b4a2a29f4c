//! Engine services.
//!
//! Services own the engine's workflows and sit between callers and the
//! infrastructure layer:
//!
//! ```text
//!        Engine (lib.rs), daemon (main.rs)
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Providers, Storage, Object store)
//! ```
//!
//! # Services Overview
//!
//! - [`ProviderService`]: connection setup, OAuth, adapter cache and webhooks
//! - [`SyncService`]: per-connection sync timers and on-demand syncs
//! - [`ManagementService`]: send, receive, search, folders and labels
//! - [`BusinessService`]: invoice, quote and reminder mail, follow-ups, bulk sends
//! - [`AttachmentService`]: validation, scanning, quota and previews
//! - [`RecoveryService`]: backup, restore, export/import and schedules
//! - [`SettingsService`]: per-user settings with a read cache
//! - [`EventBus`]: typed engine events

mod attachment_service;
mod backup_archive;
mod business_service;
mod events;
mod mail_export;
mod management_service;
mod provider_service;
mod recovery_service;
mod settings_service;
mod sync_service;
mod template_service;
mod timers;

#[cfg(test)]
mod testing;

pub use attachment_service::{
    AttachmentDownload, AttachmentService, FileMetadata, FileUpload, FileValidation, Preview,
    ScanResult, StorageUsage, UploadBatch, UploadFailure,
};
pub use backup_archive::{ChunkEntry, Manifest, MANIFEST_NAME};
pub use business_service::{
    BusinessEmailJob, BusinessEmailKind, BusinessSendOptions, BusinessSendResult,
    BusinessService, DispatchReport, DocumentStore, FollowUpPlan, HistoryOptions,
    SqliteDocumentStore,
};
pub use events::{EngineEvent, EventBus, Listener, ListenerId, ALL_EVENTS};
pub use mail_export::{ExportEnvelope, ExportFormat, ExportMetadata, DEFAULT_CSV_FIELDS};
pub use management_service::{
    BulkSendReport, BulkSendResult, BulkSendSummary, ManagementService, SendReceipt, SendRequest,
    SendStage,
};
pub use provider_service::{
    OAuthCallback, OAuthGrant, ProviderChanges, ProviderService, ProviderSetup, ProviderStats,
    ProviderUsage, SealedTokenStore, WebhookTargetConnection,
};
pub use recovery_service::{
    BackupOptions, BackupVerification, ExportOptions, ExportResult, ImportFormat, ImportOptions,
    ImportReport, RecoveredEmails, RecoveryFilter, RecoveryService, RecoveryStats,
    RestoreOptions, RestoreReport, ScheduleChanges, ScheduleRequest,
};
pub use settings_service::{sanitize_signature, SettingsService};
pub use sync_service::{SyncResult, SyncService, SyncStatus};
pub use template_service::{EmailTemplate, RenderedTemplate, TemplateService, TemplateVars};
pub use timers::TimerRegistry;
