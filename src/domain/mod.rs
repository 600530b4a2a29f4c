//! Domain layer types for the courier engine.
//!
//! Emails, folders, labels, provider connections, attachments, backups and
//! the business documents emails are sent for.

mod attachment;
mod backup;
mod document;
mod email;
mod folder;
mod provider;
mod secret;
mod types;

pub use attachment::{Attachment, AttachmentStatus};
pub use backup::{
    parse_time_of_day, Backup, BackupFrequency, BackupMetadata, BackupSchedule, BackupScope,
    BackupType, BACKUP_FORMAT_VERSION, SUPPORTED_BACKUP_VERSIONS,
};
pub use document::{
    format_cents, BusinessDocument, BusinessEmailLog, ClientInfo, DeliveryStatus,
    DocumentStatus, EmailActivity, FollowUpSequence, ReminderLevel, SyncHistoryEntry,
};
pub use email::{
    is_valid_email, Address, AttachmentRef, Direction, DocumentKind, DocumentRef, Email,
    EmailContent, EmailPatch, NewEmail, Recipients,
};
pub use folder::{
    system_folders, Folder, FolderUpdate, Label, NewFolder, DEFAULT_LABEL_COLOR,
};
pub use provider::{
    Capabilities, Feature, GoogleCredentials, MicrosoftCredentials, ProviderConfig,
    ProviderCredentials, ProviderKind, ServerCredentials, WebhookSubscription,
};
pub use secret::Secret;
pub use types::{
    AttachmentId, BackupId, ClientId, DocumentId, EmailId, FolderId, LabelId, ProviderId,
    ScheduleId, UserId,
};
