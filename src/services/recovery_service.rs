//! Backup, restore, export and retention.
//!
//! Backups are written chunk by chunk into the object store under
//! `backups/{user}/{backup}` and only recorded in the database once every
//! object is in place. Restores verify the whole archive before the first
//! write and then apply every record in one transaction.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::backup_archive::{
    chunk_path, manifest_path, parse_manifest, ChunkCodec, ChunkEntry, Manifest,
};
use super::events::{EngineEvent, EventBus};
use super::mail_export::{self, ExportFormat};
use super::timers::TimerRegistry;
use crate::config::BackupDefaults;
use crate::domain::{
    parse_time_of_day, Backup, BackupFrequency, BackupId, BackupMetadata, BackupSchedule,
    BackupScope, BackupType, Email, EmailActivity, EmailId, FolderId, ScheduleId, UserId,
    BACKUP_FORMAT_VERSION,
};
use crate::error::{EngineError, Result};
use crate::storage::queries::{
    self,
    emails::{DeletedScope, Selection},
};
use crate::storage::{ApplyOutcome, ConflictStrategy, Database, MailStore, ObjectStore};

/// How often schedule timers check whether their backup is due.
const SCHEDULE_POLL: Duration = Duration::from_secs(60);

/// Page size when reading emails for export and recovery.
const READ_PAGE: u32 = 500;

const RECOVERY_ACTION: &str = "recovery";

fn schedule_key(id: &ScheduleId) -> String {
    format!("backup:{id}")
}

// ============================================================================
// Requests and reports
// ============================================================================

/// Options for [`RecoveryService::create_backup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupOptions {
    /// Full when absent.
    pub backup_type: Option<BackupType>,
    /// Incremental cutoff. Defaults to the last backup's creation time.
    pub since: Option<DateTime<Utc>>,
    /// Selective: folders to include.
    pub folder_ids: Vec<FolderId>,
    /// Selective: individual emails to include.
    pub email_ids: Vec<EmailId>,
    pub include_deleted: bool,
    pub compress: Option<bool>,
    /// Encrypt with a key derived from this password.
    pub password: Option<String>,
    pub encrypt: bool,
    pub batch_size: Option<usize>,
}

impl BackupOptions {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn incremental(since: Option<DateTime<Utc>>) -> Self {
        Self {
            backup_type: Some(BackupType::Incremental),
            since,
            ..Default::default()
        }
    }

    pub fn selective(folder_ids: Vec<FolderId>, email_ids: Vec<EmailId>) -> Self {
        Self {
            backup_type: Some(BackupType::Selective),
            folder_ids,
            email_ids,
            ..Default::default()
        }
    }

    pub fn encrypted(mut self, password: impl Into<String>) -> Self {
        self.encrypt = true;
        self.password = Some(password.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub strategy: ConflictStrategy,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_id: BackupId,
    pub restored_count: u64,
    pub skipped_count: u64,
    pub conflicts_resolved: u64,
    /// Emails picked by a selective restore.
    pub selected_count: Option<u64>,
}

/// Result of checking an archive without restoring it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupVerification {
    pub backup_id: BackupId,
    pub email_count: u64,
    pub chunk_count: u32,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub folder_id: Option<FolderId>,
    /// CSV columns. Ignored for JSON and EML, which carry whole records.
    pub fields: Vec<String>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub format: ExportFormat,
    pub email_count: u64,
    pub size_bytes: u64,
    /// Download URL. For EML, the index listing every message file.
    pub url: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    #[default]
    Json,
    /// A single RFC-822 message.
    Eml,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportOptions {
    pub format: ImportFormat,
    pub duplicate_handling: ConflictStrategy,
    /// Folder for imported messages. Records keep their own when absent.
    pub folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: u64,
    pub duplicates: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub frequency: BackupFrequency,
    /// `HH:MM` UTC.
    pub time_of_day: String,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleChanges {
    pub frequency: Option<BackupFrequency>,
    pub time_of_day: Option<String>,
    pub retention_days: Option<u32>,
    pub include_deleted: Option<bool>,
    pub compress: Option<bool>,
    pub enabled: Option<bool>,
}

/// Filters for undeleting soft-deleted mail. Unset filters match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryFilter {
    pub deleted_from: Option<DateTime<Utc>>,
    pub deleted_to: Option<DateTime<Utc>>,
    pub sender: Option<String>,
    pub subject_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveredEmails {
    pub recovered: u64,
    pub email_ids: Vec<EmailId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStats {
    pub total_backups: u64,
    pub total_backup_bytes: u64,
    pub encrypted_backups: u64,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub deleted_emails: u64,
    pub active_schedules: u64,
    /// Recovery operations in the last 30 days.
    pub recent_operations: u64,
}

// ============================================================================
// Service
// ============================================================================

/// Backup and recovery operations.
pub struct RecoveryService {
    store: MailStore,
    db: Database,
    objects: Arc<dyn ObjectStore>,
    events: Arc<EventBus>,
    defaults: BackupDefaults,
    timers: TimerRegistry,
}

impl RecoveryService {
    pub fn new(
        store: MailStore,
        objects: Arc<dyn ObjectStore>,
        events: Arc<EventBus>,
        defaults: BackupDefaults,
    ) -> Self {
        Self {
            db: store.db().clone(),
            store,
            objects,
            events,
            defaults,
            timers: TimerRegistry::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------------

    async fn resolve_scope(
        &self,
        user_id: &UserId,
        options: &BackupOptions,
    ) -> Result<BackupScope> {
        Ok(match options.backup_type.unwrap_or(BackupType::Full) {
            BackupType::Full => BackupScope::Full,
            BackupType::Incremental => {
                let since = match options.since {
                    Some(since) => since,
                    None => queries::backups::list(&self.db, user_id)
                        .await?
                        .into_iter()
                        .map(|b| b.created_at)
                        .max()
                        .unwrap_or_default(),
                };
                BackupScope::Incremental { since }
            }
            BackupType::Selective => {
                if options.folder_ids.is_empty() && options.email_ids.is_empty() {
                    return Err(EngineError::InvalidOperation(
                        "Selective backup needs folders or email ids".into(),
                    ));
                }
                BackupScope::Selective {
                    folders: options.folder_ids.clone(),
                    email_ids: options.email_ids.clone(),
                }
            }
        })
    }

    fn selection(scope: &BackupScope, include_deleted: bool) -> Selection {
        let mut selection = Selection {
            deleted: if include_deleted {
                DeletedScope::Include
            } else {
                DeletedScope::Exclude
            },
            ..Default::default()
        };
        match scope {
            BackupScope::Full => {}
            BackupScope::Incremental { since } => selection.updated_since = Some(*since),
            BackupScope::Selective { folders, email_ids } => {
                selection.folder_ids = folders.clone();
                selection.email_ids = email_ids.clone();
            }
        }
        selection
    }

    /// Writes a backup of the emails `options` selects.
    ///
    /// Any failure removes the objects already written, so a failed backup
    /// leaves nothing behind.
    pub async fn create_backup(&self, user_id: &UserId, options: BackupOptions) -> Result<Backup> {
        let password = match (options.encrypt, options.password.as_deref()) {
            (true, Some(p)) if !p.is_empty() => Some(p),
            (true, _) => {
                return Err(EngineError::EncryptionFailed(
                    "a password is required for encrypted backups".into(),
                ))
            }
            (false, _) => None,
        };
        let scope = self.resolve_scope(user_id, &options).await?;
        let batch_size = options.batch_size.unwrap_or(self.defaults.batch_size).max(1);
        let compress = options.compress.unwrap_or(self.defaults.compress);

        let id = BackupId::generate();
        let prefix = format!("backups/{user_id}/{id}");
        let (codec, salt) = ChunkCodec::for_writing(user_id, &id, compress, password)?;

        let mut written = Vec::new();
        let result = self
            .write_backup(
                user_id,
                &id,
                &prefix,
                &scope,
                &options,
                batch_size,
                &codec,
                salt,
                &mut written,
            )
            .await;

        match result {
            Ok(backup) => {
                info!(
                    user_id = %user_id,
                    backup_id = %id,
                    backup_type = backup.backup_type.as_str(),
                    emails = backup.email_count,
                    chunks = backup.chunk_count,
                    encrypted = backup.encrypted,
                    "Backup created"
                );
                self.events.emit(EngineEvent::BackupCreated {
                    user_id: user_id.clone(),
                    backup_id: id.clone(),
                });
                self.track_recovery_operation(
                    user_id,
                    "backup_created",
                    json!({ "backupId": id, "emails": backup.email_count }),
                )
                .await;
                Ok(backup)
            }
            Err(e) => {
                error!(
                    user_id = %user_id,
                    backup_id = %id,
                    error = %e,
                    "Backup failed, removing partial objects"
                );
                for path in &written {
                    if let Err(cleanup) = self.objects.remove(path).await {
                        warn!(
                            path = %path,
                            error = %cleanup,
                            "Failed to remove partial backup object"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_backup(
        &self,
        user_id: &UserId,
        id: &BackupId,
        prefix: &str,
        scope: &BackupScope,
        options: &BackupOptions,
        batch_size: usize,
        codec: &ChunkCodec,
        salt: Option<String>,
        written: &mut Vec<String>,
    ) -> Result<Backup> {
        let selection = Self::selection(scope, options.include_deleted);
        let mut chunks: Vec<ChunkEntry> = Vec::new();
        let mut folders: Vec<FolderId> = Vec::new();
        let mut email_count = 0u64;

        loop {
            let offset = email_count as u32;
            let page = self
                .store
                .select(user_id, &selection, batch_size as u32, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            for email in &page {
                if !folders.contains(&email.folder_id) {
                    folders.push(email.folder_id.clone());
                }
            }

            let index = chunks.len() as u32;
            let stored = codec.encode(index, &page)?;
            let path = chunk_path(prefix, index);
            let entry = ChunkEntry {
                index,
                path: path.clone(),
                checksum: crate::storage::crypto::sha256_hex(&stored),
                email_count: page.len() as u64,
                size_bytes: stored.len() as u64,
            };
            self.objects.put(&path, Bytes::from(stored)).await?;
            written.push(path);
            debug!(backup_id = %id, index, emails = page.len(), "Wrote backup chunk");

            email_count += page.len() as u64;
            chunks.push(entry);
            if page.len() < batch_size {
                break;
            }
        }

        let created_at = Utc::now();
        let metadata = BackupMetadata {
            version: BACKUP_FORMAT_VERSION.to_string(),
            scope: scope.clone(),
            folders,
            batch_size,
            include_deleted: options.include_deleted,
        };
        let manifest = Manifest {
            version: BACKUP_FORMAT_VERSION.to_string(),
            backup_id: id.clone(),
            user_id: user_id.clone(),
            backup_type: scope.backup_type(),
            created_at,
            email_count,
            compressed: options.compress.unwrap_or(self.defaults.compress),
            encrypted: salt.is_some(),
            salt,
            chunks,
            metadata: metadata.clone(),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let path = manifest_path(prefix);
        self.objects.put(&path, Bytes::from(manifest_bytes)).await?;
        written.push(path);

        let backup = Backup {
            id: id.clone(),
            user_id: user_id.clone(),
            backup_type: manifest.backup_type,
            storage_path: prefix.to_string(),
            email_count,
            size_bytes: manifest.size_bytes(),
            encrypted: manifest.encrypted,
            compressed: manifest.compressed,
            chunked: manifest.chunks.len() > 1,
            chunk_count: manifest.chunks.len() as u32,
            metadata,
            created_at,
        };
        queries::backups::insert(&self.db, &backup).await?;
        Ok(backup)
    }

    pub async fn list_backups(&self, user_id: &UserId) -> Result<Vec<Backup>> {
        Ok(queries::backups::list(&self.db, user_id).await?)
    }

    pub async fn get_backup_details(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
    ) -> Result<Backup> {
        queries::backups::get(&self.db, user_id, backup_id)
            .await?
            .ok_or_else(|| EngineError::not_found("backup", backup_id))
    }

    /// Removes every object under the backup's prefix, then its row.
    pub async fn delete_backup(&self, user_id: &UserId, backup_id: &BackupId) -> Result<()> {
        let backup = self.get_backup_details(user_id, backup_id).await?;
        let prefix = format!("{}/", backup.storage_path);
        for path in self.objects.list(&prefix).await? {
            self.objects.remove(&path).await?;
        }
        queries::backups::delete(&self.db, user_id, backup_id).await?;
        info!(user_id = %user_id, backup_id = %backup_id, "Backup deleted");
        self.events.emit(EngineEvent::BackupDeleted {
            user_id: user_id.clone(),
            backup_id: backup_id.clone(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------------

    /// Reads and verifies every chunk. Writes nothing.
    async fn load_archive(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
        password: Option<&str>,
    ) -> Result<(Manifest, Vec<Email>)> {
        let backup = self.get_backup_details(user_id, backup_id).await?;
        let manifest_bytes = self
            .objects
            .get(&manifest_path(&backup.storage_path))
            .await
            .map_err(|e| {
                EngineError::BackupValidationFailed(format!("manifest unavailable: {e}"))
            })?;
        let manifest = parse_manifest(&manifest_bytes)?;
        if manifest.backup_id != backup.id || &manifest.user_id != user_id {
            return Err(EngineError::BackupValidationFailed(
                "manifest belongs to another backup".into(),
            ));
        }

        let codec = ChunkCodec::for_reading(&manifest, password)?;
        let mut emails = Vec::with_capacity(manifest.email_count as usize);
        for entry in &manifest.chunks {
            let stored = self.objects.get(&entry.path).await.map_err(|e| {
                EngineError::BackupValidationFailed(format!(
                    "chunk {} unavailable: {e}",
                    entry.index
                ))
            })?;
            emails.extend(codec.decode(entry, &stored)?);
        }
        if emails.len() as u64 != manifest.email_count {
            return Err(EngineError::BackupValidationFailed(format!(
                "expected {} emails, found {}",
                manifest.email_count,
                emails.len()
            )));
        }
        for email in &mut emails {
            email.user_id = user_id.clone();
        }
        Ok((manifest, emails))
    }

    pub async fn verify_backup(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
        password: Option<&str>,
    ) -> Result<BackupVerification> {
        let (manifest, emails) = self.load_archive(user_id, backup_id, password).await?;
        Ok(BackupVerification {
            backup_id: manifest.backup_id,
            email_count: emails.len() as u64,
            chunk_count: manifest.chunks.len() as u32,
            version: manifest.version,
        })
    }

    /// Restores every email in a backup.
    ///
    /// The archive is fully verified first. A corrupt or incompatible backup
    /// fails before any record is written.
    pub async fn restore_backup(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let (_, emails) = self
            .load_archive(user_id, backup_id, options.password.as_deref())
            .await
            .map_err(|e| {
                warn!(
                    user_id = %user_id,
                    backup_id = %backup_id,
                    error = %e,
                    "Backup failed validation"
                );
                e
            })?;
        let outcome = self.store.apply_records(user_id, emails, options.strategy).await?;
        Ok(self.finish_restore(user_id, backup_id, outcome, None).await)
    }

    /// Restores only `email_ids` out of a backup.
    pub async fn restore_selective_emails(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
        email_ids: &[EmailId],
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let (_, emails) = self
            .load_archive(user_id, backup_id, options.password.as_deref())
            .await?;
        let selected: Vec<Email> = emails
            .into_iter()
            .filter(|e| email_ids.contains(&e.id))
            .collect();
        let selected_count = selected.len() as u64;
        let outcome = self.store.apply_records(user_id, selected, options.strategy).await?;
        Ok(self
            .finish_restore(user_id, backup_id, outcome, Some(selected_count))
            .await)
    }

    async fn finish_restore(
        &self,
        user_id: &UserId,
        backup_id: &BackupId,
        outcome: ApplyOutcome,
        selected_count: Option<u64>,
    ) -> RestoreReport {
        info!(
            user_id = %user_id,
            backup_id = %backup_id,
            restored = outcome.restored,
            skipped = outcome.skipped,
            conflicts = outcome.conflicts_resolved,
            "Backup restored"
        );
        self.events.emit(EngineEvent::BackupRestored {
            user_id: user_id.clone(),
            backup_id: backup_id.clone(),
            restored: outcome.restored,
        });
        self.track_recovery_operation(
            user_id,
            "backup_restored",
            json!({
                "backupId": backup_id,
                "restored": outcome.restored,
                "selected": selected_count,
            }),
        )
        .await;
        RestoreReport {
            backup_id: backup_id.clone(),
            restored_count: outcome.restored,
            skipped_count: outcome.skipped,
            conflicts_resolved: outcome.conflicts_resolved,
            selected_count,
        }
    }

    // ------------------------------------------------------------------------
    // Export and import
    // ------------------------------------------------------------------------

    async fn select_all(&self, user_id: &UserId, selection: &Selection) -> Result<Vec<Email>> {
        let mut all = Vec::new();
        loop {
            let page = self
                .store
                .select(user_id, selection, READ_PAGE, all.len() as u32)
                .await?;
            let done = page.len() < READ_PAGE as usize;
            all.extend(page);
            if done {
                return Ok(all);
            }
        }
    }

    /// Writes an export into the object store and returns where to fetch it.
    pub async fn export_emails(
        &self,
        user_id: &UserId,
        options: ExportOptions,
    ) -> Result<ExportResult> {
        let fields = match options.format {
            ExportFormat::Csv => mail_export::resolve_csv_fields(&options.fields)?,
            _ => Vec::new(),
        };
        let selection = Selection {
            folder_ids: options.folder_id.iter().cloned().collect(),
            date_from: options.date_from,
            date_to: options.date_to,
            deleted: if options.include_deleted {
                DeletedScope::Include
            } else {
                DeletedScope::Exclude
            },
            ..Default::default()
        };
        let emails = self.select_all(user_id, &selection).await?;
        let email_count = emails.len() as u64;
        let export_id = uuid::Uuid::new_v4();
        let base = format!("exports/{user_id}/{export_id}");

        let mut paths = Vec::new();
        let mut size_bytes = 0u64;
        let url = match options.format {
            ExportFormat::Json | ExportFormat::Csv => {
                let data = if options.format == ExportFormat::Json {
                    mail_export::to_json(user_id, emails)?
                } else {
                    mail_export::to_csv(&emails, &fields).into_bytes()
                };
                let path = format!("{base}.{}", options.format.extension());
                size_bytes += data.len() as u64;
                self.objects.put(&path, Bytes::from(data)).await?;
                let url = self.objects.public_url(&path);
                paths.push(path);
                url
            }
            ExportFormat::Eml => {
                for email in &emails {
                    let eml = mail_export::to_eml(email)?;
                    let path = format!("{base}/{}.eml", email.id);
                    size_bytes += eml.len() as u64;
                    self.objects.put(&path, Bytes::from(eml)).await?;
                    paths.push(path);
                }
                let index_path = format!("{base}/index.json");
                let index = serde_json::to_vec(&json!({
                    "userId": user_id,
                    "emailCount": email_count,
                    "files": paths,
                }))?;
                self.objects.put(&index_path, Bytes::from(index)).await?;
                let url = self.objects.public_url(&index_path);
                paths.push(index_path);
                url
            }
        };

        info!(
            user_id = %user_id,
            format = options.format.extension(),
            emails = email_count,
            bytes = size_bytes,
            "Export written"
        );
        self.track_recovery_operation(
            user_id,
            "export",
            json!({ "format": options.format, "emails": email_count }),
        )
        .await;
        Ok(ExportResult {
            format: options.format,
            email_count,
            size_bytes,
            url,
            paths,
        })
    }

    /// Imports a JSON export or one EML message.
    pub async fn import_emails(
        &self,
        user_id: &UserId,
        data: &[u8],
        options: ImportOptions,
    ) -> Result<ImportReport> {
        let mut emails = match options.format {
            ImportFormat::Json => mail_export::parse_json_import(user_id, data)?,
            ImportFormat::Eml => vec![mail_export::parse_eml_import(user_id, data)?],
        };
        if let Some(folder) = &options.folder_id {
            for email in &mut emails {
                email.folder_id = folder.clone();
            }
        }

        let outcome = self
            .store
            .apply_records(user_id, emails, options.duplicate_handling)
            .await?;
        let report = ImportReport {
            imported: outcome.restored.saturating_sub(match options.duplicate_handling {
                ConflictStrategy::Skip => 0,
                _ => outcome.conflicts_resolved,
            }),
            duplicates: outcome.conflicts_resolved,
            skipped: outcome.skipped,
        };
        info!(
            user_id = %user_id,
            imported = report.imported,
            duplicates = report.duplicates,
            "Import finished"
        );
        self.track_recovery_operation(
            user_id,
            "import",
            json!({ "imported": report.imported, "duplicates": report.duplicates }),
        )
        .await;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------------

    fn validate_schedule(time_of_day: &str, retention_days: u32) -> Result<()> {
        let mut errors = Vec::new();
        if parse_time_of_day(time_of_day).is_none() {
            errors.push("Backup time must be in HH:MM format".to_string());
        }
        if retention_days == 0 {
            errors.push("Retention must be at least 1 day".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidSettings(errors))
        }
    }

    fn next_run(
        frequency: BackupFrequency,
        time_of_day: &str,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        parse_time_of_day(time_of_day).map(|t| frequency.next_run_after(after, t))
    }

    /// Creates an enabled schedule and starts its timer.
    pub async fn schedule_auto_backup(
        self: &Arc<Self>,
        user_id: &UserId,
        request: ScheduleRequest,
    ) -> Result<BackupSchedule> {
        let retention_days = request.retention_days.unwrap_or(self.defaults.retention_days);
        Self::validate_schedule(&request.time_of_day, retention_days)?;

        let now = Utc::now();
        let schedule = BackupSchedule {
            id: ScheduleId::generate(),
            user_id: user_id.clone(),
            frequency: request.frequency,
            next_run_at: Self::next_run(request.frequency, &request.time_of_day, now),
            time_of_day: request.time_of_day,
            retention_days,
            include_deleted: request.include_deleted,
            compress: request.compress.unwrap_or(self.defaults.compress),
            enabled: true,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        queries::backups::upsert_schedule(&self.db, &schedule).await?;
        self.start_schedule_timer(&schedule);
        info!(
            user_id = %user_id,
            schedule_id = %schedule.id,
            frequency = schedule.frequency.as_str(),
            time = %schedule.time_of_day,
            "Backup schedule created"
        );
        Ok(schedule)
    }

    pub async fn update_backup_schedule(
        self: &Arc<Self>,
        user_id: &UserId,
        schedule_id: &ScheduleId,
        changes: ScheduleChanges,
    ) -> Result<BackupSchedule> {
        let mut schedule = queries::backups::get_schedule(&self.db, user_id, schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("backup schedule", schedule_id))?;

        if let Some(frequency) = changes.frequency {
            schedule.frequency = frequency;
        }
        if let Some(time) = changes.time_of_day {
            schedule.time_of_day = time;
        }
        if let Some(days) = changes.retention_days {
            schedule.retention_days = days;
        }
        if let Some(include_deleted) = changes.include_deleted {
            schedule.include_deleted = include_deleted;
        }
        if let Some(compress) = changes.compress {
            schedule.compress = compress;
        }
        if let Some(enabled) = changes.enabled {
            schedule.enabled = enabled;
        }
        Self::validate_schedule(&schedule.time_of_day, schedule.retention_days)?;

        let now = Utc::now();
        schedule.updated_at = now;
        schedule.next_run_at = if schedule.enabled {
            Self::next_run(schedule.frequency, &schedule.time_of_day, now)
        } else {
            None
        };
        queries::backups::upsert_schedule(&self.db, &schedule).await?;

        if schedule.enabled {
            self.start_schedule_timer(&schedule);
        } else {
            self.timers.stop(&schedule_key(&schedule.id));
        }
        Ok(schedule)
    }

    /// Disables a schedule and stops its timer. Unknown or already disabled
    /// schedules are not an error.
    pub async fn disable_auto_backup(
        &self,
        user_id: &UserId,
        schedule_id: &ScheduleId,
    ) -> Result<()> {
        let changed = queries::backups::disable_schedule(&self.db, user_id, schedule_id).await?;
        self.timers.stop(&schedule_key(schedule_id));
        debug!(user_id = %user_id, schedule_id = %schedule_id, changed, "Backup schedule disabled");
        Ok(())
    }

    pub async fn list_backup_schedules(&self, user_id: &UserId) -> Result<Vec<BackupSchedule>> {
        Ok(queries::backups::list_schedules(&self.db, user_id).await?)
    }

    /// Runs a schedule's backup now, records the run and applies its retention.
    pub async fn run_scheduled_backup(
        &self,
        user_id: &UserId,
        schedule_id: &ScheduleId,
    ) -> Result<Backup> {
        let schedule = queries::backups::get_schedule(&self.db, user_id, schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("backup schedule", schedule_id))?;

        let backup = self
            .create_backup(
                user_id,
                BackupOptions {
                    include_deleted: schedule.include_deleted,
                    compress: Some(schedule.compress),
                    ..BackupOptions::full()
                },
            )
            .await?;

        let now = Utc::now();
        let next = Self::next_run(schedule.frequency, &schedule.time_of_day, now)
            .unwrap_or(now + chrono::Duration::days(1));
        queries::backups::record_schedule_run(&self.db, schedule_id, now, next).await?;

        let expired = self
            .cleanup_expired_backups(user_id, Some(schedule.retention_days))
            .await?;
        info!(
            user_id = %user_id,
            schedule_id = %schedule_id,
            backup_id = %backup.id,
            expired,
            "Scheduled backup finished"
        );
        Ok(backup)
    }

    /// Starts timers for every enabled schedule.
    pub async fn start_schedules(self: &Arc<Self>) -> Result<usize> {
        let schedules = queries::backups::list_enabled_schedules(&self.db).await?;
        for schedule in &schedules {
            self.start_schedule_timer(schedule);
        }
        Ok(schedules.len())
    }

    pub fn stop_schedules(&self) -> usize {
        self.timers.stop_prefixed("backup:")
    }

    pub fn is_schedule_running(&self, schedule_id: &ScheduleId) -> bool {
        self.timers.is_running(&schedule_key(schedule_id))
    }

    fn start_schedule_timer(self: &Arc<Self>, schedule: &BackupSchedule) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let user_id = schedule.user_id.clone();
        let schedule_id = schedule.id.clone();

        self.timers.start(
            schedule_key(&schedule.id),
            SCHEDULE_POLL,
            SCHEDULE_POLL,
            move |token| {
                let weak = weak.clone();
                let user_id = user_id.clone();
                let schedule_id = schedule_id.clone();
                async move {
                    let Some(service) = weak.upgrade() else {
                        return;
                    };
                    if token.is_cancelled() {
                        return;
                    }
                    if let Err(e) = service.run_if_due(&user_id, &schedule_id, Utc::now()).await {
                        error!(
                            user_id = %user_id,
                            schedule_id = %schedule_id,
                            error = %e,
                            "Scheduled backup failed"
                        );
                    }
                }
            },
        );
    }

    /// Runs the schedule when enabled and its next run is not in the future.
    pub async fn run_if_due(
        &self,
        user_id: &UserId,
        schedule_id: &ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<Option<Backup>> {
        let Some(schedule) =
            queries::backups::get_schedule(&self.db, user_id, schedule_id).await?
        else {
            return Ok(None);
        };
        let due = schedule.enabled && schedule.next_run_at.is_some_and(|at| at <= now);
        if !due {
            return Ok(None);
        }
        self.run_scheduled_backup(user_id, schedule_id).await.map(Some)
    }

    // ------------------------------------------------------------------------
    // Retention and recovery
    // ------------------------------------------------------------------------

    /// Deletes backups older than `retention_days`. Returns how many.
    pub async fn cleanup_expired_backups(
        &self,
        user_id: &UserId,
        retention_days: Option<u32>,
    ) -> Result<usize> {
        let days = retention_days.unwrap_or(self.defaults.retention_days);
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let expired = queries::backups::list_created_before(&self.db, user_id, cutoff).await?;
        let mut deleted = 0;
        for backup in expired {
            self.delete_backup(user_id, &backup.id).await?;
            deleted += 1;
        }
        if deleted > 0 {
            info!(user_id = %user_id, deleted, retention_days = days, "Expired backups removed");
        }
        Ok(deleted)
    }

    /// Purges emails soft-deleted more than `days` ago.
    pub async fn permanently_delete_expired(&self, user_id: &UserId, days: u32) -> Result<usize> {
        let purged = self.store.cleanup_deleted(user_id, days).await?;
        self.track_recovery_operation(user_id, "purge", json!({ "days": days, "purged": purged }))
            .await;
        Ok(purged)
    }

    /// Undeletes soft-deleted emails matching `filter`.
    pub async fn recover_deleted_emails(
        &self,
        user_id: &UserId,
        filter: RecoveryFilter,
    ) -> Result<RecoveredEmails> {
        let selection = Selection {
            deleted: DeletedScope::Only,
            deleted_from: filter.deleted_from,
            deleted_to: filter.deleted_to,
            sender_contains: filter.sender.clone(),
            subject_contains: filter.subject_pattern.clone(),
            ..Default::default()
        };
        let ids: Vec<EmailId> = self
            .select_all(user_id, &selection)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let recovered = queries::emails::set_deleted(&self.db, user_id, &ids, None).await? as u64;

        for id in &ids {
            self.events.emit(EngineEvent::EmailRestored {
                user_id: user_id.clone(),
                email_id: id.clone(),
            });
        }
        self.track_recovery_operation(user_id, "recover_deleted", json!({ "recovered": recovered }))
            .await;
        Ok(RecoveredEmails {
            recovered,
            email_ids: ids,
        })
    }

    pub async fn get_recovery_stats(&self, user_id: &UserId) -> Result<RecoveryStats> {
        let backups = self.list_backups(user_id).await?;
        let schedules = self.list_backup_schedules(user_id).await?;
        let mail = self.store.stats(user_id).await?;
        let recent_operations = queries::activity::count_activity(
            &self.db,
            user_id,
            RECOVERY_ACTION,
            Utc::now() - chrono::Duration::days(30),
        )
        .await?;

        Ok(RecoveryStats {
            total_backups: backups.len() as u64,
            total_backup_bytes: backups.iter().map(|b| b.size_bytes).sum(),
            encrypted_backups: backups.iter().filter(|b| b.encrypted).count() as u64,
            last_backup_at: backups.iter().map(|b| b.created_at).max(),
            deleted_emails: mail.deleted,
            active_schedules: schedules.iter().filter(|s| s.enabled).count() as u64,
            recent_operations,
        })
    }

    /// Appends a recovery operation to the activity log. Failures are logged.
    pub async fn track_recovery_operation(
        &self,
        user_id: &UserId,
        operation: &str,
        details: serde_json::Value,
    ) {
        let activity = EmailActivity {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.clone(),
            email_id: None,
            provider_id: None,
            action: RECOVERY_ACTION.to_string(),
            details: json!({ "operation": operation, "details": details }),
            created_at: Utc::now(),
        };
        if let Err(e) = queries::activity::record_activity(&self.db, &activity).await {
            warn!(user_id = %user_id, operation, error = %e, "Failed to record recovery operation");
        }
    }
}

impl Drop for RecoveryService {
    fn drop(&mut self) {
        self.timers.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, EmailContent, EmailPatch, NewEmail};
    use crate::storage::MemoryObjectStore;
    use pretty_assertions::assert_eq;

    struct Fixture {
        service: Arc<RecoveryService>,
        store: MailStore,
        objects: Arc<MemoryObjectStore>,
        user: UserId,
    }

    async fn fixture() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let store = MailStore::new(db);
        let objects = Arc::new(MemoryObjectStore::new());
        let service = Arc::new(RecoveryService::new(
            store.clone(),
            objects.clone(),
            Arc::new(EventBus::new()),
            BackupDefaults {
                batch_size: 2,
                retention_days: 30,
                compress: true,
            },
        ));
        Fixture {
            service,
            store,
            objects,
            user: UserId::from("user-1"),
        }
    }

    async fn seed(f: &Fixture, subjects: &[&str]) -> Vec<Email> {
        let mut out = Vec::new();
        for subject in subjects {
            let email = f
                .store
                .store_email(
                    &f.user,
                    NewEmail::inbound(Address::new("sender@example.com"), *subject)
                        .content(EmailContent::text("body")),
                )
                .await
                .unwrap();
            out.push(email);
        }
        out
    }

    #[tokio::test]
    async fn full_backup_is_chunked_and_restorable() {
        let f = fixture().await;
        let emails = seed(&f, &["one", "two", "three"]).await;

        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();
        assert_eq!(backup.email_count, 3);
        assert_eq!(backup.chunk_count, 2);
        assert!(backup.chunked);
        assert!(backup.compressed);

        f.store
            .permanently_delete_email(&f.user, &emails[0].id)
            .await
            .unwrap();
        let report = f
            .service
            .restore_backup(&f.user, &backup.id, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.restored_count, 1);
        assert_eq!(report.skipped_count, 2);
        assert_eq!(f.store.stats(&f.user).await.unwrap().total, 3);
    }

    #[tokio::test]
    async fn encrypted_backup_needs_the_password() {
        let f = fixture().await;
        seed(&f, &["secret"]).await;

        assert!(matches!(
            f.service
                .create_backup(
                    &f.user,
                    BackupOptions {
                        encrypt: true,
                        ..BackupOptions::full()
                    }
                )
                .await,
            Err(EngineError::EncryptionFailed(_))
        ));
        assert!(f.objects.is_empty().await);

        let backup = f
            .service
            .create_backup(&f.user, BackupOptions::full().encrypted("correct horse"))
            .await
            .unwrap();
        assert!(backup.encrypted);

        let wrong = f
            .service
            .restore_backup(
                &f.user,
                &backup.id,
                RestoreOptions {
                    password: Some("wrong".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(wrong, Err(EngineError::BackupValidationFailed(_))));

        let verified = f
            .service
            .verify_backup(&f.user, &backup.id, Some("correct horse"))
            .await
            .unwrap();
        assert_eq!(verified.email_count, 1);
    }

    #[tokio::test]
    async fn corrupted_backup_writes_nothing() {
        let f = fixture().await;
        let emails = seed(&f, &["one", "two", "three"]).await;
        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();
        for email in &emails {
            f.store.permanently_delete_email(&f.user, &email.id).await.unwrap();
        }

        let second_chunk = chunk_path(&backup.storage_path, 1);
        f.objects
            .put(&second_chunk, Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let err = f
            .service
            .restore_backup(&f.user, &backup.id, RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackupValidationFailed(_)));
        assert_eq!(f.store.stats(&f.user).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn incompatible_version_is_rejected() {
        let f = fixture().await;
        seed(&f, &["one"]).await;
        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();

        let path = manifest_path(&backup.storage_path);
        let mut manifest: serde_json::Value =
            serde_json::from_slice(&f.objects.get(&path).await.unwrap()).unwrap();
        manifest["version"] = json!("2.0");
        f.objects
            .put(&path, Bytes::from(serde_json::to_vec(&manifest).unwrap()))
            .await
            .unwrap();

        assert!(matches!(
            f.service
                .restore_backup(&f.user, &backup.id, RestoreOptions::default())
                .await,
            Err(EngineError::InvalidBackupFormat(_))
        ));
    }

    #[tokio::test]
    async fn merge_restore_keeps_newer_fields_and_unions_flags() {
        let f = fixture().await;
        let emails = seed(&f, &["original"]).await;
        let id = emails[0].id.clone();
        f.store
            .update_email(&f.user, &id, &EmailPatch::starred(true))
            .await
            .unwrap();
        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        f.store
            .update_email(&f.user, &id, &EmailPatch::read(true))
            .await
            .unwrap();
        f.store
            .update_email(&f.user, &id, &EmailPatch::starred(false))
            .await
            .unwrap();

        let report = f
            .service
            .restore_backup(
                &f.user,
                &backup.id,
                RestoreOptions {
                    strategy: ConflictStrategy::Merge,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.conflicts_resolved, 1);

        let merged = f.store.get_email(&f.user, &id).await.unwrap();
        assert!(merged.is_read);
        assert!(merged.is_starred);
    }

    #[tokio::test]
    async fn selective_restore_reports_selected_count() {
        let f = fixture().await;
        let emails = seed(&f, &["one", "two", "three"]).await;
        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();
        for email in &emails {
            f.store.permanently_delete_email(&f.user, &email.id).await.unwrap();
        }

        let report = f
            .service
            .restore_selective_emails(
                &f.user,
                &backup.id,
                &[emails[1].id.clone(), EmailId::from("not-in-backup")],
                RestoreOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.selected_count, Some(1));
        assert_eq!(report.restored_count, 1);
        assert_eq!(f.store.get_email(&f.user, &emails[1].id).await.unwrap().subject, "two");
    }

    #[tokio::test]
    async fn incremental_backup_defaults_to_last_backup_time() {
        let f = fixture().await;
        seed(&f, &["old"]).await;
        f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        seed(&f, &["new"]).await;

        let backup = f
            .service
            .create_backup(&f.user, BackupOptions::incremental(None))
            .await
            .unwrap();
        assert_eq!(backup.backup_type, BackupType::Incremental);
        assert_eq!(backup.email_count, 1);
    }

    #[tokio::test]
    async fn delete_backup_removes_objects() {
        let f = fixture().await;
        seed(&f, &["one", "two", "three"]).await;
        let backup = f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();
        assert_eq!(f.objects.len().await, 3);

        f.service.delete_backup(&f.user, &backup.id).await.unwrap();
        assert!(f.objects.is_empty().await);
        assert!(matches!(
            f.service.get_backup_details(&f.user, &backup.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    /// Accepts `allowed` writes, then reports the quota as exhausted.
    struct FillingStore {
        inner: MemoryObjectStore,
        allowed: usize,
        puts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ObjectStore for FillingStore {
        async fn put(&self, path: &str, data: Bytes) -> crate::storage::object_store::Result<()> {
            let n = self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.allowed {
                return Err(crate::storage::ObjectStoreError::QuotaExceeded {
                    requested: data.len() as u64,
                    available: 0,
                });
            }
            self.inner.put(path, data).await
        }

        async fn get(&self, path: &str) -> crate::storage::object_store::Result<Bytes> {
            self.inner.get(path).await
        }

        async fn remove(&self, path: &str) -> crate::storage::object_store::Result<()> {
            self.inner.remove(path).await
        }

        async fn exists(&self, path: &str) -> crate::storage::object_store::Result<bool> {
            self.inner.exists(path).await
        }

        async fn list(&self, prefix: &str) -> crate::storage::object_store::Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        fn public_url(&self, path: &str) -> String {
            self.inner.public_url(path)
        }
    }

    #[tokio::test]
    async fn quota_failure_cleans_up_partial_backup() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MailStore::new(db);
        let objects = Arc::new(FillingStore {
            inner: MemoryObjectStore::new(),
            allowed: 1,
            puts: Default::default(),
        });
        let service = RecoveryService::new(
            store.clone(),
            objects.clone(),
            Arc::new(EventBus::new()),
            BackupDefaults {
                batch_size: 1,
                retention_days: 30,
                compress: false,
            },
        );
        let user = UserId::from("user-1");
        for subject in ["a", "b"] {
            store
                .store_email(
                    &user,
                    NewEmail::inbound(Address::new("s@example.com"), subject)
                        .content(EmailContent::text("body")),
                )
                .await
                .unwrap();
        }

        let err = service.create_backup(&user, BackupOptions::full()).await.unwrap_err();
        assert!(matches!(err, EngineError::StorageQuotaExceeded));
        assert!(objects.inner.is_empty().await);
        assert!(service.list_backups(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn csv_export_lands_in_the_object_store() {
        let f = fixture().await;
        seed(&f, &["Invoice, March"]).await;

        let result = f
            .service
            .export_emails(
                &f.user,
                ExportOptions {
                    format: ExportFormat::Csv,
                    fields: vec!["subject".into(), "from".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(result.email_count, 1);
        let csv = f.objects.get(&result.paths[0]).await.unwrap();
        assert_eq!(
            String::from_utf8(csv.to_vec()).unwrap(),
            "subject,from\r\n\"Invoice, March\",sender@example.com\r\n"
        );
    }

    #[tokio::test]
    async fn json_export_reimports_with_duplicate_handling() {
        let f = fixture().await;
        seed(&f, &["one", "two"]).await;
        let export = f
            .service
            .export_emails(&f.user, ExportOptions::default())
            .await
            .unwrap();
        let data = f.objects.get(&export.paths[0]).await.unwrap();

        let report = f
            .service
            .import_emails(&f.user, &data, ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.skipped, 2);

        let other = UserId::from("user-2");
        let report = f
            .service
            .import_emails(&other, &data, ImportOptions::default())
            .await
            .unwrap();
        assert_eq!(report.imported, 2);
    }

    #[tokio::test]
    async fn invalid_import_is_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.service
                .import_emails(&f.user, b"[1, 2, 3]", ImportOptions::default())
                .await,
            Err(EngineError::InvalidImportFormat(_))
        ));
    }

    #[tokio::test]
    async fn recover_deleted_by_subject() {
        let f = fixture().await;
        let emails = seed(&f, &["Invoice 1", "Newsletter"]).await;
        for email in &emails {
            f.store.delete_email(&f.user, &email.id).await.unwrap();
        }

        let recovered = f
            .service
            .recover_deleted_emails(
                &f.user,
                RecoveryFilter {
                    subject_pattern: Some("Invoice".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recovered.recovered, 1);
        assert_eq!(f.store.stats(&f.user).await.unwrap().deleted, 1);
    }

    #[tokio::test]
    async fn schedules_start_stop_and_disable_idempotently() {
        let f = fixture().await;
        let schedule = f
            .service
            .schedule_auto_backup(
                &f.user,
                ScheduleRequest {
                    frequency: BackupFrequency::Daily,
                    time_of_day: "02:00".into(),
                    retention_days: Some(7),
                    include_deleted: false,
                    compress: None,
                },
            )
            .await
            .unwrap();
        assert!(f.service.is_schedule_running(&schedule.id));
        assert!(schedule.next_run_at.is_some());

        f.service.disable_auto_backup(&f.user, &schedule.id).await.unwrap();
        f.service.disable_auto_backup(&f.user, &schedule.id).await.unwrap();
        f.service
            .disable_auto_backup(&f.user, &ScheduleId::from("unknown"))
            .await
            .unwrap();
        assert!(!f.service.is_schedule_running(&schedule.id));

        let bad = f
            .service
            .schedule_auto_backup(
                &f.user,
                ScheduleRequest {
                    frequency: BackupFrequency::Weekly,
                    time_of_day: "25:00".into(),
                    retention_days: None,
                    include_deleted: false,
                    compress: None,
                },
            )
            .await;
        assert!(matches!(bad, Err(EngineError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn due_schedule_runs_and_records_next_run() {
        let f = fixture().await;
        seed(&f, &["one"]).await;
        let schedule = f
            .service
            .schedule_auto_backup(
                &f.user,
                ScheduleRequest {
                    frequency: BackupFrequency::Daily,
                    time_of_day: "02:00".into(),
                    retention_days: Some(7),
                    include_deleted: false,
                    compress: Some(false),
                },
            )
            .await
            .unwrap();

        assert!(f
            .service
            .run_if_due(&f.user, &schedule.id, Utc::now() - chrono::Duration::days(2))
            .await
            .unwrap()
            .is_none());
        let backup = f
            .service
            .run_if_due(&f.user, &schedule.id, Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap()
            .unwrap();
        assert!(!backup.compressed);

        let stored = f.service.list_backup_schedules(&f.user).await.unwrap();
        assert!(stored[0].last_run_at.is_some());
        f.service.stop_schedules();
    }

    #[tokio::test]
    async fn recovery_stats_count_backups_and_operations() {
        let f = fixture().await;
        let empty = f.service.get_recovery_stats(&f.user).await.unwrap();
        assert_eq!(empty.total_backups, 0);
        assert_eq!(empty.last_backup_at, None);

        seed(&f, &["one"]).await;
        f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();

        let stats = f.service.get_recovery_stats(&f.user).await.unwrap();
        assert_eq!(stats.total_backups, 1);
        assert!(stats.recent_operations >= 1);
    }

    #[tokio::test]
    async fn retention_deletes_old_backups() {
        let f = fixture().await;
        seed(&f, &["one"]).await;
        f.service.create_backup(&f.user, BackupOptions::full()).await.unwrap();

        assert_eq!(f.service.cleanup_expired_backups(&f.user, Some(1)).await.unwrap(), 0);
        // A zero-day window expires everything created before now.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.service.cleanup_expired_backups(&f.user, Some(0)).await.unwrap(), 1);
        assert!(f.objects.is_empty().await);
    }
}
