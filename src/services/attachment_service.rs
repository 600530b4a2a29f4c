//! Attachment validation, scanning, storage and retrieval.
//!
//! Blobs live in the object store and metadata rows in the database. The two
//! are written and removed together: an upload whose row insert fails removes
//! the blob it just wrote.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use crate::config::AttachmentLimits;
use crate::domain::{Attachment, AttachmentId, AttachmentStatus, EmailId, UserId};
use crate::error::{EngineError, Result};
use crate::storage::crypto::sha256_hex;
use crate::storage::queries;
use crate::storage::queries::attachments::InsertOutcome;
use crate::storage::{Database, ObjectStore};

const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "text/plain",
    "text/csv",
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

const BLOCKED_EXTENSIONS: &[&str] = &["exe", "bat", "cmd", "com", "pif", "scr", "vbs", "js"];

const PREVIEWABLE_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

const MAX_FILENAME_LEN: usize = 255;

const QUARANTINE_PREFIX: &str = "quarantine";
const ATTACHMENT_PREFIX: &str = "attachments";

fn filename_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9\s.\-_()]+$").ok())
        .as_ref()
}

fn script_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<script\b|javascript:|\bon(load|error|click)\s*=").ok())
        .as_ref()
}

/// Lowercased extension after the last dot.
fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Extensions a MIME type may legitimately carry.
fn extensions_for(mime_type: &str) -> &'static [&'static str] {
    match mime_type {
        "application/pdf" => &["pdf"],
        "application/msword" => &["doc"],
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => &["docx"],
        "application/vnd.ms-excel" => &["xls"],
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => &["xlsx"],
        "application/vnd.ms-powerpoint" => &["ppt"],
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => &["pptx"],
        "text/plain" => &["txt", "text", "log"],
        "text/csv" => &["csv"],
        "image/jpeg" => &["jpg", "jpeg"],
        "image/png" => &["png"],
        "image/gif" => &["gif"],
        "image/webp" => &["webp"],
        "image/svg+xml" => &["svg"],
        _ => &[],
    }
}

fn format_limit(bytes: u64) -> String {
    format!("{}MB", bytes / (1024 * 1024))
}

/// A file handed in for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub filename: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileUpload {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Files that passed validation and every problem found with the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileValidation {
    pub valid_files: Vec<FileUpload>,
    pub errors: Vec<String>,
}

impl FileValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub safe: bool,
    pub threats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    /// `data:` URL of the image.
    pub preview_url: String,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub available_bytes: u64,
    pub file_count: u64,
    pub quarantined: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatch {
    pub uploaded: Vec<Attachment>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub filename: String,
    pub extension: Option<String>,
    pub mime_type: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub is_image: bool,
    pub is_previewable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDownload {
    pub attachment: Attachment,
    pub data: Bytes,
}

/// Attachment operations over a database and an object store.
pub struct AttachmentService {
    db: Database,
    objects: Arc<dyn ObjectStore>,
    events: Arc<EventBus>,
    limits: AttachmentLimits,
}

impl AttachmentService {
    pub fn new(
        db: Database,
        objects: Arc<dyn ObjectStore>,
        events: Arc<EventBus>,
        limits: AttachmentLimits,
    ) -> Self {
        Self {
            db,
            objects,
            events,
            limits,
        }
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }

    /// Checks count first, then each file.
    ///
    /// A count violation fails the whole set without per-file checks.
    pub fn validate_files(&self, files: Vec<FileUpload>) -> FileValidation {
        if files.len() > self.limits.max_files_per_email {
            return FileValidation {
                valid_files: Vec::new(),
                errors: vec![format!(
                    "Maximum {} attachments allowed per email",
                    self.limits.max_files_per_email
                )],
            };
        }

        let mut validation = FileValidation::default();
        for file in files {
            let errors = self.file_errors(&file);
            if errors.is_empty() {
                validation.valid_files.push(file);
            } else {
                validation.errors.extend(errors);
            }
        }
        validation
    }

    fn file_errors(&self, file: &FileUpload) -> Vec<String> {
        let mut errors = Vec::new();
        let name = &file.filename;

        if file.size() > self.limits.max_file_bytes {
            errors.push(format!(
                "File \"{}\" exceeds maximum size limit of {}",
                name,
                format_limit(self.limits.max_file_bytes)
            ));
        }
        if file.size() == 0 {
            errors.push(format!("File \"{name}\" is empty"));
        }
        if !ALLOWED_MIME_TYPES.contains(&file.mime_type.as_str()) {
            errors.push(format!(
                "File type \"{}\" is not allowed for \"{}\"",
                file.mime_type, name
            ));
        }
        if extension(name).is_some_and(|ext| BLOCKED_EXTENSIONS.contains(&ext.as_str())) {
            errors.push(format!("File \"{name}\" has a blocked extension"));
        }
        let name_ok = name.len() <= MAX_FILENAME_LEN
            && filename_pattern().is_some_and(|re| re.is_match(name));
        if !name_ok {
            errors.push(format!("File \"{name}\" has an invalid filename"));
        }
        errors
    }

    /// Content and name heuristics. Never touches storage.
    pub fn scan_file(&self, file: &FileUpload) -> ScanResult {
        let mut threats = Vec::new();
        let lower = file.filename.to_ascii_lowercase();
        let parts: Vec<&str> = lower.split('.').collect();

        if let Some(ext) = parts.last().filter(|_| parts.len() > 1) {
            if BLOCKED_EXTENSIONS.contains(ext) {
                threats.push(format!("blocked extension .{ext}"));
            }
        }
        if parts.len() > 2 {
            let inner = &parts[1..parts.len() - 1];
            if let Some(hidden) = inner.iter().find(|p| BLOCKED_EXTENSIONS.contains(p)) {
                threats.push(format!("double extension hiding .{hidden}"));
            }
        }

        let data = file.data.as_ref();
        if data.starts_with(b"MZ") {
            threats.push("Windows executable content".to_string());
        } else if data.starts_with(b"\x7fELF") {
            threats.push("ELF executable content".to_string());
        } else if data.starts_with(b"#!") {
            threats.push("script interpreter line".to_string());
        }

        if file.mime_type == "image/svg+xml" || file.mime_type.starts_with("text/") {
            let text = String::from_utf8_lossy(data);
            if script_pattern().is_some_and(|re| re.is_match(&text)) {
                threats.push("embedded script".to_string());
            }
        }

        let expected = extensions_for(&file.mime_type);
        if let Some(ext) = extension(&file.filename) {
            if !expected.is_empty() && !expected.contains(&ext.as_str()) {
                threats.push(format!("extension .{} does not match {}", ext, file.mime_type));
            }
        }

        ScanResult {
            safe: threats.is_empty(),
            threats,
        }
    }

    pub async fn get_storage_usage(&self, user_id: &UserId) -> Result<StorageUsage> {
        let usage = queries::attachments::usage(&self.db, user_id).await?;
        let quota = self.limits.user_quota_bytes;
        let percent_used = if quota == 0 {
            100.0
        } else {
            usage.total_bytes as f64 / quota as f64 * 100.0
        };
        Ok(StorageUsage {
            used_bytes: usage.total_bytes,
            quota_bytes: quota,
            available_bytes: quota.saturating_sub(usage.total_bytes),
            file_count: usage.count,
            quarantined: usage.quarantined,
            percent_used,
        })
    }

    fn too_many_files(&self) -> EngineError {
        EngineError::InvalidAttachment(vec![format!(
            "Maximum {} attachments allowed per email",
            self.limits.max_files_per_email
        )])
    }

    /// The email must be the user's, with room for `incoming` more files.
    async fn check_target(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        incoming: usize,
    ) -> Result<()> {
        if queries::emails::get(&self.db, user_id, email_id).await?.is_none() {
            return Err(EngineError::not_found("email", email_id));
        }
        let existing = queries::attachments::count_for_email(&self.db, user_id, email_id).await?;
        if existing as usize + incoming > self.limits.max_files_per_email {
            return Err(self.too_many_files());
        }
        Ok(())
    }

    /// Validates, scans and stores one file for `email_id`.
    ///
    /// The email must belong to `user_id` and stay within the per-email
    /// limit counting attachments it already has. A file that fails the scan
    /// is still stored, under the quarantine prefix, and the call returns
    /// [`EngineError::AttachmentQuarantined`].
    pub async fn upload_attachment(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        file: FileUpload,
    ) -> Result<Attachment> {
        let errors = self.file_errors(&file);
        if !errors.is_empty() {
            return Err(EngineError::InvalidAttachment(errors));
        }
        self.check_target(user_id, email_id, 1).await?;

        let usage = self.get_storage_usage(user_id).await?;
        if file.size() > usage.available_bytes {
            warn!(
                user_id = %user_id,
                requested = file.size(),
                available = usage.available_bytes,
                "Attachment quota exceeded"
            );
            return Err(EngineError::StorageQuotaExceeded);
        }

        let scan = self.scan_file(&file);
        let id = AttachmentId::generate();
        let (status, path) = if scan.safe {
            (
                AttachmentStatus::Active,
                format!("{ATTACHMENT_PREFIX}/{user_id}/{email_id}/{id}-{}", file.filename),
            )
        } else {
            (
                AttachmentStatus::Quarantined,
                format!("{QUARANTINE_PREFIX}/{user_id}/{id}-{}", file.filename),
            )
        };

        let attachment = Attachment {
            id: id.clone(),
            user_id: user_id.clone(),
            email_id: email_id.clone(),
            filename: file.filename.clone(),
            storage_path: path.clone(),
            size_bytes: file.size(),
            mime_type: file.mime_type.clone(),
            checksum: sha256_hex(&file.data),
            status,
            threats: scan.threats.clone(),
            created_at: Utc::now(),
        };

        self.objects.put(&path, file.data).await?;
        let refused = match queries::attachments::insert_within_limit(
            &self.db,
            &attachment,
            self.limits.max_files_per_email,
        )
        .await
        {
            Ok(InsertOutcome::Inserted) => None,
            Ok(InsertOutcome::EmailNotFound) => Some(EngineError::not_found("email", email_id)),
            Ok(InsertOutcome::LimitReached) => Some(self.too_many_files()),
            Err(e) => Some(e.into()),
        };
        if let Some(err) = refused {
            warn!(
                user_id = %user_id,
                path = %path,
                error = %err,
                "Metadata insert refused, removing object"
            );
            if let Err(cleanup) = self.objects.remove(&path).await {
                warn!(path = %path, error = %cleanup, "Compensating delete failed");
            }
            return Err(err);
        }

        if !scan.safe {
            warn!(
                user_id = %user_id,
                attachment_id = %id,
                threats = ?scan.threats,
                "Attachment quarantined"
            );
            self.events.emit(EngineEvent::AttachmentQuarantined {
                user_id: user_id.clone(),
                attachment_id: id.clone(),
                threats: scan.threats.clone(),
            });
            return Err(EngineError::AttachmentQuarantined {
                attachment_id: id.to_string(),
                threats: scan.threats,
            });
        }

        info!(
            user_id = %user_id,
            email_id = %email_id,
            attachment_id = %id,
            bytes = attachment.size_bytes,
            "Attachment uploaded"
        );
        self.events.emit(EngineEvent::AttachmentUploaded {
            user_id: user_id.clone(),
            attachment_id: id,
        });
        Ok(attachment)
    }

    /// Uploads each file independently once the set, together with what the
    /// email already carries, passes the count limit.
    pub async fn upload_multiple_attachments(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        files: Vec<FileUpload>,
    ) -> Result<UploadBatch> {
        if files.len() > self.limits.max_files_per_email {
            return Err(self.too_many_files());
        }
        self.check_target(user_id, email_id, files.len()).await?;

        let mut batch = UploadBatch::default();
        for file in files {
            let filename = file.filename.clone();
            match self.upload_attachment(user_id, email_id, file).await {
                Ok(attachment) => batch.uploaded.push(attachment),
                Err(e) => batch.failed.push(UploadFailure {
                    filename,
                    error: e.to_string(),
                }),
            }
        }
        Ok(batch)
    }

    pub async fn get_attachment(&self, user_id: &UserId, id: &AttachmentId) -> Result<Attachment> {
        queries::attachments::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| EngineError::not_found("attachment", id))
    }

    /// Refuses quarantined attachments.
    pub async fn download_attachment(
        &self,
        user_id: &UserId,
        id: &AttachmentId,
    ) -> Result<AttachmentDownload> {
        let attachment = self.get_attachment(user_id, id).await?;
        if attachment.is_quarantined() {
            return Err(EngineError::AttachmentQuarantined {
                attachment_id: attachment.id.to_string(),
                threats: attachment.threats,
            });
        }
        let data = self.objects.get(&attachment.storage_path).await?;
        Ok(AttachmentDownload { attachment, data })
    }

    pub async fn get_attachment_url(&self, user_id: &UserId, id: &AttachmentId) -> Result<String> {
        let attachment = self.get_attachment(user_id, id).await?;
        if attachment.is_quarantined() {
            return Err(EngineError::AttachmentQuarantined {
                attachment_id: attachment.id.to_string(),
                threats: attachment.threats,
            });
        }
        Ok(self.objects.public_url(&attachment.storage_path))
    }

    pub async fn get_email_attachments(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
    ) -> Result<Vec<Attachment>> {
        Ok(queries::attachments::list_for_email(&self.db, user_id, email_id).await?)
    }

    /// Image previews only.
    pub async fn generate_preview(&self, user_id: &UserId, id: &AttachmentId) -> Result<Preview> {
        let attachment = self.get_attachment(user_id, id).await?;
        if !PREVIEWABLE_MIME_TYPES.contains(&attachment.mime_type.as_str())
            || attachment.is_quarantined()
        {
            return Err(EngineError::PreviewNotSupported);
        }
        let data = self.objects.get(&attachment.storage_path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        Ok(Preview {
            preview_url: format!("data:{};base64,{}", attachment.mime_type, encoded),
            thumbnail_url: self.objects.public_url(&attachment.storage_path),
        })
    }

    /// Removes the object and the row.
    pub async fn delete_attachment(&self, user_id: &UserId, id: &AttachmentId) -> Result<()> {
        let attachment = self.get_attachment(user_id, id).await?;
        self.objects.remove(&attachment.storage_path).await?;
        queries::attachments::delete(&self.db, user_id, id).await?;
        debug!(user_id = %user_id, attachment_id = %id, "Attachment deleted");
        self.events.emit(EngineEvent::AttachmentDeleted {
            user_id: user_id.clone(),
            attachment_id: id.clone(),
        });
        Ok(())
    }

    /// Returns the ids actually deleted. Missing ids are skipped.
    pub async fn delete_multiple_attachments(
        &self,
        user_id: &UserId,
        ids: &[AttachmentId],
    ) -> Result<Vec<AttachmentId>> {
        let mut deleted = Vec::with_capacity(ids.len());
        for id in ids {
            match self.delete_attachment(user_id, id).await {
                Ok(()) => deleted.push(id.clone()),
                Err(EngineError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    pub fn extract_file_metadata(&self, file: &FileUpload) -> FileMetadata {
        FileMetadata {
            filename: file.filename.clone(),
            extension: extension(&file.filename),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size(),
            checksum: sha256_hex(&file.data),
            is_image: file.mime_type.starts_with("image/"),
            is_previewable: PREVIEWABLE_MIME_TYPES.contains(&file.mime_type.as_str()),
        }
    }

    /// Deletes stored objects of `user_id` that no metadata row references.
    pub async fn cleanup_orphaned_attachments(&self, user_id: &UserId) -> Result<usize> {
        let referenced: HashSet<String> = queries::attachments::storage_paths(&self.db, user_id)
            .await?
            .into_iter()
            .collect();

        let mut removed = 0;
        for prefix in [ATTACHMENT_PREFIX, QUARANTINE_PREFIX] {
            let objects = self.objects.list(&format!("{prefix}/{user_id}/")).await?;
            for path in objects.into_iter().filter(|p| !referenced.contains(p)) {
                self.objects.remove(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(user_id = %user_id, removed, "Removed orphaned attachment objects");
        }
        Ok(removed)
    }
}
