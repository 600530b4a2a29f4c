//! The storage contract over a user's mailbox.
//!
//! [`MailStore`] layers validation, folder provisioning and label resolution
//! on top of the query modules. Every method takes the owning user id and
//! never touches another user's rows.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::database::Database;
use super::queries::emails::{self, EmailQuery, EmailStats, SearchFilters, Selection};
use super::queries::folders::{self, FolderStats};
use super::queries::labels;
use crate::domain::{
    system_folders, Direction, Email, EmailId, EmailPatch, Folder, FolderId, FolderUpdate, Label,
    LabelId, NewEmail, NewFolder, ProviderId, UserId, DEFAULT_LABEL_COLOR,
};
use crate::error::{EngineError, Result};

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPage {
    pub emails: Vec<Email>,
    pub total: u64,
    pub has_more: bool,
}

/// How a restored or imported record that collides with an existing one is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the existing record.
    #[default]
    Skip,
    /// Replace the existing record.
    Overwrite,
    /// Combine both records, see [`merge_records`].
    Merge,
}

/// Counts from applying a batch of records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// New rows plus rows overwritten or merged.
    pub restored: u64,
    /// Colliding records kept as they were.
    pub skipped: u64,
    /// Collisions handled by the strategy, whatever it was.
    pub conflicts_resolved: u64,
}

/// Combines an existing record with an incoming copy of the same email.
///
/// Scalar fields come from the record with the newer `updated_at`, ties going
/// to the existing record. Labels are unioned and flags are OR'd. A record
/// that is live in the store stays live.
pub fn merge_records(existing: &Email, incoming: &Email) -> Email {
    let (winner, other) = if incoming.updated_at > existing.updated_at {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    let mut merged = winner.clone();
    merged.id = existing.id.clone();
    merged.user_id = existing.user_id.clone();

    let mut labels = winner.labels.clone();
    for label in &other.labels {
        if !labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            labels.push(label.clone());
        }
    }
    labels.sort();
    merged.labels = labels;

    merged.is_read = existing.is_read || incoming.is_read;
    merged.is_starred = existing.is_starred || incoming.is_starred;
    merged.is_important = existing.is_important || incoming.is_important;

    if existing.deleted_at.is_none() {
        merged.deleted_at = None;
    }
    merged.created_at = existing.created_at.min(incoming.created_at);
    merged.updated_at = existing.updated_at.max(incoming.updated_at);
    merged
}

fn default_folder(direction: Direction) -> FolderId {
    match direction {
        Direction::Inbound => system_folders::inbox(),
        Direction::Outbound => system_folders::sent(),
    }
}

/// Mailbox storage for all users.
#[derive(Debug, Clone)]
pub struct MailStore {
    db: Database,
}

impl MailStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Emails
    // ========================================================================

    /// Lists one page of live emails.
    pub async fn fetch_emails(&self, user_id: &UserId, query: &EmailQuery) -> Result<EmailPage> {
        let (emails, total) = emails::list(&self.db, user_id, query).await?;
        let has_more = total > query.offset as u64 + query.limit as u64;
        Ok(EmailPage {
            emails,
            total,
            has_more,
        })
    }

    /// Retrieves an email, soft-deleted or not.
    pub async fn get_email(&self, user_id: &UserId, email_id: &EmailId) -> Result<Email> {
        emails::get(&self.db, user_id, email_id)
            .await?
            .ok_or_else(|| EngineError::not_found("email", email_id))
    }

    /// Validates and stores a new email with its labels.
    pub async fn store_email(&self, user_id: &UserId, new: NewEmail) -> Result<Email> {
        let errors = new.validation_errors();
        if !errors.is_empty() {
            return Err(EngineError::InvalidEmailData(errors));
        }

        let now = Utc::now();
        let folder_id = new
            .folder_id
            .clone()
            .unwrap_or_else(|| default_folder(new.direction));
        let timestamp = new.timestamp.unwrap_or(now);
        let email = Email {
            id: new.id.clone().unwrap_or_else(EmailId::generate),
            user_id: user_id.clone(),
            provider_id: new.provider_id,
            provider_message_id: new.provider_message_id,
            thread_id: new.thread_id,
            subject: new.subject.trim().to_string(),
            sender: new.sender,
            recipients: new.recipients,
            content: new.content,
            attachments: new.attachments,
            labels: Vec::new(),
            folder_id,
            is_read: new.is_read,
            is_starred: new.is_starred,
            is_important: new.is_important,
            direction: new.direction,
            received_at: (new.direction == Direction::Inbound).then_some(timestamp),
            sent_at: (new.direction == Direction::Outbound).then_some(timestamp),
            client_id: new.client_id,
            related_documents: new.related_documents,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let label_names = new.labels;

        let user = user_id.clone();
        let folder = email.folder_id.clone();
        let stored = self
            .db
            .transaction(move |tx| {
                folders::ensure_system_in(tx, &user)?;
                if !folders::exists_in(tx, &user, &email.folder_id)? {
                    return Ok(None);
                }
                emails::insert_in(tx, &email)?;
                labels::set_labels_in(tx, &user, &email.id, &label_names)?;
                Ok(emails::get_in(tx, &user, &email.id)?)
            })
            .await?;

        let stored = stored.ok_or_else(|| EngineError::not_found("folder", &folder))?;
        debug!(
            user_id = %user_id,
            email_id = %stored.id,
            folder = %stored.folder_id,
            "Stored email"
        );
        Ok(stored)
    }

    /// Applies a partial update and returns the updated email.
    pub async fn update_email(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        patch: &EmailPatch,
    ) -> Result<Email> {
        if let Some(folder) = &patch.folder_id {
            self.require_folder(user_id, folder).await?;
        }
        let changed =
            emails::apply_patch(&self.db, user_id, std::slice::from_ref(email_id), patch).await?;
        if changed == 0 && !patch.is_empty() {
            return Err(EngineError::not_found("email", email_id));
        }
        self.get_email(user_id, email_id).await
    }

    /// Substring search over live emails.
    pub async fn search_emails(
        &self,
        user_id: &UserId,
        text: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<Email>> {
        Ok(emails::search(&self.db, user_id, text, filters).await?)
    }

    /// Soft-deletes an email.
    pub async fn delete_email(&self, user_id: &UserId, email_id: &EmailId) -> Result<()> {
        let deleted_at = Some(Utc::now());
        let changed =
            emails::set_deleted(&self.db, user_id, std::slice::from_ref(email_id), deleted_at)
                .await?;
        if changed == 0 {
            // Already deleted is fine; missing is not.
            self.get_email(user_id, email_id).await?;
        }
        Ok(())
    }

    /// Removes an email row for good.
    pub async fn permanently_delete_email(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
    ) -> Result<()> {
        let removed =
            emails::delete_permanently(&self.db, user_id, std::slice::from_ref(email_id)).await?;
        if removed == 0 {
            return Err(EngineError::not_found("email", email_id));
        }
        Ok(())
    }

    /// Clears the soft-delete marker.
    pub async fn restore_email(&self, user_id: &UserId, email_id: &EmailId) -> Result<Email> {
        emails::set_deleted(&self.db, user_id, std::slice::from_ref(email_id), None).await?;
        self.get_email(user_id, email_id).await
    }

    pub async fn move_to_folder(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        folder_id: &FolderId,
    ) -> Result<Email> {
        self.update_email(user_id, email_id, &EmailPatch::move_to(folder_id.clone()))
            .await
    }

    pub async fn batch_update(
        &self,
        user_id: &UserId,
        ids: &[EmailId],
        patch: &EmailPatch,
    ) -> Result<usize> {
        if let Some(folder) = &patch.folder_id {
            self.require_folder(user_id, folder).await?;
        }
        Ok(emails::apply_patch(&self.db, user_id, ids, patch).await?)
    }

    /// Soft-deletes live emails among `ids`.
    pub async fn batch_delete(&self, user_id: &UserId, ids: &[EmailId]) -> Result<usize> {
        Ok(emails::set_deleted(&self.db, user_id, ids, Some(Utc::now())).await?)
    }

    pub async fn batch_move(
        &self,
        user_id: &UserId,
        ids: &[EmailId],
        folder_id: &FolderId,
    ) -> Result<usize> {
        self.batch_update(user_id, ids, &EmailPatch::move_to(folder_id.clone()))
            .await
    }

    pub async fn stats(&self, user_id: &UserId) -> Result<EmailStats> {
        Ok(emails::stats(&self.db, user_id).await?)
    }

    /// Permanently removes emails soft-deleted more than `days` ago.
    pub async fn cleanup_deleted(&self, user_id: &UserId, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let purged = emails::purge_deleted_before(&self.db, user_id, cutoff).await?;
        info!(user_id = %user_id, days, purged, "Purged deleted emails");
        Ok(purged)
    }

    pub async fn find_by_provider_message(
        &self,
        user_id: &UserId,
        provider_id: &ProviderId,
        provider_message_id: &str,
    ) -> Result<Option<EmailId>> {
        let user = user_id.clone();
        let provider = provider_id.clone();
        let message_id = provider_message_id.to_string();
        Ok(self
            .db
            .with_conn(move |conn| {
                Ok(emails::find_by_provider_message_in(
                    conn,
                    &user,
                    Some(&provider),
                    &message_id,
                )?)
            })
            .await?)
    }

    pub async fn select(
        &self,
        user_id: &UserId,
        selection: &Selection,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Email>> {
        Ok(emails::select(&self.db, user_id, selection, limit, offset).await?)
    }

    pub async fn count_selection(&self, user_id: &UserId, selection: &Selection) -> Result<u64> {
        Ok(emails::count_selection(&self.db, user_id, selection).await?)
    }

    /// Writes a batch of complete records in one transaction.
    ///
    /// A record collides with an existing one when it has the same id, or
    /// the same provider message id. Records whose folder no longer exists
    /// land in the default folder for their direction. Records whose id is
    /// owned by another user get a fresh id.
    pub async fn apply_records(
        &self,
        user_id: &UserId,
        records: Vec<Email>,
        strategy: ConflictStrategy,
    ) -> Result<ApplyOutcome> {
        let user = user_id.clone();

        let outcome = self
            .db
            .transaction(move |tx| {
                folders::ensure_system_in(tx, &user)?;
                let mut outcome = ApplyOutcome::default();

                for mut record in records {
                    record.user_id = user.clone();
                    if !folders::exists_in(tx, &user, &record.folder_id)? {
                        record.folder_id = default_folder(record.direction);
                    }

                    let mut existing = emails::get_in(tx, &user, &record.id)?;
                    if existing.is_none() {
                        if let Some(message_id) = record.provider_message_id.clone() {
                            if let Some(id) = emails::find_by_provider_message_in(
                                tx,
                                &user,
                                record.provider_id.as_ref(),
                                &message_id,
                            )? {
                                existing = emails::get_in(tx, &user, &id)?;
                            }
                        }
                    }

                    match existing {
                        None => {
                            if emails::id_taken_in(tx, &record.id)? {
                                record.id = EmailId::generate();
                            }
                            emails::insert_in(tx, &record)?;
                            labels::set_labels_in(tx, &user, &record.id, &record.labels)?;
                            outcome.restored += 1;
                        }
                        Some(current) => {
                            outcome.conflicts_resolved += 1;
                            let target = match strategy {
                                ConflictStrategy::Skip => {
                                    outcome.skipped += 1;
                                    continue;
                                }
                                ConflictStrategy::Overwrite => {
                                    record.id = current.id.clone();
                                    record
                                }
                                ConflictStrategy::Merge => merge_records(&current, &record),
                            };
                            emails::replace_in(tx, &target)?;
                            labels::set_labels_in(tx, &user, &target.id, &target.labels)?;
                            outcome.restored += 1;
                        }
                    }
                }
                Ok(outcome)
            })
            .await?;

        info!(
            user_id = %user_id,
            restored = outcome.restored,
            skipped = outcome.skipped,
            conflicts = outcome.conflicts_resolved,
            "Applied email records"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Folders
    // ========================================================================

    /// Lists folders, provisioning the system folders on first use.
    pub async fn list_folders(&self, user_id: &UserId) -> Result<Vec<Folder>> {
        folders::ensure_system(&self.db, user_id).await?;
        Ok(folders::list(&self.db, user_id).await?)
    }

    pub async fn get_folder(&self, user_id: &UserId, folder_id: &FolderId) -> Result<Folder> {
        folders::ensure_system(&self.db, user_id).await?;
        folders::get(&self.db, user_id, folder_id)
            .await?
            .ok_or_else(|| EngineError::not_found("folder", folder_id))
    }

    pub async fn create_folder(&self, user_id: &UserId, new: NewFolder) -> Result<Folder> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidOperation("Folder name is required".into()));
        }
        if let Some(parent) = &new.parent_id {
            self.require_folder(user_id, parent).await?;
        }

        let now = Utc::now();
        let folder = Folder {
            id: FolderId::generate(),
            user_id: user_id.clone(),
            name: name.to_string(),
            icon: new.icon,
            color: new.color,
            parent_id: new.parent_id,
            is_system: false,
            total_count: 0,
            unread_count: 0,
            created_at: now,
            updated_at: now,
        };
        folders::insert(&self.db, &folder).await?;
        info!(user_id = %user_id, folder_id = %folder.id, "Created folder");
        Ok(folder)
    }

    pub async fn update_folder(
        &self,
        user_id: &UserId,
        folder_id: &FolderId,
        update: &FolderUpdate,
    ) -> Result<Folder> {
        let folder = self.get_folder(user_id, folder_id).await?;
        if folder.is_system {
            return Err(EngineError::InvalidOperation(
                "System folders cannot be modified".into(),
            ));
        }
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(EngineError::InvalidOperation("Folder name is required".into()));
        }
        folders::update(&self.db, user_id, folder_id, update).await?;
        self.get_folder(user_id, folder_id).await
    }

    /// Deletes a custom folder, moving its emails to the inbox.
    ///
    /// Returns the number of emails moved.
    pub async fn delete_folder(&self, user_id: &UserId, folder_id: &FolderId) -> Result<usize> {
        let folder = self.get_folder(user_id, folder_id).await?;
        if folder.is_system {
            return Err(EngineError::InvalidOperation(
                "System folders cannot be deleted".into(),
            ));
        }
        let moved =
            folders::delete_moving_emails(&self.db, user_id, folder_id, &system_folders::inbox())
                .await?;
        info!(user_id = %user_id, folder_id = %folder_id, moved, "Deleted folder");
        Ok(moved)
    }

    pub async fn folder_stats(
        &self,
        user_id: &UserId,
        folder_id: &FolderId,
    ) -> Result<FolderStats> {
        self.require_folder(user_id, folder_id).await?;
        Ok(folders::stats(&self.db, user_id, folder_id).await?)
    }

    async fn require_folder(&self, user_id: &UserId, folder_id: &FolderId) -> Result<()> {
        self.get_folder(user_id, folder_id).await.map(|_| ())
    }

    // ========================================================================
    // Labels
    // ========================================================================

    pub async fn list_labels(&self, user_id: &UserId) -> Result<Vec<Label>> {
        Ok(labels::list(&self.db, user_id).await?)
    }

    /// Finds a label by id or, failing that, by name.
    pub async fn find_label(&self, user_id: &UserId, id_or_name: &str) -> Result<Option<Label>> {
        Ok(labels::find(&self.db, user_id, id_or_name).await?)
    }

    pub async fn create_label(
        &self,
        user_id: &UserId,
        name: &str,
        color: Option<&str>,
    ) -> Result<Label> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidOperation("Label name is required".into()));
        }
        if labels::find(&self.db, user_id, name).await?.is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "Label already exists: {name}"
            )));
        }
        let label = Label {
            id: LabelId::generate(),
            user_id: user_id.clone(),
            name: name.to_string(),
            color: color.unwrap_or(DEFAULT_LABEL_COLOR).to_string(),
            created_at: Utc::now(),
        };
        labels::insert(&self.db, &label).await?;
        Ok(label)
    }

    /// Returns the label with this id or name, creating it by name if absent.
    pub async fn resolve_or_create_label(
        &self,
        user_id: &UserId,
        id_or_name: &str,
    ) -> Result<Label> {
        if let Some(label) = self.find_label(user_id, id_or_name).await? {
            return Ok(label);
        }
        let created = self.create_label(user_id, id_or_name, None).await?;
        info!(user_id = %user_id, label = %created.name, "Created label on first use");
        Ok(created)
    }

    pub async fn update_label(
        &self,
        user_id: &UserId,
        label_id: &LabelId,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<Label> {
        if labels::update(&self.db, user_id, label_id, name, color).await? == 0 {
            return Err(EngineError::not_found("label", label_id));
        }
        self.find_label(user_id, label_id.as_str())
            .await?
            .ok_or_else(|| EngineError::not_found("label", label_id))
    }

    pub async fn delete_label(&self, user_id: &UserId, label_id: &LabelId) -> Result<()> {
        if labels::delete(&self.db, user_id, label_id).await? == 0 {
            return Err(EngineError::not_found("label", label_id));
        }
        Ok(())
    }

    /// Links a label. Returns false if it was already applied.
    pub async fn attach_label(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        label_id: &LabelId,
    ) -> Result<bool> {
        self.get_email(user_id, email_id).await?;
        Ok(labels::attach(&self.db, user_id, email_id, label_id).await?)
    }

    /// Unlinks a label. Returns false if it was not applied.
    pub async fn detach_label(
        &self,
        user_id: &UserId,
        email_id: &EmailId,
        label_id: &LabelId,
    ) -> Result<bool> {
        let removed = labels::detach(&self.db, user_id, email_id, label_id).await?;
        if !removed {
            warn!(
                user_id = %user_id,
                email_id = %email_id,
                label_id = %label_id,
                "Label was not applied"
            );
        }
        Ok(removed)
    }
}
