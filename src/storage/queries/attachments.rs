//! Attachment metadata rows.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{from_sql_ts, to_sql_ts};
use crate::domain::{Attachment, AttachmentId, AttachmentStatus, EmailId, UserId};
use crate::storage::database::{Database, Result};

const ATTACHMENT_COLUMNS: &str = r#"
    id, user_id, email_id, filename, storage_path, size_bytes, mime_type,
    checksum, status, threats, created_at
"#;

/// Storage used by a user's attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUsage {
    pub total_bytes: u64,
    pub count: u64,
    pub quarantined: u64,
}

/// Outcome of [`insert_within_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// No email with that id belongs to the attachment's user.
    EmailNotFound,
    /// The email already carries the maximum number of attachments.
    LimitReached,
}

/// Inserts an attachment row when its email belongs to the same user and
/// holds fewer than `max_per_email` attachments. Check and insert run in one
/// transaction.
pub async fn insert_within_limit(
    db: &Database,
    attachment: &Attachment,
    max_per_email: usize,
) -> Result<InsertOutcome> {
    let a = attachment.clone();

    db.transaction(move |tx| {
        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM emails WHERE id = ?1 AND user_id = ?2",
                params![a.email_id.0, a.user_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Ok(InsertOutcome::EmailNotFound);
        }

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM email_attachments WHERE user_id = ?1 AND email_id = ?2",
            params![a.user_id.0, a.email_id.0],
            |row| row.get(0),
        )?;
        if existing as usize >= max_per_email {
            return Ok(InsertOutcome::LimitReached);
        }

        tx.execute(
            r#"
            INSERT INTO email_attachments (
                id, user_id, email_id, filename, storage_path, size_bytes, mime_type,
                checksum, status, threats, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                a.id.0,
                a.user_id.0,
                a.email_id.0,
                a.filename,
                a.storage_path,
                a.size_bytes as i64,
                a.mime_type,
                a.checksum,
                a.status.as_str(),
                serde_json::to_string(&a.threats).unwrap_or_default(),
                to_sql_ts(&a.created_at),
            ],
        )?;
        Ok(InsertOutcome::Inserted)
    })
    .await
}

/// Number of attachment rows on one of the user's emails.
pub async fn count_for_email(db: &Database, user_id: &UserId, email_id: &EmailId) -> Result<u64> {
    let user_id = user_id.clone();
    let email_id = email_id.clone();

    db.with_conn(move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM email_attachments WHERE user_id = ?1 AND email_id = ?2",
            params![user_id.0, email_id.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    })
    .await
}

/// Retrieves one attachment.
pub async fn get(db: &Database, user_id: &UserId, id: &AttachmentId) -> Result<Option<Attachment>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM email_attachments WHERE user_id = ?1 AND id = ?2"
        );
        let attachment = conn
            .query_row(&sql, params![user_id.0, id.0], row_to_attachment)
            .optional()?;
        Ok(attachment)
    })
    .await
}

/// Lists the attachments of one email in upload order.
pub async fn list_for_email(
    db: &Database,
    user_id: &UserId,
    email_id: &EmailId,
) -> Result<Vec<Attachment>> {
    let user_id = user_id.clone();
    let email_id = email_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {ATTACHMENT_COLUMNS} FROM email_attachments
            WHERE user_id = ?1 AND email_id = ?2
            ORDER BY created_at, id
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, email_id.0], row_to_attachment)?;
        let attachments: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(attachments?)
    })
    .await
}

/// Deletes an attachment row. Returns rows removed.
pub async fn delete(db: &Database, user_id: &UserId, id: &AttachmentId) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM email_attachments WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, id.0],
        )?;
        Ok(removed)
    })
    .await
}

/// Total bytes and counts for a user.
pub async fn usage(db: &Database, user_id: &UserId) -> Result<AttachmentUsage> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let usage = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(size_bytes), 0),
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'quarantined' THEN 1 ELSE 0 END), 0)
            FROM email_attachments
            WHERE user_id = ?1
            "#,
            [&user_id.0],
            |row| {
                Ok(AttachmentUsage {
                    total_bytes: row.get::<_, i64>(0)? as u64,
                    count: row.get::<_, i64>(1)? as u64,
                    quarantined: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(usage)
    })
    .await
}

/// Every object-store path referenced by a user's attachment rows.
pub async fn storage_paths(db: &Database, user_id: &UserId) -> Result<Vec<String>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt =
            conn.prepare("SELECT storage_path FROM email_attachments WHERE user_id = ?1")?;
        let rows = stmt.query_map([&user_id.0], |row| row.get(0))?;
        let paths: std::result::Result<Vec<String>, _> = rows.collect();
        Ok(paths?)
    })
    .await
}

fn row_to_attachment(row: &Row<'_>) -> std::result::Result<Attachment, rusqlite::Error> {
    let status: String = row.get(8)?;
    let threats: String = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(Attachment {
        id: AttachmentId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        email_id: EmailId(row.get(2)?),
        filename: row.get(3)?,
        storage_path: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        mime_type: row.get(6)?,
        checksum: row.get(7)?,
        status: AttachmentStatus::parse(&status),
        threats: serde_json::from_str(&threats).unwrap_or_default(),
        created_at: from_sql_ts(&created_at),
    })
}
