//! Activity, business email log and sync history rows.
//!
//! These are append-mostly audit tables; only scheduled business log rows
//! change state after insertion.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::{from_sql_opt_ts, from_sql_ts, to_sql_ts};
use crate::domain::{
    BusinessEmailLog, ClientId, DeliveryStatus, DocumentId, DocumentKind, EmailActivity, EmailId,
    ProviderId, SyncHistoryEntry, UserId,
};
use crate::storage::database::{Database, Result};

/// Aggregates over a provider's sync history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTotals {
    pub syncs: u64,
    pub failures: u64,
    pub emails: u64,
    pub last_success: Option<DateTime<Utc>>,
}

// ============================================================================
// Email activity
// ============================================================================

/// Appends an activity record.
pub async fn record_activity(db: &Database, activity: &EmailActivity) -> Result<()> {
    let a = activity.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO email_activity
                (id, user_id, email_id, provider_id, action, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                a.id,
                a.user_id.0,
                a.email_id.as_ref().map(|e| &e.0),
                a.provider_id.as_ref().map(|p| &p.0),
                a.action,
                a.details.to_string(),
                to_sql_ts(&a.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists activity newest first, optionally filtered by action.
pub async fn list_activity(
    db: &Database,
    user_id: &UserId,
    action: Option<&str>,
    limit: u32,
) -> Result<Vec<EmailActivity>> {
    let user_id = user_id.clone();
    let action = action.map(str::to_string);

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, email_id, provider_id, action, details, created_at
            FROM email_activity
            WHERE user_id = ?1 AND (?2 IS NULL OR action = ?2)
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![user_id.0, action, limit], row_to_activity)?;
        let activity: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(activity?)
    })
    .await
}

/// Counts activity rows with the given action since `since`.
pub async fn count_activity(
    db: &Database,
    user_id: &UserId,
    action: &str,
    since: DateTime<Utc>,
) -> Result<u64> {
    let user_id = user_id.clone();
    let action = action.to_string();

    db.with_conn(move |conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM email_activity
             WHERE user_id = ?1 AND action = ?2 AND created_at >= ?3",
            params![user_id.0, action, to_sql_ts(&since)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    })
    .await
}

fn row_to_activity(row: &Row<'_>) -> std::result::Result<EmailActivity, rusqlite::Error> {
    let email_id: Option<String> = row.get(2)?;
    let provider_id: Option<String> = row.get(3)?;
    let details: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(EmailActivity {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        email_id: email_id.map(EmailId),
        provider_id: provider_id.map(ProviderId),
        action: row.get(4)?,
        details: serde_json::from_str(&details).unwrap_or_default(),
        created_at: from_sql_ts(&created_at),
    })
}

// ============================================================================
// Business email log
// ============================================================================

const LOG_COLUMNS: &str = r#"
    id, user_id, client_id, document_type, document_id, document_number, amount_cents,
    currency, email_type, status, recipient_email, subject, template_id, message_id,
    error, scheduled_for, created_at
"#;

/// Filter for business log queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    pub client_id: Option<ClientId>,
    pub document_id: Option<DocumentId>,
    pub status: Option<DeliveryStatus>,
    pub email_type: Option<String>,
    pub limit: Option<u32>,
}

/// Appends a business email log row.
pub async fn insert_log(db: &Database, log: &BusinessEmailLog) -> Result<()> {
    let l = log.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "INSERT INTO business_email_logs ({LOG_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        );
        conn.execute(
            &sql,
            params![
                l.id,
                l.user_id.0,
                l.client_id.as_ref().map(|c| &c.0),
                l.document_kind.map(|k| k.as_str()),
                l.document_id.as_ref().map(|d| &d.0),
                l.document_number,
                l.amount_cents,
                l.currency,
                l.email_type,
                l.status.as_str(),
                l.recipient_email,
                l.subject,
                l.template_id,
                l.message_id,
                l.error,
                l.scheduled_for.as_ref().map(to_sql_ts),
                to_sql_ts(&l.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists business log rows newest first.
pub async fn list_logs(
    db: &Database,
    user_id: &UserId,
    filter: &LogFilter,
) -> Result<Vec<BusinessEmailLog>> {
    let user_id = user_id.clone();
    let filter = filter.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {LOG_COLUMNS} FROM business_email_logs
            WHERE user_id = ?1
                AND (?2 IS NULL OR client_id = ?2)
                AND (?3 IS NULL OR document_id = ?3)
                AND (?4 IS NULL OR status = ?4)
                AND (?5 IS NULL OR email_type = ?5)
            ORDER BY created_at DESC
            LIMIT ?6
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                user_id.0,
                filter.client_id.as_ref().map(|c| &c.0),
                filter.document_id.as_ref().map(|d| &d.0),
                filter.status.map(|s| s.as_str()),
                filter.email_type,
                filter.limit.unwrap_or(100),
            ],
            row_to_log,
        )?;
        let logs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(logs?)
    })
    .await
}

/// Scheduled rows whose `scheduled_for` is at or before `now`, oldest first.
pub async fn due_scheduled(db: &Database, now: DateTime<Utc>) -> Result<Vec<BusinessEmailLog>> {
    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {LOG_COLUMNS} FROM business_email_logs
            WHERE status = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?1
            ORDER BY scheduled_for
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([to_sql_ts(&now)], row_to_log)?;
        let logs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(logs?)
    })
    .await
}

/// Records the outcome of a scheduled row. Only scheduled rows change.
pub async fn resolve_scheduled(
    db: &Database,
    log_id: &str,
    status: DeliveryStatus,
    message_id: Option<String>,
    error: Option<String>,
) -> Result<usize> {
    let log_id = log_id.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE business_email_logs SET status = ?1, message_id = ?2, error = ?3
            WHERE id = ?4 AND status = 'scheduled'
            "#,
            params![status.as_str(), message_id, error, log_id],
        )?;
        Ok(changed)
    })
    .await
}

/// Cancels pending scheduled rows for a document. Returns rows changed.
pub async fn cancel_scheduled_for_document(
    db: &Database,
    user_id: &UserId,
    document_id: &DocumentId,
) -> Result<usize> {
    let user_id = user_id.clone();
    let document_id = document_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE business_email_logs SET status = 'failed', error = 'cancelled'
            WHERE user_id = ?1 AND document_id = ?2 AND status = 'scheduled'
            "#,
            params![user_id.0, document_id.0],
        )?;
        Ok(changed)
    })
    .await
}

fn row_to_log(row: &Row<'_>) -> std::result::Result<BusinessEmailLog, rusqlite::Error> {
    let client_id: Option<String> = row.get(2)?;
    let document_type: Option<String> = row.get(3)?;
    let document_id: Option<String> = row.get(4)?;
    let status: String = row.get(9)?;
    let created_at: String = row.get(16)?;

    Ok(BusinessEmailLog {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        client_id: client_id.map(ClientId),
        document_kind: document_type.as_deref().and_then(DocumentKind::parse),
        document_id: document_id.map(DocumentId),
        document_number: row.get(5)?,
        amount_cents: row.get(6)?,
        currency: row.get(7)?,
        email_type: row.get(8)?,
        status: DeliveryStatus::parse(&status),
        recipient_email: row.get(10)?,
        subject: row.get(11)?,
        template_id: row.get(12)?,
        message_id: row.get(13)?,
        error: row.get(14)?,
        scheduled_for: from_sql_opt_ts(row.get(15)?),
        created_at: from_sql_ts(&created_at),
    })
}

// ============================================================================
// Sync history
// ============================================================================

/// Appends a sync history row.
pub async fn record_sync(db: &Database, entry: &SyncHistoryEntry) -> Result<()> {
    let e = entry.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO sync_history
                (id, user_id, provider_id, synced_at, emails_count, success, incremental, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                e.id,
                e.user_id.0,
                e.provider_id.0,
                to_sql_ts(&e.synced_at),
                e.emails_count as i64,
                e.success as i32,
                e.incremental as i32,
                e.error,
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists sync history for a provider, newest first.
pub async fn list_syncs(
    db: &Database,
    user_id: &UserId,
    provider_id: &ProviderId,
    limit: u32,
) -> Result<Vec<SyncHistoryEntry>> {
    let user_id = user_id.clone();
    let provider_id = provider_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, provider_id, synced_at, emails_count, success, incremental, error
            FROM sync_history
            WHERE user_id = ?1 AND provider_id = ?2
            ORDER BY synced_at DESC
            LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![user_id.0, provider_id.0, limit], |row| {
            let synced_at: String = row.get(3)?;
            Ok(SyncHistoryEntry {
                id: row.get(0)?,
                user_id: UserId(row.get(1)?),
                provider_id: ProviderId(row.get(2)?),
                synced_at: from_sql_ts(&synced_at),
                emails_count: row.get::<_, i64>(4)? as u64,
                success: row.get::<_, i32>(5)? != 0,
                incremental: row.get::<_, i32>(6)? != 0,
                error: row.get(7)?,
            })
        })?;
        let entries: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(entries?)
    })
    .await
}

/// Aggregate sync counts for a provider.
pub async fn sync_totals(
    db: &Database,
    user_id: &UserId,
    provider_id: &ProviderId,
) -> Result<SyncTotals> {
    let user_id = user_id.clone();
    let provider_id = provider_id.clone();

    db.with_conn(move |conn| {
        let totals = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(emails_count), 0),
                MAX(CASE WHEN success = 1 THEN synced_at END)
            FROM sync_history
            WHERE user_id = ?1 AND provider_id = ?2
            "#,
            params![user_id.0, provider_id.0],
            |row| {
                Ok(SyncTotals {
                    syncs: row.get::<_, i64>(0)? as u64,
                    failures: row.get::<_, i64>(1)? as u64,
                    emails: row.get::<_, i64>(2)? as u64,
                    last_success: from_sql_opt_ts(row.get(3)?),
                })
            },
        )?;
        Ok(totals)
    })
    .await
}
