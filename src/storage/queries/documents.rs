//! Business document rows (invoices and quotes).

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{from_sql_ts, to_sql_ts};
use crate::domain::{
    BusinessDocument, ClientId, ClientInfo, DocumentId, DocumentKind, DocumentStatus, UserId,
};
use crate::storage::database::{Database, Result};

const DOCUMENT_COLUMNS: &str = r#"
    id, user_id, kind, number, amount_cents, currency, status,
    client_id, client_name, client_company, client_email,
    issue_date, due_date, created_at, updated_at
"#;

/// Inserts or replaces a document.
pub async fn upsert(db: &Database, document: &BusinessDocument) -> Result<()> {
    let d = document.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "INSERT OR REPLACE INTO business_documents ({DOCUMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        conn.execute(
            &sql,
            params![
                d.id.0,
                d.user_id.0,
                d.kind.as_str(),
                d.number,
                d.amount_cents,
                d.currency,
                d.status.as_str(),
                d.client.id.as_ref().map(|c| &c.0),
                d.client.name,
                d.client.company,
                d.client.email,
                d.issue_date.to_string(),
                d.due_date.map(|date| date.to_string()),
                to_sql_ts(&d.created_at),
                to_sql_ts(&d.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a document of the given kind.
pub async fn get(
    db: &Database,
    user_id: &UserId,
    kind: DocumentKind,
    id: &DocumentId,
) -> Result<Option<BusinessDocument>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM business_documents
             WHERE user_id = ?1 AND kind = ?2 AND id = ?3"
        );
        let document = conn
            .query_row(&sql, params![user_id.0, kind.as_str(), id.0], row_to_document)
            .optional()?;
        Ok(document)
    })
    .await
}

/// Moves a document from draft to `status`. Other states are left alone.
///
/// Returns true if the status changed.
pub async fn promote_draft(
    db: &Database,
    user_id: &UserId,
    id: &DocumentId,
    status: DocumentStatus,
) -> Result<bool> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE business_documents SET status = ?1, updated_at = ?2
            WHERE user_id = ?3 AND id = ?4 AND status = 'draft'
            "#,
            params![status.as_str(), to_sql_ts(&Utc::now()), user_id.0, id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

fn parse_date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap_or_default()
}

fn row_to_document(row: &Row<'_>) -> std::result::Result<BusinessDocument, rusqlite::Error> {
    let kind: String = row.get(2)?;
    let status: String = row.get(6)?;
    let client_id: Option<String> = row.get(7)?;
    let issue_date: String = row.get(11)?;
    let due_date: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(BusinessDocument {
        id: DocumentId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        kind: DocumentKind::parse(&kind).unwrap_or(DocumentKind::Invoice),
        number: row.get(3)?,
        amount_cents: row.get(4)?,
        currency: row.get(5)?,
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Draft),
        client: ClientInfo {
            id: client_id.map(ClientId),
            name: row.get(8)?,
            company: row.get(9)?,
            email: row.get(10)?,
        },
        issue_date: parse_date(&issue_date),
        due_date: due_date.as_deref().map(parse_date),
        created_at: from_sql_ts(&created_at),
        updated_at: from_sql_ts(&updated_at),
    })
}
