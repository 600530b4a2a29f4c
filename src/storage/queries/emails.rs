//! Email CRUD operations.
//!
//! Provides database operations for email entities. Every statement binds the
//! owning `user_id`; sort columns come from [`SortField`], never from caller
//! strings.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{escape_like, from_sql_opt_ts, from_sql_ts, placeholders, to_sql_ts};
use crate::domain::{
    Address, ClientId, Direction, Email, EmailContent, EmailId, EmailPatch, FolderId, ProviderId,
    Recipients, UserId,
};
use crate::storage::database::{Database, Result};

const EMAIL_COLUMNS: &str = r#"
    e.id, e.user_id, e.provider_id, e.provider_message_id, e.thread_id,
    e.subject, e.sender_email, e.sender_name, e.to_addresses, e.cc_addresses, e.bcc_addresses,
    e.body_text, e.body_html, e.attachments_json, e.folder_id,
    e.is_read, e.is_starred, e.is_important, e.direction, e.received_at, e.sent_at,
    e.client_id, e.related_documents, e.deleted_at, e.created_at, e.updated_at,
    (SELECT json_group_array(l.name) FROM email_labels el
        JOIN labels l ON l.id = el.label_id
        WHERE el.email_id = e.id) AS label_names
"#;

/// Authoritative timestamp of an email: received for inbound, sent for outbound.
const TIMESTAMP_EXPR: &str = "COALESCE(
    CASE WHEN e.direction = 'inbound' THEN e.received_at ELSE e.sent_at END,
    e.created_at
)";

/// Column an email listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Received or sent time, by direction.
    #[default]
    Date,
    Subject,
    Sender,
    UpdatedAt,
}

impl SortField {
    fn column(&self) -> &'static str {
        match self {
            Self::Date => TIMESTAMP_EXPR,
            Self::Subject => "e.subject COLLATE NOCASE",
            Self::Sender => "e.sender_email COLLATE NOCASE",
            Self::UpdatedAt => "e.updated_at",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Whether soft-deleted emails are part of a selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedScope {
    #[default]
    Exclude,
    Include,
    Only,
}

/// Paged listing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailQuery {
    pub folder_id: Option<FolderId>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub limit: u32,
    pub offset: u32,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
}

impl Default for EmailQuery {
    fn default() -> Self {
        Self {
            folder_id: None,
            is_read: None,
            is_starred: None,
            limit: 50,
            offset: 0,
            sort_by: SortField::Date,
            sort_order: SortOrder::Desc,
        }
    }
}

impl EmailQuery {
    pub fn folder(folder_id: impl Into<FolderId>) -> Self {
        Self {
            folder_id: Some(folder_id.into()),
            ..Default::default()
        }
    }

    pub fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn sorted(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.sort_order = order;
        self
    }
}

/// Filters for full-text search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub sender: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub has_attachments: Option<bool>,
    pub is_read: Option<bool>,
    pub folder_id: Option<FolderId>,
    pub limit: Option<u32>,
}

/// Unordered email selection used by backups, exports and recovery.
///
/// `folder_ids` and `email_ids` are OR-combined when both are given; every
/// other filter is AND-combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub folder_ids: Vec<FolderId>,
    pub email_ids: Vec<EmailId>,
    pub updated_since: Option<DateTime<Utc>>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub deleted_from: Option<DateTime<Utc>>,
    pub deleted_to: Option<DateTime<Utc>>,
    pub sender_contains: Option<String>,
    pub subject_contains: Option<String>,
    pub deleted: DeletedScope,
}

/// Aggregate counts over a user's mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailStats {
    pub total: u64,
    pub unread: u64,
    pub starred: u64,
    pub important: u64,
    pub deleted: u64,
    pub with_attachments: u64,
}

/// Accumulates `WHERE` clauses with their positional values.
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Conditions {
    fn for_user(user_id: &UserId) -> Self {
        let mut c = Self::default();
        c.push("e.user_id = ?", [Value::Text(user_id.0.clone())]);
        c
    }

    fn push(&mut self, clause: impl Into<String>, values: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.values.extend(values);
    }

    fn flag(&mut self, column: &str, value: Option<bool>) {
        if let Some(v) = value {
            self.push(format!("{column} = ?"), [Value::Integer(v as i64)]);
        }
    }

    fn deleted(&mut self, scope: DeletedScope) {
        match scope {
            DeletedScope::Exclude => self.clauses.push("e.deleted_at IS NULL".into()),
            DeletedScope::Only => self.clauses.push("e.deleted_at IS NOT NULL".into()),
            DeletedScope::Include => {}
        }
    }

    fn where_sql(&self) -> String {
        format!("WHERE {}", self.clauses.join(" AND "))
    }
}

fn selection_conditions(user_id: &UserId, selection: &Selection) -> Conditions {
    let mut c = Conditions::for_user(user_id);
    c.deleted(selection.deleted);

    let folder_clause = (!selection.folder_ids.is_empty())
        .then(|| format!("e.folder_id IN ({})", placeholders(selection.folder_ids.len())));
    let id_clause = (!selection.email_ids.is_empty())
        .then(|| format!("e.id IN ({})", placeholders(selection.email_ids.len())));
    let folder_values = selection.folder_ids.iter().map(|f| Value::Text(f.0.clone()));
    let id_values = selection.email_ids.iter().map(|i| Value::Text(i.0.clone()));
    match (folder_clause, id_clause) {
        (Some(f), Some(i)) => c.push(format!("({f} OR {i})"), folder_values.chain(id_values)),
        (Some(f), None) => c.push(f, folder_values),
        (None, Some(i)) => c.push(i, id_values),
        (None, None) => {}
    }

    if let Some(since) = &selection.updated_since {
        c.push("e.updated_at >= ?", [Value::Text(to_sql_ts(since))]);
    }
    if let Some(from) = &selection.date_from {
        c.push(format!("{TIMESTAMP_EXPR} >= ?"), [Value::Text(to_sql_ts(from))]);
    }
    if let Some(to) = &selection.date_to {
        c.push(format!("{TIMESTAMP_EXPR} <= ?"), [Value::Text(to_sql_ts(to))]);
    }
    if let Some(from) = &selection.deleted_from {
        c.push("e.deleted_at >= ?", [Value::Text(to_sql_ts(from))]);
    }
    if let Some(to) = &selection.deleted_to {
        c.push("e.deleted_at <= ?", [Value::Text(to_sql_ts(to))]);
    }
    if let Some(sender) = &selection.sender_contains {
        let pattern = format!("%{}%", escape_like(sender));
        c.push(
            "(e.sender_email LIKE ? ESCAPE '\\' OR e.sender_name LIKE ? ESCAPE '\\')",
            [Value::Text(pattern.clone()), Value::Text(pattern)],
        );
    }
    if let Some(subject) = &selection.subject_contains {
        c.push(
            "e.subject LIKE ? ESCAPE '\\'",
            [Value::Text(format!("%{}%", escape_like(subject)))],
        );
    }
    c
}

/// Inserts an email row on a borrowed connection. Label links are separate.
pub fn insert_in(conn: &Connection, email: &Email) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO emails (
            id, user_id, provider_id, provider_message_id, thread_id,
            subject, sender_email, sender_name, to_addresses, cc_addresses, bcc_addresses,
            body_text, body_html, attachments_json, folder_id,
            is_read, is_starred, is_important, direction, received_at, sent_at,
            client_id, related_documents, deleted_at, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5,
            ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15,
            ?16, ?17, ?18, ?19, ?20, ?21,
            ?22, ?23, ?24, ?25, ?26
        )
        "#,
        params![
            email.id.0,
            email.user_id.0,
            email.provider_id.as_ref().map(|p| &p.0),
            email.provider_message_id,
            email.thread_id,
            email.subject,
            email.sender.email,
            email.sender.name,
            serde_json::to_string(&email.recipients.to).unwrap_or_default(),
            serde_json::to_string(&email.recipients.cc).unwrap_or_default(),
            serde_json::to_string(&email.recipients.bcc).unwrap_or_default(),
            email.content.text,
            email.content.html,
            serde_json::to_string(&email.attachments).unwrap_or_default(),
            email.folder_id.0,
            email.is_read as i32,
            email.is_starred as i32,
            email.is_important as i32,
            email.direction.as_str(),
            email.received_at.as_ref().map(to_sql_ts),
            email.sent_at.as_ref().map(to_sql_ts),
            email.client_id.as_ref().map(|c| &c.0),
            serde_json::to_string(&email.related_documents).unwrap_or_default(),
            email.deleted_at.as_ref().map(to_sql_ts),
            to_sql_ts(&email.created_at),
            to_sql_ts(&email.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts a new email row.
pub async fn insert(db: &Database, email: &Email) -> Result<()> {
    let email = email.clone();
    db.with_conn(move |conn| Ok(insert_in(conn, &email)?)).await
}

/// Overwrites every mutable column of an existing row.
pub fn replace_in(conn: &Connection, email: &Email) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        UPDATE emails SET
            provider_id = ?1, provider_message_id = ?2, thread_id = ?3,
            subject = ?4, sender_email = ?5, sender_name = ?6,
            to_addresses = ?7, cc_addresses = ?8, bcc_addresses = ?9,
            body_text = ?10, body_html = ?11, attachments_json = ?12, folder_id = ?13,
            is_read = ?14, is_starred = ?15, is_important = ?16, direction = ?17,
            received_at = ?18, sent_at = ?19, client_id = ?20, related_documents = ?21,
            deleted_at = ?22, updated_at = ?23
        WHERE id = ?24 AND user_id = ?25
        "#,
        params![
            email.provider_id.as_ref().map(|p| &p.0),
            email.provider_message_id,
            email.thread_id,
            email.subject,
            email.sender.email,
            email.sender.name,
            serde_json::to_string(&email.recipients.to).unwrap_or_default(),
            serde_json::to_string(&email.recipients.cc).unwrap_or_default(),
            serde_json::to_string(&email.recipients.bcc).unwrap_or_default(),
            email.content.text,
            email.content.html,
            serde_json::to_string(&email.attachments).unwrap_or_default(),
            email.folder_id.0,
            email.is_read as i32,
            email.is_starred as i32,
            email.is_important as i32,
            email.direction.as_str(),
            email.received_at.as_ref().map(to_sql_ts),
            email.sent_at.as_ref().map(to_sql_ts),
            email.client_id.as_ref().map(|c| &c.0),
            serde_json::to_string(&email.related_documents).unwrap_or_default(),
            email.deleted_at.as_ref().map(to_sql_ts),
            to_sql_ts(&email.updated_at),
            email.id.0,
            email.user_id.0,
        ],
    )
}

/// Retrieves an email, including soft-deleted ones, on a borrowed connection.
pub fn get_in(
    conn: &Connection,
    user_id: &UserId,
    email_id: &EmailId,
) -> rusqlite::Result<Option<Email>> {
    let sql = format!("SELECT {EMAIL_COLUMNS} FROM emails e WHERE e.user_id = ?1 AND e.id = ?2");
    conn.query_row(&sql, params![user_id.0, email_id.0], row_to_email)
        .optional()
}

/// Retrieves an email by its ID, including soft-deleted ones.
pub async fn get(db: &Database, user_id: &UserId, email_id: &EmailId) -> Result<Option<Email>> {
    let user_id = user_id.clone();
    let email_id = email_id.clone();
    db.with_conn(move |conn| Ok(get_in(conn, &user_id, &email_id)?))
        .await
}

/// Returns true if an email with this id exists for any user.
pub fn id_taken_in(conn: &Connection, email_id: &EmailId) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM emails WHERE id = ?1", [&email_id.0], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// Finds an email by the identifier the provider assigned to it.
pub fn find_by_provider_message_in(
    conn: &Connection,
    user_id: &UserId,
    provider_id: Option<&ProviderId>,
    provider_message_id: &str,
) -> rusqlite::Result<Option<EmailId>> {
    let id: Option<String> = match provider_id {
        Some(provider_id) => conn
            .query_row(
                "SELECT id FROM emails
                 WHERE user_id = ?1 AND provider_id = ?2 AND provider_message_id = ?3",
                params![user_id.0, provider_id.0, provider_message_id],
                |row| row.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id FROM emails WHERE user_id = ?1 AND provider_message_id = ?2",
                params![user_id.0, provider_message_id],
                |row| row.get(0),
            )
            .optional()?,
    };
    Ok(id.map(EmailId))
}

/// Lists a page of emails. Returns the page and the total match count.
pub async fn list(
    db: &Database,
    user_id: &UserId,
    query: &EmailQuery,
) -> Result<(Vec<Email>, u64)> {
    let user_id = user_id.clone();
    let query = query.clone();

    db.with_conn(move |conn| {
        let mut c = Conditions::for_user(&user_id);
        c.deleted(DeletedScope::Exclude);
        if let Some(folder) = &query.folder_id {
            c.push("e.folder_id = ?", [Value::Text(folder.0.clone())]);
        }
        c.flag("e.is_read", query.is_read);
        c.flag("e.is_starred", query.is_starred);

        let where_sql = c.where_sql();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM emails e {where_sql}"),
            params_from_iter(c.values.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails e {where_sql}
             ORDER BY {} {}, e.id LIMIT ? OFFSET ?",
            query.sort_by.column(),
            query.sort_order.keyword(),
        );
        let mut values = c.values;
        values.push(Value::Integer(query.limit as i64));
        values.push(Value::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_email)?;
        let emails: std::result::Result<Vec<_>, _> = rows.collect();
        Ok((emails?, total as u64))
    })
    .await
}

/// Substring search over subject, bodies and sender.
pub async fn search(
    db: &Database,
    user_id: &UserId,
    text: &str,
    filters: &SearchFilters,
) -> Result<Vec<Email>> {
    let user_id = user_id.clone();
    let pattern = format!("%{}%", escape_like(text.trim()));
    let filters = filters.clone();

    db.with_conn(move |conn| {
        let mut c = Conditions::for_user(&user_id);
        c.deleted(DeletedScope::Exclude);
        c.push(
            r#"(e.subject LIKE ? ESCAPE '\' OR e.body_text LIKE ? ESCAPE '\'
                OR e.body_html LIKE ? ESCAPE '\' OR e.sender_name LIKE ? ESCAPE '\'
                OR e.sender_email LIKE ? ESCAPE '\')"#,
            std::iter::repeat(Value::Text(pattern)).take(5),
        );
        if let Some(sender) = &filters.sender {
            c.push(
                "e.sender_email LIKE ? ESCAPE '\\'",
                [Value::Text(format!("%{}%", escape_like(sender)))],
            );
        }
        if let Some(from) = &filters.date_from {
            c.push(format!("{TIMESTAMP_EXPR} >= ?"), [Value::Text(to_sql_ts(from))]);
        }
        if let Some(to) = &filters.date_to {
            c.push(format!("{TIMESTAMP_EXPR} <= ?"), [Value::Text(to_sql_ts(to))]);
        }
        match filters.has_attachments {
            Some(true) => c.push("e.attachments_json <> '[]'", []),
            Some(false) => c.push("e.attachments_json = '[]'", []),
            None => {}
        }
        c.flag("e.is_read", filters.is_read);
        if let Some(folder) = &filters.folder_id {
            c.push("e.folder_id = ?", [Value::Text(folder.0.clone())]);
        }

        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails e {} ORDER BY {TIMESTAMP_EXPR} DESC LIMIT ?",
            c.where_sql()
        );
        let mut values = c.values;
        values.push(Value::Integer(filters.limit.unwrap_or(100) as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_email)?;
        let emails: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(emails?)
    })
    .await
}

/// Returns a stable page of a selection, ordered by creation.
pub async fn select(
    db: &Database,
    user_id: &UserId,
    selection: &Selection,
    limit: u32,
    offset: u32,
) -> Result<Vec<Email>> {
    let user_id = user_id.clone();
    let selection = selection.clone();

    db.with_conn(move |conn| {
        let c = selection_conditions(&user_id, &selection);
        let sql = format!(
            "SELECT {EMAIL_COLUMNS} FROM emails e {} ORDER BY e.created_at, e.id LIMIT ? OFFSET ?",
            c.where_sql()
        );
        let mut values = c.values;
        values.push(Value::Integer(limit as i64));
        values.push(Value::Integer(offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_email)?;
        let emails: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(emails?)
    })
    .await
}

/// Counts the emails in a selection.
pub async fn count_selection(
    db: &Database,
    user_id: &UserId,
    selection: &Selection,
) -> Result<u64> {
    let user_id = user_id.clone();
    let selection = selection.clone();

    db.with_conn(move |conn| {
        let c = selection_conditions(&user_id, &selection);
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM emails e {}", c.where_sql()),
            params_from_iter(c.values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    })
    .await
}

/// Applies a partial update to a set of emails. Returns rows changed.
pub fn apply_patch_in(
    conn: &Connection,
    user_id: &UserId,
    email_ids: &[EmailId],
    patch: &EmailPatch,
) -> rusqlite::Result<usize> {
    if email_ids.is_empty() || patch.is_empty() {
        return Ok(0);
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(subject) = &patch.subject {
        sets.push("subject = ?");
        values.push(Value::Text(subject.clone()));
    }
    for (column, flag) in [
        ("is_read = ?", patch.is_read),
        ("is_starred = ?", patch.is_starred),
        ("is_important = ?", patch.is_important),
    ] {
        if let Some(flag) = flag {
            sets.push(column);
            values.push(Value::Integer(flag as i64));
        }
    }
    if let Some(folder) = &patch.folder_id {
        sets.push("folder_id = ?");
        values.push(Value::Text(folder.0.clone()));
    }
    if let Some(message_id) = &patch.provider_message_id {
        sets.push("provider_message_id = ?");
        values.push(Value::Text(message_id.clone()));
    }
    if let Some(client) = &patch.client_id {
        sets.push("client_id = ?");
        values.push(Value::Text(client.0.clone()));
    }
    if let Some(documents) = &patch.related_documents {
        sets.push("related_documents = ?");
        values.push(Value::Text(
            serde_json::to_string(documents).unwrap_or_default(),
        ));
    }
    sets.push("updated_at = ?");
    values.push(Value::Text(to_sql_ts(&Utc::now())));

    values.push(Value::Text(user_id.0.clone()));
    values.extend(email_ids.iter().map(|id| Value::Text(id.0.clone())));

    let sql = format!(
        "UPDATE emails SET {} WHERE user_id = ? AND id IN ({})",
        sets.join(", "),
        placeholders(email_ids.len())
    );
    conn.execute(&sql, params_from_iter(values.iter()))
}

/// Applies a partial update to a set of emails. Returns rows changed.
pub async fn apply_patch(
    db: &Database,
    user_id: &UserId,
    email_ids: &[EmailId],
    patch: &EmailPatch,
) -> Result<usize> {
    let user_id = user_id.clone();
    let email_ids = email_ids.to_vec();
    let patch = patch.clone();
    db.with_conn(move |conn| Ok(apply_patch_in(conn, &user_id, &email_ids, &patch)?))
        .await
}

/// Sets (or clears, with `None`) `deleted_at` for live or deleted emails.
pub async fn set_deleted(
    db: &Database,
    user_id: &UserId,
    email_ids: &[EmailId],
    deleted_at: Option<DateTime<Utc>>,
) -> Result<usize> {
    if email_ids.is_empty() {
        return Ok(0);
    }
    let user_id = user_id.clone();
    let email_ids = email_ids.to_vec();

    db.with_conn(move |conn| {
        let guard = if deleted_at.is_some() {
            "deleted_at IS NULL"
        } else {
            "deleted_at IS NOT NULL"
        };
        let sql = format!(
            "UPDATE emails SET deleted_at = ?, updated_at = ?
             WHERE user_id = ? AND {guard} AND id IN ({})",
            placeholders(email_ids.len())
        );
        let mut values = vec![
            deleted_at
                .as_ref()
                .map(|d| Value::Text(to_sql_ts(d)))
                .unwrap_or(Value::Null),
            Value::Text(to_sql_ts(&Utc::now())),
            Value::Text(user_id.0.clone()),
        ];
        values.extend(email_ids.iter().map(|id| Value::Text(id.0.clone())));
        Ok(conn.execute(&sql, params_from_iter(values.iter()))?)
    })
    .await
}

/// Removes rows outright. Label links and attachment rows cascade.
pub async fn delete_permanently(
    db: &Database,
    user_id: &UserId,
    email_ids: &[EmailId],
) -> Result<usize> {
    if email_ids.is_empty() {
        return Ok(0);
    }
    let user_id = user_id.clone();
    let email_ids = email_ids.to_vec();

    db.with_conn(move |conn| {
        let sql = format!(
            "DELETE FROM emails WHERE user_id = ? AND id IN ({})",
            placeholders(email_ids.len())
        );
        let mut values = vec![Value::Text(user_id.0.clone())];
        values.extend(email_ids.iter().map(|id| Value::Text(id.0.clone())));
        Ok(conn.execute(&sql, params_from_iter(values.iter()))?)
    })
    .await
}

/// Permanently removes emails soft-deleted before `cutoff`.
pub async fn purge_deleted_before(
    db: &Database,
    user_id: &UserId,
    cutoff: DateTime<Utc>,
) -> Result<usize> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let purged = conn.execute(
            "DELETE FROM emails WHERE user_id = ?1 AND deleted_at IS NOT NULL AND deleted_at < ?2",
            params![user_id.0, to_sql_ts(&cutoff)],
        )?;
        Ok(purged)
    })
    .await
}

/// Aggregate mailbox counts.
pub async fn stats(db: &Database, user_id: &UserId) -> Result<EmailStats> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let stats = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND is_read = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND is_starred = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(
                    SUM(CASE WHEN deleted_at IS NULL AND is_important = 1 THEN 1 ELSE 0 END),
                    0
                ),
                COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(
                    CASE WHEN deleted_at IS NULL AND attachments_json <> '[]' THEN 1 ELSE 0 END
                ), 0)
            FROM emails
            WHERE user_id = ?1
            "#,
            [&user_id.0],
            |row| {
                Ok(EmailStats {
                    total: row.get::<_, i64>(0)? as u64,
                    unread: row.get::<_, i64>(1)? as u64,
                    starred: row.get::<_, i64>(2)? as u64,
                    important: row.get::<_, i64>(3)? as u64,
                    deleted: row.get::<_, i64>(4)? as u64,
                    with_attachments: row.get::<_, i64>(5)? as u64,
                })
            },
        )?;
        Ok(stats)
    })
    .await
}

/// Counts live emails received from a provider since `since`.
pub async fn count_from_provider(
    db: &Database,
    user_id: &UserId,
    provider_id: &ProviderId,
    since: Option<DateTime<Utc>>,
) -> Result<u64> {
    let user_id = user_id.clone();
    let provider_id = provider_id.clone();

    db.with_conn(move |conn| {
        let since = since
            .as_ref()
            .map(to_sql_ts)
            .unwrap_or_else(|| to_sql_ts(&DateTime::<Utc>::UNIX_EPOCH));
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM emails
            WHERE user_id = ?1 AND provider_id = ?2 AND deleted_at IS NULL AND created_at >= ?3
            "#,
            params![user_id.0, provider_id.0, since],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    })
    .await
}

fn row_to_email(row: &Row<'_>) -> std::result::Result<Email, rusqlite::Error> {
    let to_json: String = row.get(8)?;
    let cc_json: String = row.get(9)?;
    let bcc_json: String = row.get(10)?;
    let attachments_json: String = row.get(13)?;
    let direction: String = row.get(18)?;
    let related_json: String = row.get(22)?;
    let created_at: String = row.get(24)?;
    let updated_at: String = row.get(25)?;
    let labels_json: Option<String> = row.get(26)?;

    let mut labels: Vec<String> = labels_json
        .as_deref()
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();
    labels.sort();

    let provider_id: Option<String> = row.get(2)?;
    let client_id: Option<String> = row.get(21)?;

    Ok(Email {
        id: EmailId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        provider_id: provider_id.map(ProviderId),
        provider_message_id: row.get(3)?,
        thread_id: row.get(4)?,
        subject: row.get(5)?,
        sender: Address {
            email: row.get(6)?,
            name: row.get(7)?,
        },
        recipients: Recipients {
            to: serde_json::from_str(&to_json).unwrap_or_default(),
            cc: serde_json::from_str(&cc_json).unwrap_or_default(),
            bcc: serde_json::from_str(&bcc_json).unwrap_or_default(),
        },
        content: EmailContent {
            text: row.get(11)?,
            html: row.get(12)?,
        },
        attachments: serde_json::from_str(&attachments_json).unwrap_or_default(),
        labels,
        folder_id: FolderId(row.get(14)?),
        is_read: row.get::<_, i32>(15)? != 0,
        is_starred: row.get::<_, i32>(16)? != 0,
        is_important: row.get::<_, i32>(17)? != 0,
        direction: Direction::parse(&direction).unwrap_or(Direction::Inbound),
        received_at: from_sql_opt_ts(row.get(19)?),
        sent_at: from_sql_opt_ts(row.get(20)?),
        client_id: client_id.map(ClientId),
        related_documents: serde_json::from_str(&related_json).unwrap_or_default(),
        deleted_at: from_sql_opt_ts(row.get(23)?),
        created_at: from_sql_ts(&created_at),
        updated_at: from_sql_ts(&updated_at),
    })
}
