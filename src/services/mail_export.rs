//! Export and import encodings for stored mail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{system_folders, Direction, Email, EmailId, UserId, BACKUP_FORMAT_VERSION};
use crate::error::{EngineError, Result};
use crate::providers::email::mime;

/// Export file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Eml,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Eml => "eml",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Csv => "text/csv",
            Self::Eml => "message/rfc822",
        }
    }
}

/// Columns written when a CSV export names none.
pub const DEFAULT_CSV_FIELDS: &[&str] = &[
    "id", "date", "from", "to", "subject", "folder", "read", "starred", "labels",
];

const CSV_FIELDS: &[&str] = &[
    "id",
    "date",
    "from",
    "from_name",
    "to",
    "cc",
    "subject",
    "text",
    "folder",
    "direction",
    "read",
    "starred",
    "important",
    "labels",
    "client_id",
    "provider_message_id",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub version: String,
    pub user_id: UserId,
    pub exported_at: DateTime<Utc>,
    pub email_count: usize,
}

/// JSON export file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    pub metadata: ExportMetadata,
    pub emails: Vec<Email>,
}

pub fn to_json(user_id: &UserId, emails: Vec<Email>) -> Result<Vec<u8>> {
    let envelope = ExportEnvelope {
        metadata: ExportMetadata {
            version: BACKUP_FORMAT_VERSION.to_string(),
            user_id: user_id.clone(),
            exported_at: Utc::now(),
            email_count: emails.len(),
        },
        emails,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Rejects unknown column names. An empty list means the default columns.
pub fn resolve_csv_fields(fields: &[String]) -> Result<Vec<String>> {
    if fields.is_empty() {
        return Ok(DEFAULT_CSV_FIELDS.iter().map(|f| f.to_string()).collect());
    }
    let unknown: Vec<&String> = fields
        .iter()
        .filter(|f| !CSV_FIELDS.contains(&f.as_str()))
        .collect();
    if !unknown.is_empty() {
        return Err(EngineError::InvalidOperation(format!(
            "Unknown export fields: {}",
            unknown
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    Ok(fields.to_vec())
}

fn csv_value(email: &Email, field: &str) -> String {
    let join = |addrs: &[crate::domain::Address]| {
        addrs
            .iter()
            .map(|a| a.email.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };
    match field {
        "id" => email.id.to_string(),
        "date" => email.timestamp().to_rfc3339(),
        "from" => email.sender.email.clone(),
        "from_name" => email.sender.name.clone().unwrap_or_default(),
        "to" => join(&email.recipients.to),
        "cc" => join(&email.recipients.cc),
        "subject" => email.subject.clone(),
        "text" => email.content.text.clone().unwrap_or_default(),
        "folder" => email.folder_id.to_string(),
        "direction" => match email.direction {
            Direction::Inbound => "inbound".into(),
            Direction::Outbound => "outbound".into(),
        },
        "read" => email.is_read.to_string(),
        "starred" => email.is_starred.to_string(),
        "important" => email.is_important.to_string(),
        "labels" => email.labels.join("; "),
        "client_id" => email
            .client_id
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default(),
        "provider_message_id" => email.provider_message_id.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

/// Quotes a field when it holds a comma, quote or line break.
fn csv_quote(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// CSV with a header row and CRLF line endings.
pub fn to_csv(emails: &[Email], fields: &[String]) -> String {
    let mut out = String::new();
    let header: Vec<String> = fields.iter().map(|f| csv_quote(f)).collect();
    out.push_str(&header.join(","));
    out.push_str("\r\n");
    for email in emails {
        let row: Vec<String> = fields
            .iter()
            .map(|f| csv_quote(&csv_value(email, f)))
            .collect();
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

pub fn to_eml(email: &Email) -> Result<String> {
    Ok(mime::render_eml(email)?)
}

/// Reads a JSON export envelope and re-owns every record to `user_id`.
pub fn parse_json_import(user_id: &UserId, data: &[u8]) -> Result<Vec<Email>> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| EngineError::InvalidImportFormat(format!("not JSON: {e}")))?;
    let Some(records) = value.get("emails").and_then(Value::as_array) else {
        return Err(EngineError::InvalidImportFormat(
            "missing \"emails\" array".into(),
        ));
    };

    let mut emails = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let mut email: Email = serde_json::from_value(record.clone()).map_err(|e| {
            EngineError::InvalidImportFormat(format!("email {index} is invalid: {e}"))
        })?;
        if email.id.as_str().is_empty() {
            email.id = EmailId::generate();
        }
        email.user_id = user_id.clone();
        emails.push(email);
    }
    Ok(emails)
}

/// Reads one RFC-822 message into a new inbound record.
pub fn parse_eml_import(user_id: &UserId, data: &[u8]) -> Result<Email> {
    let parsed = mime::parse_raw(data)
        .ok_or_else(|| EngineError::InvalidImportFormat("not an RFC-822 message".into()))?;
    let now = Utc::now();
    Ok(Email {
        id: EmailId::generate(),
        user_id: user_id.clone(),
        provider_id: None,
        provider_message_id: parsed.message_id,
        thread_id: None,
        subject: parsed.subject,
        sender: parsed.sender,
        recipients: parsed.recipients,
        content: parsed.content,
        attachments: Vec::new(),
        labels: Vec::new(),
        folder_id: system_folders::inbox(),
        is_read: false,
        is_starred: false,
        is_important: false,
        direction: Direction::Inbound,
        received_at: Some(parsed.date.unwrap_or(now)),
        sent_at: None,
        client_id: None,
        related_documents: Vec::new(),
        deleted_at: None,
        created_at: now,
        updated_at: now,
    })
}
