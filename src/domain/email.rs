//! Email domain types.
//!
//! Represents individual email messages and related structures.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{AttachmentId, ClientId, DocumentId, EmailId, FolderId, ProviderId, UserId};

/// A stored email message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Unique identifier for this email.
    pub id: EmailId,
    /// Owner of the message.
    pub user_id: UserId,
    /// Provider connection the message was sent or synced through.
    pub provider_id: Option<ProviderId>,
    /// Identifier assigned by the remote provider.
    pub provider_message_id: Option<String>,
    /// Provider conversation identifier.
    pub thread_id: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Sender address.
    pub sender: Address,
    /// To/Cc/Bcc recipients.
    pub recipients: Recipients,
    /// Plain text and HTML bodies.
    pub content: EmailContent,
    /// Attachments stored for this email.
    pub attachments: Vec<AttachmentRef>,
    /// Names of the labels applied to this email.
    pub labels: Vec<String>,
    /// Folder the email lives in.
    pub folder_id: FolderId,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    /// Whether the message was received or sent.
    pub direction: Direction,
    /// Authoritative for inbound mail.
    pub received_at: Option<DateTime<Utc>>,
    /// Authoritative for outbound mail.
    pub sent_at: Option<DateTime<Utc>>,
    /// Business contact this email relates to.
    pub client_id: Option<ClientId>,
    /// Invoices or quotes this email was sent for.
    pub related_documents: Vec<DocumentRef>,
    /// Set when the email is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Email {
    /// Returns the authoritative timestamp for this email's direction.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let stamp = match self.direction {
            Direction::Inbound => self.received_at,
            Direction::Outbound => self.sent_at,
        };
        stamp.unwrap_or(self.created_at)
    }

    /// Returns true if the email has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns true if any attachments are stored for the email.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Returns true if the label is applied, compared case-insensitively.
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }
}

/// Direction of a message relative to the owning user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parses `Name <email>`, `<email>` or a bare address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(start) = raw.find('<') {
            if let Some(end) = raw.rfind('>') {
                if end > start {
                    let name = raw[..start].trim().trim_matches('"').trim();
                    let email = raw[start + 1..end].trim();
                    return Self {
                        email: email.to_string(),
                        name: (!name.is_empty()).then(|| name.to_string()),
                    };
                }
            }
        }
        Self::new(raw)
    }

    /// Returns the display string: "Name <email>" or just "email".
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }

    /// Returns true if the address is syntactically valid.
    pub fn is_valid(&self) -> bool {
        is_valid_email(&self.email)
    }
}

/// Checks the basic `local@domain.tld` shape used for recipient validation.
pub fn is_valid_email(candidate: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[^\s@<>]+@[^\s@<>]+\.[^\s@<>]+$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(candidate))
}

/// Recipient lists of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipients {
    pub to: Vec<Address>,
    #[serde(default)]
    pub cc: Vec<Address>,
    #[serde(default)]
    pub bcc: Vec<Address>,
}

impl Recipients {
    pub fn to(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            to: addresses.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Iterates over every recipient regardless of kind.
    pub fn all(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty()
    }
}

/// Message bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl EmailContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            html: None,
        }
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self {
            text: None,
            html: Some(html.into()),
        }
    }

    /// Returns true if neither body has any non-whitespace content.
    pub fn is_empty(&self) -> bool {
        let blank = |b: &Option<String>| b.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.text) && blank(&self.html)
    }
}

/// Reference to a stored attachment, embedded in an email record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: AttachmentId,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

/// Kind of business document an email can relate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Invoice,
    Quote,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Quote => "quote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice" => Some(Self::Invoice),
            "quote" => Some(Self::Quote),
            _ => None,
        }
    }
}

/// Link from an email to a business document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    #[serde(rename = "type")]
    pub kind: DocumentKind,
    pub id: DocumentId,
}

/// Input for storing a new email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEmail {
    /// Preserved identifier, used by restore and import.
    pub id: Option<EmailId>,
    pub provider_id: Option<ProviderId>,
    pub provider_message_id: Option<String>,
    pub thread_id: Option<String>,
    pub subject: String,
    pub sender: Address,
    pub recipients: Recipients,
    pub content: EmailContent,
    pub attachments: Vec<AttachmentRef>,
    pub labels: Vec<String>,
    /// Defaults to inbox for inbound and sent for outbound mail.
    pub folder_id: Option<FolderId>,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub direction: Direction,
    /// Received or sent time, depending on direction. Defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    pub client_id: Option<ClientId>,
    pub related_documents: Vec<DocumentRef>,
}

impl NewEmail {
    fn base(direction: Direction, sender: Address, subject: impl Into<String>) -> Self {
        Self {
            id: None,
            provider_id: None,
            provider_message_id: None,
            thread_id: None,
            subject: subject.into(),
            sender,
            recipients: Recipients::default(),
            content: EmailContent::default(),
            attachments: Vec::new(),
            labels: Vec::new(),
            folder_id: None,
            is_read: false,
            is_starred: false,
            is_important: false,
            direction,
            timestamp: None,
            client_id: None,
            related_documents: Vec::new(),
        }
    }

    /// A received message.
    pub fn inbound(sender: Address, subject: impl Into<String>) -> Self {
        Self::base(Direction::Inbound, sender, subject)
    }

    /// A message sent by the user. Outbound mail is stored as read.
    pub fn outbound(sender: Address, subject: impl Into<String>) -> Self {
        let mut email = Self::base(Direction::Outbound, sender, subject);
        email.is_read = true;
        email
    }

    pub fn to(mut self, recipients: Recipients) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn content(mut self, content: EmailContent) -> Self {
        self.content = content;
        self
    }

    pub fn folder(mut self, folder_id: impl Into<FolderId>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn provider_message(
        mut self,
        provider_id: Option<ProviderId>,
        message_id: impl Into<String>,
    ) -> Self {
        self.provider_id = provider_id;
        self.provider_message_id = Some(message_id.into());
        self
    }

    pub fn labels(mut self, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn related(mut self, documents: Vec<DocumentRef>) -> Self {
        self.related_documents = documents;
        self
    }

    /// Collects every required-field violation.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.subject.trim().is_empty() {
            errors.push("Subject is required".to_string());
        }
        if self.sender.email.trim().is_empty() {
            errors.push("Sender email is required".to_string());
        } else if !self.sender.is_valid() {
            errors.push("Invalid sender email format".to_string());
        }
        if self.recipients.all().any(|a| !a.is_valid()) {
            errors.push("Invalid recipient email format".to_string());
        }
        errors
    }
}

/// Partial update of an email. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailPatch {
    pub subject: Option<String>,
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub is_important: Option<bool>,
    pub folder_id: Option<FolderId>,
    pub provider_message_id: Option<String>,
    pub client_id: Option<ClientId>,
    pub related_documents: Option<Vec<DocumentRef>>,
}

impl EmailPatch {
    pub fn read(is_read: bool) -> Self {
        Self {
            is_read: Some(is_read),
            ..Default::default()
        }
    }

    pub fn starred(is_starred: bool) -> Self {
        Self {
            is_starred: Some(is_starred),
            ..Default::default()
        }
    }

    pub fn move_to(folder_id: FolderId) -> Self {
        Self {
            folder_id: Some(folder_id),
            ..Default::default()
        }
    }

    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_with_name() {
        let addr = Address::parse("John Doe <john@example.com>");
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));
    }

    #[test]
    fn address_parse_quoted_name_and_bare() {
        let addr = Address::parse("\"Doe, Jane\" <jane@example.com>");
        assert_eq!(addr.name.as_deref(), Some("Doe, Jane"));
        assert_eq!(Address::parse("plain@example.com").name, None);
        assert_eq!(Address::parse("<x@example.com>").email, "x@example.com");
    }

    #[test]
    fn email_format_validation() {
        assert!(is_valid_email("client@example.com"));
        assert!(!is_valid_email("invalid-email"));
        assert!(!is_valid_email("a b@example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn content_emptiness() {
        assert!(EmailContent::default().is_empty());
        assert!(EmailContent::text("   ").is_empty());
        assert!(!EmailContent::html("<p>hi</p>").is_empty());
    }

    #[test]
    fn new_email_collects_all_errors() {
        let email = NewEmail::inbound(Address::new(""), "  ")
            .to(Recipients::to([Address::new("broken")]));
        assert_eq!(
            email.validation_errors(),
            vec![
                "Subject is required".to_string(),
                "Sender email is required".to_string(),
                "Invalid recipient email format".to_string(),
            ]
        );
    }

    #[test]
    fn outbound_defaults_to_read() {
        let email = NewEmail::outbound(Address::new("me@example.com"), "Hi");
        assert!(email.is_read);
        assert_eq!(email.direction, Direction::Outbound);
    }

    #[test]
    fn document_ref_serializes_type_tag() {
        let doc = DocumentRef {
            kind: DocumentKind::Invoice,
            id: DocumentId::from("inv-1"),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json, serde_json::json!({"type": "invoice", "id": "inv-1"}));
    }

    #[test]
    fn empty_patch() {
        assert!(EmailPatch::default().is_empty());
        assert!(!EmailPatch::read(true).is_empty());
    }
}
