//! Stored attachment metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AttachmentId, AttachmentRef, EmailId, UserId};

/// Review state of a stored attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    Active,
    /// Failed the malware scan; kept for review and never served.
    Quarantined,
}

impl AttachmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "quarantined" => Self::Quarantined,
            _ => Self::Active,
        }
    }
}

/// Metadata row paired with an object-store blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub user_id: UserId,
    pub email_id: EmailId,
    pub filename: String,
    /// Object-store path of the blob.
    pub storage_path: String,
    pub size_bytes: u64,
    pub mime_type: String,
    /// Hex SHA-256 of the content.
    pub checksum: String,
    pub status: AttachmentStatus,
    pub threats: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    /// The lightweight reference embedded in email records.
    pub fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            id: self.id.clone(),
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.size_bytes,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.status == AttachmentStatus::Quarantined
    }
}
