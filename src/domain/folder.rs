//! Folder and label domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FolderId, LabelId, UserId};

/// A mail folder. Every email lives in exactly one folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub user_id: UserId,
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub parent_id: Option<FolderId>,
    /// System folders cannot be renamed or deleted.
    pub is_system: bool,
    /// Derived on read.
    pub total_count: u64,
    /// Derived on read.
    pub unread_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a custom folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFolder {
    pub name: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub parent_id: Option<FolderId>,
}

impl NewFolder {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: None,
            color: None,
            parent_id: None,
        }
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn parent(mut self, parent: FolderId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// Partial folder update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderUpdate {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
}

/// Well-known system folders, provisioned lazily for every user.
pub mod system_folders {
    use super::FolderId;

    pub const INBOX: &str = "inbox";
    pub const SENT: &str = "sent";
    pub const DRAFTS: &str = "drafts";
    pub const ARCHIVE: &str = "archive";
    pub const SPAM: &str = "spam";
    pub const TRASH: &str = "trash";

    /// `(id, display name, icon)` for each system folder.
    pub const ALL: [(&str, &str, &str); 6] = [
        (INBOX, "Inbox", "inbox"),
        (SENT, "Sent", "send"),
        (DRAFTS, "Drafts", "file"),
        (ARCHIVE, "Archive", "archive"),
        (SPAM, "Spam", "alert-octagon"),
        (TRASH, "Trash", "trash"),
    ];

    pub fn inbox() -> FolderId {
        FolderId::from(INBOX)
    }

    pub fn sent() -> FolderId {
        FolderId::from(SENT)
    }

    pub fn is_system(id: &FolderId) -> bool {
        ALL.iter().any(|(system_id, _, _)| *system_id == id.0)
    }
}

/// A user-defined label. Names are unique per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub user_id: UserId,
    pub name: String,
    /// Hex color for display, e.g. "#0066cc".
    pub color: String,
    pub created_at: DateTime<Utc>,
}

/// Default color for labels created without one.
pub const DEFAULT_LABEL_COLOR: &str = "#6b7280";
