//! Core identifier types for domain entities.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

id_type!(
    /// Identifier of the user that owns a record. Every table is keyed by it.
    UserId
);
id_type!(
    /// Unique identifier for an individual email.
    EmailId
);
id_type!(
    /// Folder identifier, unique per user. System folders use their well-known names.
    FolderId
);
id_type!(
    /// Unique identifier for a label.
    LabelId
);
id_type!(
    /// Unique identifier for a provider connection.
    ProviderId
);
id_type!(
    /// Unique identifier for a stored attachment.
    AttachmentId
);
id_type!(
    /// Unique identifier for a backup.
    BackupId
);
id_type!(
    /// Unique identifier for a backup schedule.
    ScheduleId
);
id_type!(
    /// Unique identifier for a business document (invoice or quote).
    DocumentId
);
id_type!(
    /// Business contact a message relates to.
    ClientId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prints_inner_value() {
        assert_eq!(UserId::from("user-1").to_string(), "user-1");
        assert_eq!(EmailId::from("email-9".to_string()).to_string(), "email-9");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = BackupId::generate();
        let b = BackupId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&FolderId::from("inbox")).unwrap();
        assert_eq!(json, "\"inbox\"");
        let back: FolderId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FolderId::from("inbox"));
    }
}
