//! Database, blob and credential storage.
//!
//! This module provides the storage layer for the engine, including:
//!
//! - SQLite database for emails, folders, labels, providers, backups and logs
//! - Object store for attachments, backup chunks and exports
//! - Credential vault sealing provider secrets with AES-256-GCM
//! - OS keychain integration for the vault master key
//! - Async-safe database operations via tokio::task::spawn_blocking

pub mod crypto;
mod database;
mod keychain;
mod mail_store;
pub mod object_store;
pub mod queries;
mod schema;
mod vault;

pub use crypto::{Cipher, CryptoError};
pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError};
pub use mail_store::{merge_records, ApplyOutcome, ConflictStrategy, EmailPage, MailStore};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use vault::{CredentialVault, VaultError};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_database_has_every_table() {
        let db = Database::open_in_memory().await.unwrap();

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        for table in [
            "emails",
            "email_folders",
            "labels",
            "email_labels",
            "email_attachments",
            "email_activity",
            "business_email_logs",
            "business_documents",
            "provider_configs",
            "sync_history",
            "webhook_subscriptions",
            "backups",
            "backup_schedules",
            "user_email_settings",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");
        let user = crate::domain::UserId::from("user-1");

        {
            let db = Database::open(&path).await.unwrap();
            queries::folders::ensure_system(&db, &user).await.unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        let folders = queries::folders::list(&db, &user).await.unwrap();
        assert_eq!(folders.len(), 6);
    }
}
