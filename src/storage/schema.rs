//! SQL schema definitions as const strings.
//!
//! Every table carries `user_id`; queries always bind it.

/// SQL to create the folders table. System folders share ids across users,
/// so the key is composite.
pub const CREATE_FOLDERS: &str = r#"
CREATE TABLE IF NOT EXISTS email_folders (
    user_id TEXT NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL,
    icon TEXT,
    color TEXT,
    parent_id TEXT,
    is_system INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, id)
)
"#;

/// SQL to create the emails table.
pub const CREATE_EMAILS: &str = r#"
CREATE TABLE IF NOT EXISTS emails (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_id TEXT,
    provider_message_id TEXT,
    thread_id TEXT,
    subject TEXT NOT NULL,
    sender_email TEXT NOT NULL,
    sender_name TEXT,
    to_addresses TEXT NOT NULL,
    cc_addresses TEXT NOT NULL,
    bcc_addresses TEXT NOT NULL,
    body_text TEXT,
    body_html TEXT,
    attachments_json TEXT NOT NULL DEFAULT '[]',
    folder_id TEXT NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0,
    is_starred INTEGER NOT NULL DEFAULT 0,
    is_important INTEGER NOT NULL DEFAULT 0,
    direction TEXT NOT NULL,
    received_at TEXT,
    sent_at TEXT,
    client_id TEXT,
    related_documents TEXT NOT NULL DEFAULT '[]',
    deleted_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id, folder_id) REFERENCES email_folders(user_id, id)
)
"#;

/// SQL to create email indexes.
pub const CREATE_EMAIL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_emails_user_folder ON emails(user_id, folder_id);
CREATE INDEX IF NOT EXISTS idx_emails_user_deleted ON emails(user_id, deleted_at);
CREATE INDEX IF NOT EXISTS idx_emails_user_updated ON emails(user_id, updated_at);
CREATE INDEX IF NOT EXISTS idx_emails_provider_message
    ON emails(user_id, provider_id, provider_message_id);
CREATE INDEX IF NOT EXISTS idx_emails_client ON emails(user_id, client_id)
"#;

/// SQL to create the labels table.
pub const CREATE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS labels (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    color TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, name)
)
"#;

/// SQL to create the email/label join table.
pub const CREATE_EMAIL_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS email_labels (
    email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
    label_id TEXT NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (email_id, label_id)
)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS email_attachments (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    checksum TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    threats TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
)
"#;

/// SQL to create attachment indexes.
pub const CREATE_ATTACHMENT_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_attachments_user ON email_attachments(user_id);
CREATE INDEX IF NOT EXISTS idx_attachments_email ON email_attachments(email_id)
"#;

/// SQL to create the generic activity log.
pub const CREATE_EMAIL_ACTIVITY: &str = r#"
CREATE TABLE IF NOT EXISTS email_activity (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    email_id TEXT,
    provider_id TEXT,
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the business email log.
pub const CREATE_BUSINESS_EMAIL_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS business_email_logs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    client_id TEXT,
    document_type TEXT,
    document_id TEXT,
    document_number TEXT,
    amount_cents INTEGER,
    currency TEXT,
    email_type TEXT NOT NULL,
    status TEXT NOT NULL,
    recipient_email TEXT NOT NULL,
    subject TEXT NOT NULL,
    template_id TEXT,
    message_id TEXT,
    error TEXT,
    scheduled_for TEXT,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create activity and log indexes.
pub const CREATE_ACTIVITY_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_activity_user_action ON email_activity(user_id, action);
CREATE INDEX IF NOT EXISTS idx_business_logs_client ON business_email_logs(user_id, client_id);
CREATE INDEX IF NOT EXISTS idx_business_logs_status
    ON business_email_logs(user_id, status, scheduled_for)
"#;

/// SQL to create the business documents table.
pub const CREATE_BUSINESS_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS business_documents (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    number TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    status TEXT NOT NULL,
    client_id TEXT,
    client_name TEXT NOT NULL,
    client_company TEXT,
    client_email TEXT,
    issue_date TEXT NOT NULL,
    due_date TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the provider connections table.
pub const CREATE_PROVIDER_CONFIGS: &str = r#"
CREATE TABLE IF NOT EXISTS provider_configs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    email TEXT NOT NULL,
    display_name TEXT,
    encrypted_credentials TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_default INTEGER NOT NULL DEFAULT 0,
    sync_token TEXT,
    last_synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, provider_type, email)
)
"#;

/// At most one default provider per user.
pub const CREATE_PROVIDER_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_provider_single_default
    ON provider_configs(user_id) WHERE is_default = 1
"#;

/// SQL to create the sync history table.
pub const CREATE_SYNC_HISTORY: &str = r#"
CREATE TABLE IF NOT EXISTS sync_history (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    emails_count INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL,
    incremental INTEGER NOT NULL DEFAULT 0,
    error TEXT
)
"#;

/// SQL to create the webhook subscriptions table.
pub const CREATE_WEBHOOK_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_id TEXT NOT NULL REFERENCES provider_configs(id) ON DELETE CASCADE,
    provider_type TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    client_state TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the backups table.
pub const CREATE_BACKUPS: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    backup_type TEXT NOT NULL,
    storage_path TEXT NOT NULL,
    email_count INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    encrypted INTEGER NOT NULL DEFAULT 0,
    compressed INTEGER NOT NULL DEFAULT 0,
    chunked INTEGER NOT NULL DEFAULT 0,
    chunk_count INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create the backup schedules table.
pub const CREATE_BACKUP_SCHEDULES: &str = r#"
CREATE TABLE IF NOT EXISTS backup_schedules (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    frequency TEXT NOT NULL,
    time_of_day TEXT NOT NULL,
    retention_days INTEGER NOT NULL,
    include_deleted INTEGER NOT NULL DEFAULT 0,
    compress INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create backup indexes.
pub const CREATE_BACKUP_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_backups_user_created ON backups(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_schedules_user ON backup_schedules(user_id)
"#;

/// SQL to create the per-user settings table.
pub const CREATE_USER_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS user_email_settings (
    user_id TEXT NOT NULL PRIMARY KEY,
    settings TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Returns all schema creation statements in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_FOLDERS,
        CREATE_EMAILS,
        CREATE_EMAIL_INDEXES,
        CREATE_LABELS,
        CREATE_EMAIL_LABELS,
        CREATE_ATTACHMENTS,
        CREATE_ATTACHMENT_INDEXES,
        CREATE_EMAIL_ACTIVITY,
        CREATE_BUSINESS_EMAIL_LOGS,
        CREATE_ACTIVITY_INDEXES,
        CREATE_BUSINESS_DOCUMENTS,
        CREATE_PROVIDER_CONFIGS,
        CREATE_PROVIDER_INDEXES,
        CREATE_SYNC_HISTORY,
        CREATE_WEBHOOK_SUBSCRIPTIONS,
        CREATE_BACKUPS,
        CREATE_BACKUP_SCHEDULES,
        CREATE_BACKUP_INDEXES,
        CREATE_USER_SETTINGS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_migrations_returns_statements() {
        let migrations = all_migrations();
        assert_eq!(migrations.len(), 19);
    }

    #[test]
    fn every_table_is_user_scoped() {
        for migration in all_migrations() {
            if migration.contains("CREATE TABLE") {
                assert!(migration.contains("user_id TEXT NOT NULL"), "{migration}");
            }
        }
    }

    #[test]
    fn emails_reference_user_folders() {
        assert!(CREATE_EMAILS.contains("REFERENCES email_folders(user_id, id)"));
    }

    #[test]
    fn single_default_provider_is_enforced() {
        assert!(CREATE_PROVIDER_INDEXES.contains("UNIQUE INDEX"));
        assert!(CREATE_PROVIDER_INDEXES.contains("WHERE is_default = 1"));
    }

    #[test]
    fn indexes_use_if_not_exists() {
        assert!(CREATE_EMAIL_INDEXES.contains("IF NOT EXISTS"));
        assert!(CREATE_BACKUP_INDEXES.contains("IF NOT EXISTS"));
    }
}
