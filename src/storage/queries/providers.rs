//! Provider connection and webhook subscription rows.
//!
//! `encrypted_credentials` is always a vault-sealed blob; nothing in this
//! module sees plaintext credentials.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{from_sql_opt_ts, from_sql_ts, to_sql_ts};
use crate::domain::{ProviderConfig, ProviderId, ProviderKind, UserId, WebhookSubscription};
use crate::storage::database::{Database, Result};

const PROVIDER_COLUMNS: &str = r#"
    id, user_id, provider_type, email, display_name, encrypted_credentials,
    is_active, is_default, sync_token, last_synced_at, created_at, updated_at
"#;

/// Fields of a provider connection that can be changed after creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderUpdate {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub encrypted_credentials: Option<String>,
    pub is_active: Option<bool>,
}

/// Inserts a provider connection.
///
/// Fails on a duplicate `(user, type, email)` or on a second default.
pub async fn insert(db: &Database, config: &ProviderConfig) -> Result<()> {
    let c = config.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "INSERT INTO provider_configs ({PROVIDER_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        conn.execute(
            &sql,
            params![
                c.id.0,
                c.user_id.0,
                c.kind.as_str(),
                c.email,
                c.display_name,
                c.encrypted_credentials,
                c.is_active as i32,
                c.is_default as i32,
                c.sync_token,
                c.last_synced_at.as_ref().map(to_sql_ts),
                to_sql_ts(&c.created_at),
                to_sql_ts(&c.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a provider connection.
pub async fn get(
    db: &Database,
    user_id: &UserId,
    id: &ProviderId,
) -> Result<Option<ProviderConfig>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_configs WHERE user_id = ?1 AND id = ?2"
        );
        let config = conn
            .query_row(&sql, params![user_id.0, id.0], row_to_provider)
            .optional()?;
        Ok(config)
    })
    .await
}

/// Lists a user's connections, default first.
pub async fn list(
    db: &Database,
    user_id: &UserId,
    active_only: bool,
) -> Result<Vec<ProviderConfig>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            SELECT {PROVIDER_COLUMNS} FROM provider_configs
            WHERE user_id = ?1 AND (?2 = 0 OR is_active = 1)
            ORDER BY is_default DESC, created_at
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, active_only as i32], row_to_provider)?;
        let configs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(configs?)
    })
    .await
}

/// Every active connection across users, for background sync.
pub async fn list_all_active(db: &Database) -> Result<Vec<ProviderConfig>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_configs WHERE is_active = 1
             ORDER BY user_id, created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_provider)?;
        let configs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(configs?)
    })
    .await
}

/// The user's default connection, if any.
pub async fn get_default(db: &Database, user_id: &UserId) -> Result<Option<ProviderConfig>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {PROVIDER_COLUMNS} FROM provider_configs WHERE user_id = ?1 AND is_default = 1"
        );
        let config = conn
            .query_row(&sql, [&user_id.0], row_to_provider)
            .optional()?;
        Ok(config)
    })
    .await
}

/// Applies an update. Returns rows changed.
pub async fn update(
    db: &Database,
    user_id: &UserId,
    id: &ProviderId,
    update: &ProviderUpdate,
) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.clone();
    let update = update.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE provider_configs SET
                email = COALESCE(?7, email),
                display_name = COALESCE(?1, display_name),
                encrypted_credentials = COALESCE(?2, encrypted_credentials),
                is_active = COALESCE(?3, is_active),
                updated_at = ?4
            WHERE user_id = ?5 AND id = ?6
            "#,
            params![
                update.display_name,
                update.encrypted_credentials,
                update.is_active.map(|a| a as i32),
                to_sql_ts(&Utc::now()),
                user_id.0,
                id.0,
                update.email,
            ],
        )?;
        Ok(changed)
    })
    .await
}

/// Makes `id` the user's only default. Returns false if it does not exist.
pub async fn set_default(db: &Database, user_id: &UserId, id: &ProviderId) -> Result<bool> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.transaction(move |tx| {
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM provider_configs WHERE user_id = ?1 AND id = ?2",
                params![user_id.0, id.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }
        tx.execute(
            "UPDATE provider_configs SET is_default = 0 WHERE user_id = ?1 AND is_default = 1",
            [&user_id.0],
        )?;
        tx.execute(
            "UPDATE provider_configs SET is_default = 1, updated_at = ?1
             WHERE user_id = ?2 AND id = ?3",
            params![to_sql_ts(&Utc::now()), user_id.0, id.0],
        )?;
        Ok(true)
    })
    .await
}

/// Deletes a connection. If it was the default, the oldest remaining
/// connection becomes default. Returns rows removed.
pub async fn delete(db: &Database, user_id: &UserId, id: &ProviderId) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.transaction(move |tx| {
        let removed = tx.execute(
            "DELETE FROM provider_configs WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, id.0],
        )?;
        let has_default: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM provider_configs WHERE user_id = ?1 AND is_default = 1",
                [&user_id.0],
                |row| row.get(0),
            )
            .optional()?;
        if removed > 0 && has_default.is_none() {
            tx.execute(
                r#"
                UPDATE provider_configs SET is_default = 1
                WHERE id = (
                    SELECT id FROM provider_configs WHERE user_id = ?1 ORDER BY created_at LIMIT 1
                )
                "#,
                [&user_id.0],
            )?;
        }
        Ok(removed)
    })
    .await
}

/// Stores the sync cursor after a successful sync.
pub async fn update_sync_state(
    db: &Database,
    user_id: &UserId,
    id: &ProviderId,
    sync_token: Option<String>,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            UPDATE provider_configs SET sync_token = ?1, last_synced_at = ?2, updated_at = ?2
            WHERE user_id = ?3 AND id = ?4
            "#,
            params![sync_token, to_sql_ts(&synced_at), user_id.0, id.0],
        )?;
        Ok(())
    })
    .await
}

fn row_to_provider(row: &Row<'_>) -> std::result::Result<ProviderConfig, rusqlite::Error> {
    let kind: String = row.get(2)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    let kind = ProviderKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown provider type: {kind}").into(),
        )
    })?;

    Ok(ProviderConfig {
        id: ProviderId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        kind,
        email: row.get(3)?,
        display_name: row.get(4)?,
        encrypted_credentials: row.get(5)?,
        is_active: row.get::<_, i32>(6)? != 0,
        is_default: row.get::<_, i32>(7)? != 0,
        sync_token: row.get(8)?,
        last_synced_at: from_sql_opt_ts(row.get(9)?),
        created_at: from_sql_ts(&created_at),
        updated_at: from_sql_ts(&updated_at),
    })
}

// ============================================================================
// Webhook subscriptions
// ============================================================================

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, provider_id, provider_type, subscription_id, resource,
    client_state, expires_at, created_at
"#;

/// Stores a webhook subscription.
pub async fn insert_subscription(db: &Database, sub: &WebhookSubscription) -> Result<()> {
    let s = sub.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "INSERT INTO webhook_subscriptions ({SUBSCRIPTION_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        conn.execute(
            &sql,
            params![
                s.id,
                s.user_id.0,
                s.provider_id.0,
                s.kind.as_str(),
                s.subscription_id,
                s.resource,
                s.client_state,
                s.expires_at.as_ref().map(to_sql_ts),
                to_sql_ts(&s.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Subscriptions registered for a provider connection.
pub async fn list_subscriptions(
    db: &Database,
    user_id: &UserId,
    provider_id: &ProviderId,
) -> Result<Vec<WebhookSubscription>> {
    let user_id = user_id.clone();
    let provider_id = provider_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
             WHERE user_id = ?1 AND provider_id = ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, provider_id.0], row_to_subscription)?;
        let subs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(subs?)
    })
    .await
}

/// Looks up a subscription by the provider-side id, across users.
pub async fn find_subscription(
    db: &Database,
    subscription_id: &str,
) -> Result<Option<WebhookSubscription>> {
    let subscription_id = subscription_id.to_string();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM webhook_subscriptions
             WHERE subscription_id = ?1 LIMIT 1"
        );
        let sub = conn
            .query_row(&sql, [&subscription_id], row_to_subscription)
            .optional()?;
        Ok(sub)
    })
    .await
}

/// Removes a subscription. Returns rows removed.
pub async fn delete_subscription(db: &Database, user_id: &UserId, id: &str) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.to_string();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM webhook_subscriptions WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, id],
        )?;
        Ok(removed)
    })
    .await
}

fn row_to_subscription(row: &Row<'_>) -> std::result::Result<WebhookSubscription, rusqlite::Error> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(8)?;

    Ok(WebhookSubscription {
        id: row.get(0)?,
        user_id: UserId(row.get(1)?),
        provider_id: ProviderId(row.get(2)?),
        kind: ProviderKind::parse(&kind).unwrap_or(ProviderKind::Gmail),
        subscription_id: row.get(4)?,
        resource: row.get(5)?,
        client_state: row.get(6)?,
        expires_at: from_sql_opt_ts(row.get(7)?),
        created_at: from_sql_ts(&created_at),
    })
}
