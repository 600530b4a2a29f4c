//! Per-user settings documents, stored as JSON.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::to_sql_ts;
use crate::domain::UserId;
use crate::storage::database::{Database, Result};

/// Returns the raw settings JSON for a user.
pub async fn get(db: &Database, user_id: &UserId) -> Result<Option<serde_json::Value>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let raw: Option<String> = conn
            .query_row(
                "SELECT settings FROM user_email_settings WHERE user_id = ?1",
                [&user_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    })
    .await
}

/// Writes the settings JSON for a user.
pub async fn upsert(db: &Database, user_id: &UserId, settings: &serde_json::Value) -> Result<()> {
    let user_id = user_id.clone();
    let json = settings.to_string();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO user_email_settings (user_id, settings, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE
            SET settings = excluded.settings, updated_at = excluded.updated_at
            "#,
            params![user_id.0, json, to_sql_ts(&Utc::now())],
        )?;
        Ok(())
    })
    .await
}

/// Deletes a user's settings. Returns rows removed.
pub async fn delete(db: &Database, user_id: &UserId) -> Result<usize> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM user_email_settings WHERE user_id = ?1",
            [&user_id.0],
        )?;
        Ok(removed)
    })
    .await
}
