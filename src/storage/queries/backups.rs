//! Backup records and backup schedules.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{from_sql_opt_ts, from_sql_ts, to_sql_ts};
use crate::domain::{
    Backup, BackupFrequency, BackupId, BackupSchedule, BackupType, ScheduleId, UserId,
};
use crate::storage::database::{Database, Result};

const BACKUP_COLUMNS: &str = r#"
    id, user_id, backup_type, storage_path, email_count, size_bytes,
    encrypted, compressed, chunked, chunk_count, metadata, created_at
"#;

const SCHEDULE_COLUMNS: &str = r#"
    id, user_id, frequency, time_of_day, retention_days, include_deleted,
    compress, enabled, last_run_at, next_run_at, created_at, updated_at
"#;

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

/// Records a completed backup.
pub async fn insert(db: &Database, backup: &Backup) -> Result<()> {
    let b = backup.clone();

    db.with_conn(move |conn| {
        let metadata = serde_json::to_string(&b.metadata)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let sql = format!(
            "INSERT INTO backups ({BACKUP_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        conn.execute(
            &sql,
            params![
                b.id.0,
                b.user_id.0,
                b.backup_type.as_str(),
                b.storage_path,
                b.email_count as i64,
                b.size_bytes as i64,
                b.encrypted as i32,
                b.compressed as i32,
                b.chunked as i32,
                b.chunk_count,
                metadata,
                to_sql_ts(&b.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a backup record.
pub async fn get(db: &Database, user_id: &UserId, id: &BackupId) -> Result<Option<Backup>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE user_id = ?1 AND id = ?2");
        let backup = conn
            .query_row(&sql, params![user_id.0, id.0], row_to_backup)
            .optional()?;
        Ok(backup)
    })
    .await
}

/// Lists a user's backups, newest first.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<Backup>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE user_id = ?1 ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user_id.0], row_to_backup)?;
        let backups: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(backups?)
    })
    .await
}

/// Backups created strictly before `cutoff`, oldest first.
pub async fn list_created_before(
    db: &Database,
    user_id: &UserId,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Backup>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {BACKUP_COLUMNS} FROM backups WHERE user_id = ?1 AND created_at < ?2
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, to_sql_ts(&cutoff)], row_to_backup)?;
        let backups: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(backups?)
    })
    .await
}

/// Deletes a backup record. Returns rows removed.
pub async fn delete(db: &Database, user_id: &UserId, id: &BackupId) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM backups WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, id.0],
        )?;
        Ok(removed)
    })
    .await
}

fn row_to_backup(row: &Row<'_>) -> std::result::Result<Backup, rusqlite::Error> {
    let backup_type: String = row.get(2)?;
    let metadata: String = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(Backup {
        id: BackupId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        backup_type: BackupType::parse(&backup_type)
            .ok_or_else(|| conversion_error(2, format!("unknown backup type: {backup_type}")))?,
        storage_path: row.get(3)?,
        email_count: row.get::<_, i64>(4)? as u64,
        size_bytes: row.get::<_, i64>(5)? as u64,
        encrypted: row.get::<_, i32>(6)? != 0,
        compressed: row.get::<_, i32>(7)? != 0,
        chunked: row.get::<_, i32>(8)? != 0,
        chunk_count: row.get(9)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| conversion_error(10, e.to_string()))?,
        created_at: from_sql_ts(&created_at),
    })
}

// ============================================================================
// Schedules
// ============================================================================

/// Inserts or replaces a schedule.
pub async fn upsert_schedule(db: &Database, schedule: &BackupSchedule) -> Result<()> {
    let s = schedule.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "INSERT OR REPLACE INTO backup_schedules ({SCHEDULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        );
        conn.execute(
            &sql,
            params![
                s.id.0,
                s.user_id.0,
                s.frequency.as_str(),
                s.time_of_day,
                s.retention_days,
                s.include_deleted as i32,
                s.compress as i32,
                s.enabled as i32,
                s.last_run_at.as_ref().map(to_sql_ts),
                s.next_run_at.as_ref().map(to_sql_ts),
                to_sql_ts(&s.created_at),
                to_sql_ts(&s.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a schedule.
pub async fn get_schedule(
    db: &Database,
    user_id: &UserId,
    id: &ScheduleId,
) -> Result<Option<BackupSchedule>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE user_id = ?1 AND id = ?2"
        );
        let schedule = conn
            .query_row(&sql, params![user_id.0, id.0], row_to_schedule)
            .optional()?;
        Ok(schedule)
    })
    .await
}

/// Lists a user's schedules.
pub async fn list_schedules(db: &Database, user_id: &UserId) -> Result<Vec<BackupSchedule>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE user_id = ?1 ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user_id.0], row_to_schedule)?;
        let schedules: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(schedules?)
    })
    .await
}

/// Enabled schedules across users, for the scheduler on startup.
pub async fn list_enabled_schedules(db: &Database) -> Result<Vec<BackupSchedule>> {
    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE enabled = 1 ORDER BY next_run_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_schedule)?;
        let schedules: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(schedules?)
    })
    .await
}

/// Disables a schedule. Unknown ids change nothing.
pub async fn disable_schedule(db: &Database, user_id: &UserId, id: &ScheduleId) -> Result<usize> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE backup_schedules SET enabled = 0, next_run_at = NULL, updated_at = ?1
            WHERE user_id = ?2 AND id = ?3
            "#,
            params![to_sql_ts(&Utc::now()), user_id.0, id.0],
        )?;
        Ok(changed)
    })
    .await
}

/// Records a run and the next due time.
pub async fn record_schedule_run(
    db: &Database,
    id: &ScheduleId,
    ran_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
) -> Result<()> {
    let id = id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            UPDATE backup_schedules SET last_run_at = ?1, next_run_at = ?2, updated_at = ?1
            WHERE id = ?3
            "#,
            params![to_sql_ts(&ran_at), to_sql_ts(&next_run_at), id.0],
        )?;
        Ok(())
    })
    .await
}

fn row_to_schedule(row: &Row<'_>) -> std::result::Result<BackupSchedule, rusqlite::Error> {
    let frequency: String = row.get(2)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(BackupSchedule {
        id: ScheduleId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        frequency: BackupFrequency::parse(&frequency)
            .ok_or_else(|| conversion_error(2, format!("unknown frequency: {frequency}")))?,
        time_of_day: row.get(3)?,
        retention_days: row.get(4)?,
        include_deleted: row.get::<_, i32>(5)? != 0,
        compress: row.get::<_, i32>(6)? != 0,
        enabled: row.get::<_, i32>(7)? != 0,
        last_run_at: from_sql_opt_ts(row.get(8)?),
        next_run_at: from_sql_opt_ts(row.get(9)?),
        created_at: from_sql_ts(&created_at),
        updated_at: from_sql_ts(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackupMetadata, BackupScope, BACKUP_FORMAT_VERSION};
    use chrono::Duration;

    fn make_backup(id: &str, created_at: DateTime<Utc>) -> Backup {
        Backup {
            id: BackupId::from(id),
            user_id: UserId::from("user-1"),
            backup_type: BackupType::Full,
            storage_path: format!("backups/user-1/{id}"),
            email_count: 3,
            size_bytes: 1024,
            encrypted: true,
            compressed: true,
            chunked: false,
            chunk_count: 1,
            metadata: BackupMetadata {
                version: BACKUP_FORMAT_VERSION.to_string(),
                scope: BackupScope::Full,
                folders: vec![],
                batch_size: 1000,
                include_deleted: false,
            },
            created_at,
        }
    }

    #[tokio::test]
    async fn backup_metadata_survives_storage() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        let backup = make_backup("b-1", Utc::now());
        insert(&db, &backup).await.unwrap();

        let stored = get(&db, &user, &backup.id).await.unwrap().unwrap();
        assert_eq!(stored.metadata, backup.metadata);
        assert!(stored.encrypted);
    }

    #[tokio::test]
    async fn lists_backups_older_than_cutoff() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        insert(&db, &make_backup("old", Utc::now() - Duration::days(40))).await.unwrap();
        insert(&db, &make_backup("new", Utc::now())).await.unwrap();

        let old = list_created_before(&db, &user, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, BackupId::from("old"));
        assert_eq!(list(&db, &user).await.unwrap()[0].id, BackupId::from("new"));
    }

    #[tokio::test]
    async fn disabling_unknown_schedule_changes_nothing() {
        let db = Database::open_in_memory().await.unwrap();
        let changed = disable_schedule(&db, &UserId::from("user-1"), &ScheduleId::from("nope"))
            .await
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn enabled_schedules_only() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();
        for (id, enabled) in [("s-1", true), ("s-2", false)] {
            upsert_schedule(
                &db,
                &BackupSchedule {
                    id: ScheduleId::from(id),
                    user_id: UserId::from("user-1"),
                    frequency: BackupFrequency::Daily,
                    time_of_day: "02:00".to_string(),
                    retention_days: 30,
                    include_deleted: false,
                    compress: true,
                    enabled,
                    last_run_at: None,
                    next_run_at: Some(now),
                    created_at: now,
                    updated_at: now,
                },
            )
            .await
            .unwrap();
        }

        let enabled = list_enabled_schedules(&db).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].frequency, BackupFrequency::Daily);
    }
}
