//! Folder CRUD operations.
//!
//! Folder counts are derived from the emails table at read time.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{from_sql_opt_ts, from_sql_ts, to_sql_ts};
use crate::domain::{system_folders, Folder, FolderId, FolderUpdate, UserId};
use crate::storage::database::{Database, Result};

const FOLDER_SELECT: &str = r#"
    SELECT
        f.id, f.user_id, f.name, f.icon, f.color, f.parent_id, f.is_system,
        f.created_at, f.updated_at,
        (SELECT COUNT(*) FROM emails e
            WHERE e.user_id = f.user_id AND e.folder_id = f.id AND e.deleted_at IS NULL),
        (SELECT COUNT(*) FROM emails e
            WHERE e.user_id = f.user_id AND e.folder_id = f.id AND e.deleted_at IS NULL
            AND e.is_read = 0)
    FROM email_folders f
"#;

/// Per-folder aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStats {
    pub folder_id: FolderId,
    pub total: u64,
    pub unread: u64,
    pub starred: u64,
    pub deleted: u64,
    pub latest: Option<DateTime<Utc>>,
}

/// Creates the system folders for a user if they are missing.
pub fn ensure_system_in(conn: &Connection, user_id: &UserId) -> rusqlite::Result<()> {
    let now = to_sql_ts(&Utc::now());
    let mut stmt = conn.prepare(
        r#"
        INSERT OR IGNORE INTO email_folders
            (user_id, id, name, icon, color, parent_id, is_system, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, NULL, NULL, 1, ?5, ?5)
        "#,
    )?;
    for (id, name, icon) in system_folders::ALL {
        stmt.execute(params![user_id.0, id, name, icon, now])?;
    }
    Ok(())
}

/// Creates the system folders for a user if they are missing.
pub async fn ensure_system(db: &Database, user_id: &UserId) -> Result<()> {
    let user_id = user_id.clone();
    db.with_conn(move |conn| Ok(ensure_system_in(conn, &user_id)?))
        .await
}

/// Inserts a folder on a borrowed connection.
pub fn insert_in(conn: &Connection, folder: &Folder) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO email_folders
            (user_id, id, name, icon, color, parent_id, is_system, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            folder.user_id.0,
            folder.id.0,
            folder.name,
            folder.icon,
            folder.color,
            folder.parent_id.as_ref().map(|p| &p.0),
            folder.is_system as i32,
            to_sql_ts(&folder.created_at),
            to_sql_ts(&folder.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts a new folder.
pub async fn insert(db: &Database, folder: &Folder) -> Result<()> {
    let folder = folder.clone();
    db.with_conn(move |conn| Ok(insert_in(conn, &folder)?)).await
}

/// Returns true if the folder exists for the user.
pub fn exists_in(
    conn: &Connection,
    user_id: &UserId,
    folder_id: &FolderId,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM email_folders WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, folder_id.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Retrieves a folder with its derived counts.
pub async fn get(db: &Database, user_id: &UserId, folder_id: &FolderId) -> Result<Option<Folder>> {
    let user_id = user_id.clone();
    let folder_id = folder_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{FOLDER_SELECT} WHERE f.user_id = ?1 AND f.id = ?2");
        let folder = conn
            .query_row(&sql, params![user_id.0, folder_id.0], row_to_folder)
            .optional()?;
        Ok(folder)
    })
    .await
}

/// Lists all folders for a user, system folders first.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<Folder>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("{FOLDER_SELECT} WHERE f.user_id = ?1 ORDER BY f.is_system DESC, f.name");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user_id.0], row_to_folder)?;
        let folders: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(folders?)
    })
    .await
}

/// Applies a partial update. Returns the number of rows changed.
pub async fn update(
    db: &Database,
    user_id: &UserId,
    folder_id: &FolderId,
    update: &FolderUpdate,
) -> Result<usize> {
    let user_id = user_id.clone();
    let folder_id = folder_id.clone();
    let update = update.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE email_folders SET
                name = COALESCE(?1, name),
                icon = COALESCE(?2, icon),
                color = COALESCE(?3, color),
                updated_at = ?4
            WHERE user_id = ?5 AND id = ?6
            "#,
            params![
                update.name,
                update.icon,
                update.color,
                to_sql_ts(&Utc::now()),
                user_id.0,
                folder_id.0,
            ],
        )?;
        Ok(changed)
    })
    .await
}

/// Deletes a folder after moving its emails (live and deleted) into `target`.
///
/// Returns the number of emails moved.
pub async fn delete_moving_emails(
    db: &Database,
    user_id: &UserId,
    folder_id: &FolderId,
    target: &FolderId,
) -> Result<usize> {
    let user_id = user_id.clone();
    let folder_id = folder_id.clone();
    let target = target.clone();

    db.transaction(move |tx| {
        let moved = tx.execute(
            "UPDATE emails SET folder_id = ?1, updated_at = ?2
             WHERE user_id = ?3 AND folder_id = ?4",
            params![target.0, to_sql_ts(&Utc::now()), user_id.0, folder_id.0],
        )?;
        tx.execute(
            "UPDATE email_folders SET parent_id = NULL WHERE user_id = ?1 AND parent_id = ?2",
            params![user_id.0, folder_id.0],
        )?;
        tx.execute(
            "DELETE FROM email_folders WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, folder_id.0],
        )?;
        Ok(moved)
    })
    .await
}

/// Aggregate counts for one folder.
pub async fn stats(db: &Database, user_id: &UserId, folder_id: &FolderId) -> Result<FolderStats> {
    let user_id = user_id.clone();
    let folder_id = folder_id.clone();

    db.with_conn(move |conn| {
        let (total, unread, starred, deleted, latest): (i64, i64, i64, i64, Option<String>) = conn
            .query_row(
                r#"
                SELECT
                    COALESCE(SUM(CASE WHEN deleted_at IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(
                        SUM(CASE WHEN deleted_at IS NULL AND is_read = 0 THEN 1 ELSE 0 END),
                        0
                    ),
                    COALESCE(
                        SUM(CASE WHEN deleted_at IS NULL AND is_starred = 1 THEN 1 ELSE 0 END),
                        0
                    ),
                    COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                    MAX(COALESCE(received_at, sent_at, created_at))
                FROM emails
                WHERE user_id = ?1 AND folder_id = ?2
                "#,
                params![user_id.0, folder_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )?;

        Ok(FolderStats {
            folder_id,
            total: total as u64,
            unread: unread as u64,
            starred: starred as u64,
            deleted: deleted as u64,
            latest: from_sql_opt_ts(latest),
        })
    })
    .await
}

fn row_to_folder(row: &Row<'_>) -> std::result::Result<Folder, rusqlite::Error> {
    let parent_id: Option<String> = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(Folder {
        id: FolderId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        name: row.get(2)?,
        icon: row.get(3)?,
        color: row.get(4)?,
        parent_id: parent_id.map(FolderId),
        is_system: row.get::<_, i32>(6)? != 0,
        created_at: from_sql_ts(&created_at),
        updated_at: from_sql_ts(&updated_at),
        total_count: row.get::<_, i64>(9)? as u64,
        unread_count: row.get::<_, i64>(10)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_folder(user: &str, id: &str, name: &str) -> Folder {
        let now = Utc::now();
        Folder {
            id: FolderId::from(id),
            user_id: UserId::from(user),
            name: name.to_string(),
            icon: None,
            color: Some("#336699".to_string()),
            parent_id: None,
            is_system: false,
            total_count: 0,
            unread_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn system_folders_are_provisioned_once() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");

        ensure_system(&db, &user).await.unwrap();
        ensure_system(&db, &user).await.unwrap();

        let folders = list(&db, &user).await.unwrap();
        assert_eq!(folders.len(), 6);
        assert!(folders.iter().all(|f| f.is_system));
    }

    #[tokio::test]
    async fn folders_are_scoped_per_user() {
        let db = Database::open_in_memory().await.unwrap();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        ensure_system(&db, &alice).await.unwrap();
        insert(&db, &custom_folder("alice", "clients", "Clients"))
            .await
            .unwrap();

        assert_eq!(list(&db, &alice).await.unwrap().len(), 7);
        assert!(list(&db, &bob).await.unwrap().is_empty());
        assert!(get(&db, &bob, &FolderId::from("clients"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_changes_only_given_fields() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        insert(&db, &custom_folder("user-1", "clients", "Clients"))
            .await
            .unwrap();

        let changed = update(
            &db,
            &user,
            &FolderId::from("clients"),
            &FolderUpdate {
                name: Some("Key clients".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(changed, 1);

        let folder = get(&db, &user, &FolderId::from("clients"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(folder.name, "Key clients");
        assert_eq!(folder.color.as_deref(), Some("#336699"));
    }

    #[tokio::test]
    async fn empty_folder_stats() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        ensure_system(&db, &user).await.unwrap();

        let stats = stats(&db, &user, &system_folders::inbox()).await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.latest, None);
    }
}
