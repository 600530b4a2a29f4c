//! Label CRUD operations and email/label links.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{from_sql_ts, to_sql_ts};
use crate::domain::{EmailId, Label, LabelId, UserId, DEFAULT_LABEL_COLOR};
use crate::storage::database::{Database, Result};

const LABEL_COLUMNS: &str = "id, user_id, name, color, created_at";

/// Inserts a new label.
pub async fn insert(db: &Database, label: &Label) -> Result<()> {
    let label = label.clone();

    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO labels (id, user_id, name, color, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                label.id.0,
                label.user_id.0,
                label.name,
                label.color,
                to_sql_ts(&label.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Finds a label by id, falling back to a case-insensitive name match.
pub fn find_in(
    conn: &Connection,
    user_id: &UserId,
    id_or_name: &str,
) -> rusqlite::Result<Option<Label>> {
    let sql = format!(
        r#"
        SELECT {LABEL_COLUMNS} FROM labels
        WHERE user_id = ?1 AND (id = ?2 OR name = ?2 COLLATE NOCASE)
        ORDER BY CASE WHEN id = ?2 THEN 0 ELSE 1 END
        LIMIT 1
        "#
    );
    conn.query_row(&sql, params![user_id.0, id_or_name], row_to_label)
        .optional()
}

/// Finds a label by id or name.
pub async fn find(db: &Database, user_id: &UserId, id_or_name: &str) -> Result<Option<Label>> {
    let user_id = user_id.clone();
    let key = id_or_name.to_string();
    db.with_conn(move |conn| Ok(find_in(conn, &user_id, &key)?))
        .await
}

/// Lists all labels for a user, ordered by name.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<Label>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {LABEL_COLUMNS} FROM labels WHERE user_id = ?1 ORDER BY name COLLATE NOCASE"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user_id.0], row_to_label)?;
        let labels: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(labels?)
    })
    .await
}

/// Renames or recolors a label. Returns the number of rows changed.
pub async fn update(
    db: &Database,
    user_id: &UserId,
    label_id: &LabelId,
    name: Option<String>,
    color: Option<String>,
) -> Result<usize> {
    let user_id = user_id.clone();
    let label_id = label_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE labels SET name = COALESCE(?1, name), color = COALESCE(?2, color)
            WHERE user_id = ?3 AND id = ?4
            "#,
            params![name, color, user_id.0, label_id.0],
        )?;
        Ok(changed)
    })
    .await
}

/// Deletes a label. Links to emails cascade.
pub async fn delete(db: &Database, user_id: &UserId, label_id: &LabelId) -> Result<usize> {
    let user_id = user_id.clone();
    let label_id = label_id.clone();

    db.with_conn(move |conn| {
        let deleted = conn.execute(
            "DELETE FROM labels WHERE user_id = ?1 AND id = ?2",
            params![user_id.0, label_id.0],
        )?;
        Ok(deleted)
    })
    .await
}

/// Returns the id of the named label, creating it with the default color.
pub fn ensure_named_in(
    conn: &Connection,
    user_id: &UserId,
    name: &str,
) -> rusqlite::Result<LabelId> {
    if let Some(label) = find_in(conn, user_id, name)? {
        return Ok(label.id);
    }
    let id = LabelId::generate();
    conn.execute(
        "INSERT INTO labels (id, user_id, name, color, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.0,
            user_id.0,
            name,
            DEFAULT_LABEL_COLOR,
            to_sql_ts(&Utc::now())
        ],
    )?;
    Ok(id)
}

/// Links a label to an email. Returns false if the link already existed.
pub fn attach_in(
    conn: &Connection,
    user_id: &UserId,
    email_id: &EmailId,
    label_id: &LabelId,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        r#"
        INSERT OR IGNORE INTO email_labels (email_id, label_id, user_id, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![email_id.0, label_id.0, user_id.0, to_sql_ts(&Utc::now())],
    )?;
    Ok(inserted > 0)
}

/// Links a label to an email. Returns false if the link already existed.
pub async fn attach(
    db: &Database,
    user_id: &UserId,
    email_id: &EmailId,
    label_id: &LabelId,
) -> Result<bool> {
    let user_id = user_id.clone();
    let email_id = email_id.clone();
    let label_id = label_id.clone();
    db.with_conn(move |conn| Ok(attach_in(conn, &user_id, &email_id, &label_id)?))
        .await
}

/// Removes a label link. Returns false if there was nothing to remove.
pub async fn detach(
    db: &Database,
    user_id: &UserId,
    email_id: &EmailId,
    label_id: &LabelId,
) -> Result<bool> {
    let user_id = user_id.clone();
    let email_id = email_id.clone();
    let label_id = label_id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM email_labels WHERE user_id = ?1 AND email_id = ?2 AND label_id = ?3",
            params![user_id.0, email_id.0, label_id.0],
        )?;
        Ok(removed > 0)
    })
    .await
}

/// Replaces an email's labels with the named set, creating labels as needed.
pub fn set_labels_in(
    conn: &Connection,
    user_id: &UserId,
    email_id: &EmailId,
    names: &[String],
) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM email_labels WHERE user_id = ?1 AND email_id = ?2",
        params![user_id.0, email_id.0],
    )?;
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let label_id = ensure_named_in(conn, user_id, name)?;
        attach_in(conn, user_id, email_id, &label_id)?;
    }
    Ok(())
}

fn row_to_label(row: &Row<'_>) -> std::result::Result<Label, rusqlite::Error> {
    let created_at: String = row.get(4)?;
    Ok(Label {
        id: LabelId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        name: row.get(2)?,
        color: row.get(3)?,
        created_at: from_sql_ts(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_label(id: &str, user: &str, name: &str) -> Label {
        Label {
            id: LabelId::from(id),
            user_id: UserId::from(user),
            name: name.to_string(),
            color: "#ff0000".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_find_by_id_or_name() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        insert(&db, &make_label("l-1", "user-1", "Urgent")).await.unwrap();

        assert!(find(&db, &user, "l-1").await.unwrap().is_some());
        let by_name = find(&db, &user, "urgent").await.unwrap().unwrap();
        assert_eq!(by_name.id, LabelId::from("l-1"));
        assert!(find(&db, &UserId::from("user-2"), "l-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_name_per_user_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        insert(&db, &make_label("l-1", "user-1", "Urgent")).await.unwrap();

        assert!(insert(&db, &make_label("l-2", "user-1", "Urgent")).await.is_err());
        insert(&db, &make_label("l-3", "user-2", "Urgent")).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_named_reuses_existing_label() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");

        let (first, second) = db
            .with_conn(move |conn| {
                let first = ensure_named_in(conn, &user, "Clients")?;
                let second = ensure_named_in(conn, &user, "clients")?;
                Ok((first, second))
            })
            .await
            .unwrap();
        assert_eq!(first, second);

        let labels = list(&db, &UserId::from("user-1")).await.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].color, DEFAULT_LABEL_COLOR);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let db = Database::open_in_memory().await.unwrap();
        let user = UserId::from("user-1");
        let id = LabelId::from("l-1");
        insert(&db, &make_label("l-1", "user-1", "Urgent")).await.unwrap();

        assert_eq!(
            update(&db, &user, &id, None, Some("#00ff00".into())).await.unwrap(),
            1
        );
        let label = find(&db, &user, "l-1").await.unwrap().unwrap();
        assert_eq!(label.name, "Urgent");
        assert_eq!(label.color, "#00ff00");

        assert_eq!(delete(&db, &user, &id).await.unwrap(), 1);
        assert_eq!(delete(&db, &user, &id).await.unwrap(), 0);
    }
}
