//! SQLite handle shared by every store and query module.
//!
//! One connection behind a `tokio` mutex. Closures run on the blocking pool,
//! so query modules stay synchronous rusqlite code.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::schema;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

enum Location {
    Memory,
    File(PathBuf),
}

/// Cloneable handle to the engine database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates the database file and brings its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(Location::File(path.as_ref().to_path_buf())).await
    }

    /// A private in-memory database, used by tests and ephemeral engines.
    pub async fn open_in_memory() -> Result<Self> {
        Self::connect(Location::Memory).await
    }

    async fn connect(location: Location) -> Result<Self> {
        let conn = run_blocking(move || {
            let conn = match &location {
                Location::Memory => Connection::open_in_memory()?,
                Location::File(path) => {
                    let conn = Connection::open(path)?;
                    conn.busy_timeout(BUSY_TIMEOUT)?;
                    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                    conn
                }
            };
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        run_blocking(move || f(&conn.blocking_lock())).await
    }

    /// Runs `f` inside a transaction, committed only when `f` succeeds.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        run_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    /// Number of schema steps applied to this database.
    pub async fn schema_version(&self) -> Result<u32> {
        self.with_conn(|conn| Ok(user_version(conn)?)).await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

fn user_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Applies the schema steps past `user_version` in one transaction.
fn migrate(conn: &Connection) -> Result<()> {
    let steps = schema::all_migrations();
    let current = user_version(conn)? as usize;
    if current > steps.len() {
        return Err(DatabaseError::MigrationFailed(format!(
            "database schema version {current} is newer than this build ({})",
            steps.len()
        )));
    }
    if current == steps.len() {
        debug!(version = current, "Schema up to date");
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for (index, step) in steps.iter().enumerate().skip(current) {
        tx.execute_batch(step)
            .map_err(|e| DatabaseError::MigrationFailed(format!("step {}: {e}", index + 1)))?;
    }
    tx.pragma_update(None, "user_version", steps.len() as u32)?;
    tx.commit()?;
    info!(from = current, to = steps.len(), "Migrated schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn count_settings(db: &Database, user: &'static str) -> i64 {
        db.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM user_email_settings WHERE user_id = ?",
                [user],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }

    fn insert_settings(tx: &rusqlite::Transaction<'_>, user: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO user_email_settings (user_id, settings, updated_at) VALUES (?, '{}', ?)",
            [user, "2025-01-01T00:00:00Z"],
        )?;
        Ok(())
    }

    #[tokio::test]
    async fn new_database_is_at_the_latest_version() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(
            db.schema_version().await.unwrap() as usize,
            schema::all_migrations().len()
        );
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        db.transaction(|tx| insert_settings(tx, "kept")).await.unwrap();
        let result: Result<()> = db
            .transaction(|tx| {
                insert_settings(tx, "dropped")?;
                Err(DatabaseError::MigrationFailed("intentional".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count_settings(&db, "kept").await, 1);
        assert_eq!(count_settings(&db, "dropped").await, 0);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().await.unwrap();

        let result = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO email_labels (email_id, label_id, user_id, created_at)
                     VALUES (?, ?, ?, ?)",
                    ["missing-email", "missing-label", "user-1", "2025-01-01T00:00:00Z"],
                )?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));
    }

    #[tokio::test]
    async fn reopening_skips_applied_steps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.db");

        {
            let db = Database::open(&path).await.unwrap();
            db.transaction(|tx| insert_settings(tx, "disk-user")).await.unwrap();
        }

        let db = Database::open(&path).await.unwrap();
        assert_eq!(count_settings(&db, "disk-user").await, 1);
        assert_eq!(
            db.schema_version().await.unwrap() as usize,
            schema::all_migrations().len()
        );
    }

    #[tokio::test]
    async fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 999).unwrap();
        }

        assert!(matches!(
            Database::open(&path).await,
            Err(DatabaseError::MigrationFailed(_))
        ));
    }
}
