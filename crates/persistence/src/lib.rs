//! SQLite storage for completed walk-forward backtest runs

pub mod repository;
pub mod schema;

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Cannot create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Pooled handle to the run store
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the run store at `path`.
    ///
    /// Every pooled connection runs in WAL mode with `synchronous=NORMAL`,
    /// foreign keys on and a busy timeout, so the server and a CLI run can
    /// share one file.
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        Self::open(SqlitePoolOptions::new().max_connections(5), options).await
    }

    /// Private in-memory store (for tests). A single connection keeps the data alive.
    pub async fn in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DbError::Connection(e.to_string()))?
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);

        Self::open(SqlitePoolOptions::new().max_connections(1), options).await
    }

    async fn open(pool_options: SqlitePoolOptions, options: SqliteConnectOptions) -> DbResult<Self> {
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Bring the schema up to [`schema::SCHEMA_VERSION`], tracked in `PRAGMA user_version`
    async fn migrate(&self) -> DbResult<()> {
        let found: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if found > schema::SCHEMA_VERSION {
            return Err(DbError::SchemaTooNew {
                found,
                supported: schema::SCHEMA_VERSION,
            });
        }
        if found == schema::SCHEMA_VERSION {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(schema::CREATE_TABLES)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        sqlx::query(&format!("PRAGMA user_version = {}", schema::SCHEMA_VERSION))
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        tx.commit().await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn user_version(db: &Database) -> i64 {
        sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_is_migrated() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(user_version(&db).await, schema::SCHEMA_VERSION);

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'backtest_runs'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }

    #[tokio::test]
    async fn test_file_store_creates_dir_and_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("runs.db");

        let db = Database::new(&path).await.unwrap();
        assert!(path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode, "wal");
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(fk, 1);
        db.pool().close().await;

        // Reopening an up-to-date store is a no-op
        let db = Database::new(&path).await.unwrap();
        assert_eq!(user_version(&db).await, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");

        let db = Database::new(&path).await.unwrap();
        sqlx::query("PRAGMA user_version = 99")
            .execute(db.pool())
            .await
            .unwrap();
        db.pool().close().await;

        let err = Database::new(&path).await.err().unwrap();
        assert!(
            matches!(err, DbError::SchemaTooNew { found: 99, .. }),
            "{err}"
        );
    }
}
