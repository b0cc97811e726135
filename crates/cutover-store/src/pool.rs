//! Database connection pool and schema migration
//!
//! Wraps SQLx's SqlitePool with:
//! - Automatic directory creation for database files
//! - WAL journal mode for concurrent reads
//! - Versioned, forward-only schema migrations applied transactionally
//! - In-memory mode for testing

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::StoreError;

/// The migration chain, ordered by version
///
/// Versions are monotonically increasing; each entry is applied inside a
/// transaction that also bumps the `schema_version` row, so a crash mid-way
/// leaves the prior version intact.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, include_str!("migrations/0001_initial.sql")),
    (2, include_str!("migrations/0002_lookup_indexes.sql")),
];

/// Manages a pool of SQLite connections for service state persistence
///
/// The pool is configured with:
/// - WAL journal mode so readers proceed while the single writer commits
/// - 5 max connections for file-based databases
/// - 1 connection for in-memory databases (required for data persistence)
/// - 5-second busy timeout to absorb write contention
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if necessary) the database at `db_path` and migrates it
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection cannot be
    /// established, or `StoreError::MigrationFailed` if a pending migration
    /// fails; in the latter case the database stays at its prior version.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!(
                    "Failed to connect to database at {}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        Self::migrate(&pool).await?;

        tracing::info!(path = %db_path.display(), "Database pool initialized");

        Ok(Self { pool })
    }

    /// Creates an in-memory database pool for testing
    ///
    /// Uses a single connection to ensure data persistence across queries
    /// (SQLite in-memory databases are per-connection).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                StoreError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        Self::migrate(&pool).await?;

        tracing::debug!("In-memory database pool initialized");

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current persisted schema version
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        Self::current_version(&self.pool).await
    }

    async fn current_version(pool: &SqlitePool) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
            .fetch_one(pool)
            .await?;
        Ok(row.get::<i64, _>("version"))
    }

    /// Applies every migration newer than the persisted version
    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version)
                 SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
        )
        .execute(pool)
        .await
        .map_err(|e| StoreError::MigrationFailed {
            version: 0,
            message: format!("Failed to initialize schema_version: {}", e),
        })?;

        let current = Self::current_version(pool).await?;

        for &(version, sql) in MIGRATIONS {
            if version <= current {
                continue;
            }

            let mut tx = pool.begin().await.map_err(|e| StoreError::MigrationFailed {
                version,
                message: format!("Failed to begin transaction: {}", e),
            })?;

            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    message: e.to_string(),
                })?;

            sqlx::query("UPDATE schema_version SET version = ?")
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    message: format!("Failed to bump schema version: {}", e),
                })?;

            tx.commit().await.map_err(|e| StoreError::MigrationFailed {
                version,
                message: format!("Failed to commit: {}", e),
            })?;

            tracing::info!(version, "Applied schema migration");
        }

        Ok(())
    }
}
