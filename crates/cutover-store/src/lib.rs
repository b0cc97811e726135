//! Cutover Store - transactional state persistence
//!
//! SQLite-backed storage for:
//! - User profiles and classifications (with history and overrides)
//! - Backup operations and per-user migration state
//! - Cloud status, sync operations and sync errors
//! - Quota snapshots, warnings and escalations
//!
//! Schema versions are monotonically increasing; `DatabasePool` applies
//! pending migrations transactionally on open.

pub mod pool;
pub mod repository;

pub use pool::DatabasePool;
pub use repository::StateStore;

use thiserror::Error;

/// Errors raised by the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// A schema migration failed; the prior version is left intact
    #[error("Schema migration to version {version} failed: {message}")]
    MigrationFailed {
        /// Target version of the failed migration
        version: i64,
        /// Underlying failure
        message: String,
    },

    /// A persisted value could not be mapped back to its domain type
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A uniqueness constraint was violated
    ///
    /// Callers may translate this into an idempotent no-op.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other database failure
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let is_unique = err
            .as_database_error()
            .is_some_and(|db| db.kind() == sqlx::error::ErrorKind::UniqueViolation);
        if is_unique {
            StoreError::Conflict(err.to_string())
        } else {
            StoreError::Database(err)
        }
    }
}

impl From<cutover_core::errors::DomainError> for StoreError {
    fn from(err: cutover_core::errors::DomainError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<StoreError> for cutover_core::ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => cutover_core::ServiceError::Conflict(msg),
            StoreError::MigrationFailed { .. } => {
                cutover_core::ServiceError::Fatal(err.to_string())
            }
            other => cutover_core::ServiceError::Store(other.to_string()),
        }
    }
}
