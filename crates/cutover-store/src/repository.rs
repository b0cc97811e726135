//! SQLite state store
//!
//! Concrete persistence for every domain entity. All domain enums are
//! stored as TEXT and parsed strictly on read; an unknown value surfaces
//! as `StoreError::Corrupt`, never a silent default.
//!
//! ## Type Mapping
//!
//! | Domain Type       | SQL Type | Strategy                                |
//! |-------------------|----------|-----------------------------------------|
//! | UserId            | TEXT     | raw string via `as_str()` / `UserId::new()` |
//! | UUID-backed ids   | TEXT     | UUID string via `to_string()` / `FromStr` |
//! | DateTime<Utc>     | TEXT     | ISO 8601 via `to_rfc3339()`             |
//! | enums             | TEXT     | `as_str()` / strict `parse()`           |
//! | bool              | INTEGER  | 0/1                                     |
//! | JSON details      | TEXT     | serde_json                              |

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use cutover_core::domain::{
    backup::{BackupCategory, BackupOperation, MigrationPhase, MigrationState, OperationStatus},
    classification::{
        Classification, ClassificationChange, ClassificationOverride, ClassificationRecord,
    },
    cloud::{
        CloudAccountInfo, CloudStatusSnapshot, KfmStatus, SyncError, SyncErrorCategory,
        SyncOperation, SyncStatus, SyncedFolder,
    },
    escalation::{Escalation, EscalationKind, EscalationPriority},
    newtypes::{EscalationId, OperationId, SyncOpId, UserId, WarningId},
    profile::{ProfileType, UserProfile},
    quota::{QuotaStatus, QuotaWarning, QuotaWarningType, WarningLevel},
};

use crate::StoreError;

/// SQLite-backed store owning all persisted service state
///
/// All operations go through a connection pool; SQLite serializes writers
/// while WAL mode lets readers proceed concurrently.
pub struct StateStore {
    pool: SqlitePool,
}

// ============================================================================
// Conversion helpers
// ============================================================================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("Failed to parse datetime '{}': {}", s, e)))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn parse_user_id(s: &str) -> Result<UserId, StoreError> {
    UserId::new(s).map_err(|e| StoreError::Corrupt(format!("Invalid user id '{}': {}", s, e)))
}

fn parse_json(s: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Corrupt(format!("Invalid JSON column: {}", e)))
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn profile_from_row(row: &SqliteRow) -> Result<UserProfile, StoreError> {
    Ok(UserProfile {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        user_name: row.get("user_name"),
        profile_path: row.get("profile_path"),
        profile_type: ProfileType::parse(&row.get::<String, _>("profile_type"))?,
        profile_size_bytes: row.get::<i64, _>("profile_size_bytes") as u64,
        last_login: parse_optional_datetime(row.get("last_login"))?,
        is_active: row.get::<i64, _>("is_active") != 0,
        requires_backup: row.get::<i64, _>("requires_backup") != 0,
        backup_priority: row.get::<i64, _>("backup_priority") as u16,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

fn classification_from_row(row: &SqliteRow) -> Result<ClassificationRecord, StoreError> {
    Ok(ClassificationRecord {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        classification: Classification::parse(&row.get::<String, _>("classification"))?,
        confidence: row.get("confidence"),
        reason: row.get("reason"),
        rule_set_name: row.get("rule_set_name"),
        rule_set_version: row.get("rule_set_version"),
        activity_score: row
            .get::<Option<i64>, _>("activity_score")
            .map(|v| v as u8),
        is_overridden: row.get::<i64, _>("is_overridden") != 0,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

fn classification_change_from_row(row: &SqliteRow) -> Result<ClassificationChange, StoreError> {
    let old: Option<String> = row.get("old_classification");
    Ok(ClassificationChange {
        id: Some(row.get("id")),
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        old_classification: old
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Classification::parse)
            .transpose()?,
        new_classification: Classification::parse(&row.get::<String, _>("new_classification"))?,
        change_time: parse_datetime(&row.get::<String, _>("change_time"))?,
        reason: row.get("reason"),
        activity_snapshot: parse_json(&row.get::<String, _>("activity_snapshot"))?,
    })
}

fn override_from_row(row: &SqliteRow) -> Result<ClassificationOverride, StoreError> {
    Ok(ClassificationOverride {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        target_classification: Classification::parse(
            &row.get::<String, _>("target_classification"),
        )?,
        applied_by: row.get("applied_by"),
        reason: row.get("reason"),
        applied_at: parse_datetime(&row.get::<String, _>("applied_at"))?,
        expires_at: parse_optional_datetime(row.get("expires_at"))?,
    })
}

fn backup_op_from_row(row: &SqliteRow) -> Result<BackupOperation, StoreError> {
    let id_str: String = row.get("id");
    let id = OperationId::from_str(&id_str)
        .map_err(|e| StoreError::Corrupt(format!("Invalid OperationId '{}': {}", id_str, e)))?;
    Ok(BackupOperation::from_parts(
        id,
        parse_user_id(&row.get::<String, _>("user_id"))?,
        BackupCategory::parse(&row.get::<String, _>("category"))?,
        OperationStatus::parse(&row.get::<String, _>("status"))?,
        row.get::<i64, _>("progress") as u8,
        row.get::<i64, _>("bytes_transferred") as u64,
        row.get::<i64, _>("bytes_total") as u64,
        parse_datetime(&row.get::<String, _>("started_at"))?,
        parse_datetime(&row.get::<String, _>("last_updated"))?,
        parse_optional_datetime(row.get("ended_at"))?,
        row.get("error"),
    ))
}

fn migration_state_from_row(row: &SqliteRow) -> Result<MigrationState, StoreError> {
    Ok(MigrationState::from_parts(
        parse_user_id(&row.get::<String, _>("user_id"))?,
        MigrationPhase::parse(&row.get::<String, _>("phase"))?,
        row.get::<i64, _>("overall_progress") as u8,
        parse_datetime(&row.get::<String, _>("deadline"))?,
        row.get::<i64, _>("delays_used") as u32,
        parse_datetime(&row.get::<String, _>("last_updated"))?,
    ))
}

fn sync_op_from_row(row: &SqliteRow) -> Result<SyncOperation, StoreError> {
    let id_str: String = row.get("id");
    let id = SyncOpId::from_str(&id_str)
        .map_err(|e| StoreError::Corrupt(format!("Invalid SyncOpId '{}': {}", id_str, e)))?;
    Ok(SyncOperation::from_parts(
        id,
        parse_user_id(&row.get::<String, _>("user_id"))?,
        row.get("folder_path"),
        OperationStatus::parse(&row.get::<String, _>("status"))?,
        parse_datetime(&row.get::<String, _>("started_at"))?,
        parse_optional_datetime(row.get("ended_at"))?,
        row.get::<Option<i64>, _>("files_total").map(|v| v as u64),
        row.get::<Option<i64>, _>("files_uploaded").map(|v| v as u64),
        row.get::<Option<i64>, _>("bytes_total").map(|v| v as u64),
        row.get::<Option<i64>, _>("bytes_uploaded").map(|v| v as u64),
        row.get::<Option<i64>, _>("local_only_files").map(|v| v as u64),
        row.get::<i64, _>("error_count") as u32,
        row.get::<i64, _>("retry_count") as u32,
        parse_optional_datetime(row.get("last_retry"))?,
    ))
}

fn sync_error_from_row(row: &SqliteRow) -> Result<SyncError, StoreError> {
    let op_id_str: String = row.get("sync_op_id");
    let sync_op_id = SyncOpId::from_str(&op_id_str)
        .map_err(|e| StoreError::Corrupt(format!("Invalid SyncOpId '{}': {}", op_id_str, e)))?;
    Ok(SyncError {
        id: Some(row.get("id")),
        sync_op_id,
        file_path: row.get("file_path"),
        error_message: row.get("error_message"),
        category: SyncErrorCategory::parse(&row.get::<String, _>("category"))?,
        retry_attempts: row.get::<i64, _>("retry_attempts") as u32,
        is_resolved: row.get::<i64, _>("is_resolved") != 0,
        escalated_to_it: row.get::<i64, _>("escalated_to_it") != 0,
        error_time: parse_datetime(&row.get::<String, _>("error_time"))?,
    })
}

fn cloud_status_from_row(row: &SqliteRow) -> Result<CloudStatusSnapshot, StoreError> {
    let account_info: Option<String> = row.get("account_info");
    let account_info = match account_info {
        Some(ref s) if !s.is_empty() => Some(
            serde_json::from_str::<CloudAccountInfo>(s)
                .map_err(|e| StoreError::Corrupt(format!("Invalid account_info JSON: {}", e)))?,
        ),
        _ => None,
    };
    Ok(CloudStatusSnapshot {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        is_installed: row.get::<i64, _>("is_installed") != 0,
        is_running: row.get::<i64, _>("is_running") != 0,
        is_signed_in: row.get::<i64, _>("is_signed_in") != 0,
        account_email: row.get("account_email"),
        primary_sync_folder: row.get("primary_sync_folder"),
        sync_status: SyncStatus::parse(&row.get::<String, _>("sync_status"))?,
        account_info,
        error_details: row.get("error_details"),
        last_checked: parse_datetime(&row.get::<String, _>("last_checked"))?,
    })
}

fn synced_folder_from_row(row: &SqliteRow) -> Result<SyncedFolder, StoreError> {
    Ok(SyncedFolder {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        account_id: row.get("account_id"),
        folder_path: row.get("folder_path"),
        in_scope: row.get::<i64, _>("in_scope") != 0,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

fn kfm_status_from_row(row: &SqliteRow) -> Result<KfmStatus, StoreError> {
    Ok(KfmStatus {
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        desktop_redirected: row.get::<i64, _>("desktop_redirected") != 0,
        documents_redirected: row.get::<i64, _>("documents_redirected") != 0,
        pictures_redirected: row.get::<i64, _>("pictures_redirected") != 0,
        last_checked: parse_datetime(&row.get::<String, _>("last_checked"))?,
    })
}

fn warning_from_row(row: &SqliteRow) -> Result<QuotaWarning, StoreError> {
    let id_str: String = row.get("id");
    let id = WarningId::from_str(&id_str)
        .map_err(|e| StoreError::Corrupt(format!("Invalid WarningId '{}': {}", id_str, e)))?;
    Ok(QuotaWarning {
        id,
        user_id: parse_user_id(&row.get::<String, _>("user_id"))?,
        warning_type: QuotaWarningType::parse(&row.get::<String, _>("warning_type"))?,
        level: WarningLevel::parse(&row.get::<String, _>("level"))?,
        title: row.get("title"),
        message: row.get("message"),
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        resolved_at: parse_optional_datetime(row.get("resolved_at"))?,
        is_resolved: row.get::<i64, _>("is_resolved") != 0,
    })
}

fn escalation_from_row(row: &SqliteRow) -> Result<Escalation, StoreError> {
    let id_str: String = row.get("id");
    let id = EscalationId::from_str(&id_str)
        .map_err(|e| StoreError::Corrupt(format!("Invalid EscalationId '{}': {}", id_str, e)))?;
    let user_id: Option<String> = row.get("user_id");
    let user_id = user_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(parse_user_id)
        .transpose()?;
    Ok(Escalation {
        id,
        user_id,
        kind: EscalationKind::parse(&row.get::<String, _>("kind"))?,
        priority: EscalationPriority::parse(&row.get::<String, _>("priority"))?,
        description: row.get("description"),
        details: parse_json(&row.get::<String, _>("details"))?,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        resolved_at: parse_optional_datetime(row.get("resolved_at"))?,
    })
}

// ============================================================================
// StateStore
// ============================================================================

impl StateStore {
    /// Creates a store over an already-migrated connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // --- User profiles ---

    /// Insert or update a user profile
    pub async fn save_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO user_profiles \
             (user_id, user_name, profile_path, profile_type, profile_size_bytes, \
              last_login, is_active, requires_backup, backup_priority, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(profile.user_id.as_str())
        .bind(&profile.user_name)
        .bind(&profile.profile_path)
        .bind(profile.profile_type.as_str())
        .bind(profile.profile_size_bytes as i64)
        .bind(profile.last_login.map(|t| t.to_rfc3339()))
        .bind(profile.is_active as i64)
        .bind(profile.requires_backup as i64)
        .bind(profile.backup_priority as i64)
        .bind(profile.created_at.to_rfc3339())
        .bind(profile.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(user_id = %profile.user_id, "Saved user profile");
        Ok(())
    }

    /// Fetch one profile by user id
    pub async fn get_profile(&self, user_id: &UserId) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    /// All known profiles
    pub async fn list_profiles(&self) -> Result<Vec<UserProfile>, StoreError> {
        let rows = sqlx::query("SELECT * FROM user_profiles ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(profile_from_row).collect()
    }

    /// Profiles that gate the reset (active and requiring backup)
    pub async fn profiles_requiring_backup(&self) -> Result<Vec<UserProfile>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM user_profiles \
             WHERE is_active = 1 AND requires_backup = 1 \
             ORDER BY backup_priority DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    // --- Classifications ---

    /// Insert or update the current classification for a user
    pub async fn save_classification(
        &self,
        record: &ClassificationRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO user_classifications \
             (user_id, classification, confidence, reason, rule_set_name, \
              rule_set_version, activity_score, is_overridden, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.user_id.as_str())
        .bind(record.classification.as_str())
        .bind(record.confidence)
        .bind(&record.reason)
        .bind(&record.rule_set_name)
        .bind(&record.rule_set_version)
        .bind(record.activity_score.map(|v| v as i64))
        .bind(record.is_overridden as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current classification for a user
    pub async fn get_classification(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ClassificationRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM user_classifications WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(classification_from_row).transpose()
    }

    /// Append one immutable history entry
    pub async fn append_classification_change(
        &self,
        change: &ClassificationChange,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO classification_history \
             (user_id, old_classification, new_classification, change_time, reason, \
              activity_snapshot) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(change.user_id.as_str())
        .bind(change.old_classification.map(|c| c.as_str()))
        .bind(change.new_classification.as_str())
        .bind(change.change_time.to_rfc3339())
        .bind(&change.reason)
        .bind(change.activity_snapshot.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// History for a user, newest first
    pub async fn classification_history(
        &self,
        user_id: &UserId,
        limit: Option<u32>,
    ) -> Result<Vec<ClassificationChange>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM classification_history WHERE user_id = ? \
             ORDER BY change_time DESC, id DESC LIMIT ?",
        )
        .bind(user_id.as_str())
        .bind(limit.map_or(i64::MAX, |l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(classification_change_from_row).collect()
    }

    // --- Overrides ---

    /// Insert or replace the override for a user
    pub async fn save_override(
        &self,
        override_: &ClassificationOverride,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO classification_overrides \
             (user_id, target_classification, applied_by, reason, applied_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(override_.user_id.as_str())
        .bind(override_.target_classification.as_str())
        .bind(&override_.applied_by)
        .bind(&override_.reason)
        .bind(override_.applied_at.to_rfc3339())
        .bind(override_.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The override for a user, if present
    pub async fn get_override(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ClassificationOverride>, StoreError> {
        let row = sqlx::query("SELECT * FROM classification_overrides WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(override_from_row).transpose()
    }

    /// Remove the override for a user
    pub async fn delete_override(&self, user_id: &UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM classification_overrides WHERE user_id = ?")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Backup operations ---

    /// Insert or update a backup operation
    ///
    /// The `(user_id, category)` pair is unique; saving an operation with a
    /// fresh id for an existing pair yields `StoreError::Conflict`.
    pub async fn save_backup_op(&self, op: &BackupOperation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO backup_operations \
             (id, user_id, category, status, progress, bytes_transferred, bytes_total, \
              started_at, last_updated, ended_at, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
               status = excluded.status, progress = excluded.progress, \
               bytes_transferred = excluded.bytes_transferred, \
               bytes_total = excluded.bytes_total, \
               last_updated = excluded.last_updated, \
               ended_at = excluded.ended_at, error = excluded.error",
        )
        .bind(op.id().to_string())
        .bind(op.user_id().as_str())
        .bind(op.category().as_str())
        .bind(op.status().as_str())
        .bind(op.progress() as i64)
        .bind(op.bytes_transferred() as i64)
        .bind(op.bytes_total() as i64)
        .bind(op.started_at().to_rfc3339())
        .bind(op.last_updated().to_rfc3339())
        .bind(op.ended_at().map(|t| t.to_rfc3339()))
        .bind(op.error())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All backup operations for a user, in category order
    pub async fn user_backup_ops(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<BackupOperation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM backup_operations WHERE user_id = ? ORDER BY category",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(backup_op_from_row).collect()
    }

    /// The backup operation for one (user, category), if any
    pub async fn backup_op(
        &self,
        user_id: &UserId,
        category: BackupCategory,
    ) -> Result<Option<BackupOperation>, StoreError> {
        let row =
            sqlx::query("SELECT * FROM backup_operations WHERE user_id = ? AND category = ?")
                .bind(user_id.as_str())
                .bind(category.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(backup_op_from_row).transpose()
    }

    /// Remove a user's backup operations (used when restarting a backup)
    pub async fn delete_backup_ops(&self, user_id: &UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM backup_operations WHERE user_id = ?")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Migration state ---

    /// Insert or update a user's migration state
    pub async fn save_migration_state(&self, state: &MigrationState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO migration_state \
             (user_id, phase, overall_progress, deadline, delays_used, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(state.user_id().as_str())
        .bind(state.phase().as_str())
        .bind(state.overall_progress() as i64)
        .bind(state.deadline().to_rfc3339())
        .bind(state.delays_used() as i64)
        .bind(state.last_updated().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One user's migration state
    pub async fn get_migration_state(
        &self,
        user_id: &UserId,
    ) -> Result<Option<MigrationState>, StoreError> {
        let row = sqlx::query("SELECT * FROM migration_state WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(migration_state_from_row).transpose()
    }

    /// Every tracked migration state
    pub async fn all_migration_states(&self) -> Result<Vec<MigrationState>, StoreError> {
        let rows = sqlx::query("SELECT * FROM migration_state ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(migration_state_from_row).collect()
    }

    // --- Sync operations ---

    /// Insert a new sync operation
    ///
    /// A partial unique index enforces at most one non-terminal operation
    /// per (user, folder); a second insert yields `StoreError::Conflict`.
    pub async fn insert_sync_op(&self, op: &SyncOperation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_operations \
             (id, user_id, folder_path, status, started_at, ended_at, files_total, \
              files_uploaded, bytes_total, bytes_uploaded, local_only_files, \
              error_count, retry_count, last_retry) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(op.id().to_string())
        .bind(op.user_id().as_str())
        .bind(op.folder_path())
        .bind(op.status().as_str())
        .bind(op.started_at().to_rfc3339())
        .bind(op.ended_at().map(|t| t.to_rfc3339()))
        .bind(op.files_total().map(|v| v as i64))
        .bind(op.files_uploaded().map(|v| v as i64))
        .bind(op.bytes_total().map(|v| v as i64))
        .bind(op.bytes_uploaded().map(|v| v as i64))
        .bind(op.local_only_files().map(|v| v as i64))
        .bind(op.error_count() as i64)
        .bind(op.retry_count() as i64)
        .bind(op.last_retry().map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update an existing sync operation
    pub async fn update_sync_op(&self, op: &SyncOperation) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_operations SET \
               status = ?, ended_at = ?, files_total = ?, files_uploaded = ?, \
               bytes_total = ?, bytes_uploaded = ?, local_only_files = ?, \
               error_count = ?, retry_count = ?, last_retry = ? \
             WHERE id = ?",
        )
        .bind(op.status().as_str())
        .bind(op.ended_at().map(|t| t.to_rfc3339()))
        .bind(op.files_total().map(|v| v as i64))
        .bind(op.files_uploaded().map(|v| v as i64))
        .bind(op.bytes_total().map(|v| v as i64))
        .bind(op.bytes_uploaded().map(|v| v as i64))
        .bind(op.local_only_files().map(|v| v as i64))
        .bind(op.error_count() as i64)
        .bind(op.retry_count() as i64)
        .bind(op.last_retry().map(|t| t.to_rfc3339()))
        .bind(op.id().to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The non-terminal sync operation for a (user, folder), if one exists
    pub async fn active_sync_op(
        &self,
        user_id: &UserId,
        folder: &str,
    ) -> Result<Option<SyncOperation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_operations \
             WHERE user_id = ? AND folder_path = ? \
               AND status IN ('pending', 'in_progress')",
        )
        .bind(user_id.as_str())
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_op_from_row).transpose()
    }

    /// Fetch one sync operation by id
    pub async fn get_sync_op(&self, id: SyncOpId) -> Result<Option<SyncOperation>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_operations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sync_op_from_row).transpose()
    }

    // --- Sync errors ---

    /// Insert a sync error, returning its row id
    pub async fn insert_sync_error(&self, error: &SyncError) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_errors \
             (sync_op_id, file_path, error_message, category, retry_attempts, \
              is_resolved, escalated_to_it, error_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(error.sync_op_id.to_string())
        .bind(&error.file_path)
        .bind(&error.error_message)
        .bind(error.category.as_str())
        .bind(error.retry_attempts as i64)
        .bind(error.is_resolved as i64)
        .bind(error.escalated_to_it as i64)
        .bind(error.error_time.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Update a previously inserted sync error
    pub async fn update_sync_error(&self, error: &SyncError) -> Result<(), StoreError> {
        let id = error.id.ok_or_else(|| {
            StoreError::Corrupt("Cannot update a sync error that was never inserted".into())
        })?;
        sqlx::query(
            "UPDATE sync_errors SET \
               retry_attempts = ?, is_resolved = ?, escalated_to_it = ? \
             WHERE id = ?",
        )
        .bind(error.retry_attempts as i64)
        .bind(error.is_resolved as i64)
        .bind(error.escalated_to_it as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unresolved errors for one sync operation, oldest first
    pub async fn unresolved_sync_errors(
        &self,
        sync_op_id: SyncOpId,
    ) -> Result<Vec<SyncError>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sync_errors \
             WHERE sync_op_id = ? AND is_resolved = 0 ORDER BY error_time ASC",
        )
        .bind(sync_op_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_error_from_row).collect()
    }

    // --- Cloud status ---

    /// Persist the latest cloud status snapshot for a user
    pub async fn save_cloud_status(
        &self,
        snapshot: &CloudStatusSnapshot,
    ) -> Result<(), StoreError> {
        let account_info = snapshot
            .account_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize account_info: {}", e)))?;
        sqlx::query(
            "INSERT OR REPLACE INTO onedrive_status \
             (user_id, is_installed, is_running, is_signed_in, account_email, \
              primary_sync_folder, sync_status, account_info, error_details, last_checked) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(snapshot.user_id.as_str())
        .bind(snapshot.is_installed as i64)
        .bind(snapshot.is_running as i64)
        .bind(snapshot.is_signed_in as i64)
        .bind(&snapshot.account_email)
        .bind(&snapshot.primary_sync_folder)
        .bind(snapshot.sync_status.as_str())
        .bind(account_info)
        .bind(&snapshot.error_details)
        .bind(snapshot.last_checked.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest persisted cloud status for a user
    pub async fn get_cloud_status(
        &self,
        user_id: &UserId,
    ) -> Result<Option<CloudStatusSnapshot>, StoreError> {
        let row = sqlx::query("SELECT * FROM onedrive_status WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cloud_status_from_row).transpose()
    }

    /// Persist account details for a user
    pub async fn save_cloud_account(
        &self,
        user_id: &UserId,
        info: &CloudAccountInfo,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO onedrive_accounts \
             (user_id, account_id, email, total_bytes, used_bytes, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id.as_str())
        .bind(info.account_id.as_deref().unwrap_or("default"))
        .bind(&info.email)
        .bind(info.total_bytes as i64)
        .bind(info.used_bytes as i64)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist scope membership of a folder
    pub async fn save_synced_folder(&self, folder: &SyncedFolder) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO onedrive_synced_folders \
             (user_id, account_id, folder_path, in_scope, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(folder.user_id.as_str())
        .bind(&folder.account_id)
        .bind(&folder.folder_path)
        .bind(folder.in_scope as i64)
        .bind(folder.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Known scope memberships for a (user, account)
    pub async fn synced_folders(
        &self,
        user_id: &UserId,
        account_id: &str,
    ) -> Result<Vec<SyncedFolder>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM onedrive_synced_folders \
             WHERE user_id = ? AND account_id = ? ORDER BY folder_path",
        )
        .bind(user_id.as_str())
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(synced_folder_from_row).collect()
    }

    /// Persist known-folder redirection state
    pub async fn save_kfm_status(&self, status: &KfmStatus) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO kfm_status \
             (user_id, desktop_redirected, documents_redirected, pictures_redirected, \
              last_checked) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(status.user_id.as_str())
        .bind(status.desktop_redirected as i64)
        .bind(status.documents_redirected as i64)
        .bind(status.pictures_redirected as i64)
        .bind(status.last_checked.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Known-folder redirection state for a user
    pub async fn get_kfm_status(&self, user_id: &UserId) -> Result<Option<KfmStatus>, StoreError> {
        let row = sqlx::query("SELECT * FROM kfm_status WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(kfm_status_from_row).transpose()
    }

    // --- Quota ---

    /// Persist the latest quota evaluation for a user (operator snapshot)
    pub async fn save_quota_snapshot(
        &self,
        status: &QuotaStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let issues = serde_json::to_string(&status.issues)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize issues: {}", e)))?;
        let recommendations = serde_json::to_string(&status.recommendations).map_err(|e| {
            StoreError::Corrupt(format!("Failed to serialize recommendations: {}", e))
        })?;
        sqlx::query(
            "INSERT OR REPLACE INTO quota_status \
             (user_id, health, total_mb, used_mb, available_mb, required_mb, shortfall_mb, \
              usage_pct, can_accommodate_backup, issues, recommendations, checked_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(status.user_id.as_str())
        .bind(status.health.as_str())
        .bind(status.total_mb as i64)
        .bind(status.used_mb as i64)
        .bind(status.available_mb as i64)
        .bind(status.required_mb as i64)
        .bind(status.shortfall_mb as i64)
        .bind(status.usage_pct)
        .bind(status.can_accommodate_backup as i64)
        .bind(issues)
        .bind(recommendations)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or update a quota warning
    pub async fn save_warning(&self, warning: &QuotaWarning) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO quota_warnings \
             (id, user_id, warning_type, level, title, message, created_at, \
              resolved_at, is_resolved) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(warning.id.to_string())
        .bind(warning.user_id.as_str())
        .bind(warning.warning_type.as_str())
        .bind(warning.level.as_str())
        .bind(&warning.title)
        .bind(&warning.message)
        .bind(warning.created_at.to_rfc3339())
        .bind(warning.resolved_at.map(|t| t.to_rfc3339()))
        .bind(warning.is_resolved as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unresolved warnings for a user, newest first
    pub async fn unresolved_warnings(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<QuotaWarning>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM quota_warnings \
             WHERE user_id = ? AND is_resolved = 0 ORDER BY created_at DESC",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(warning_from_row).collect()
    }

    /// The most recent warning of a type for a user, resolved or not
    pub async fn latest_warning(
        &self,
        user_id: &UserId,
        warning_type: QuotaWarningType,
    ) -> Result<Option<QuotaWarning>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM quota_warnings \
             WHERE user_id = ? AND warning_type = ? \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id.as_str())
        .bind(warning_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(warning_from_row).transpose()
    }

    /// Resolved warnings of a type created after `since`
    pub async fn resolved_warnings_since(
        &self,
        user_id: &UserId,
        warning_type: QuotaWarningType,
        since: DateTime<Utc>,
    ) -> Result<Vec<QuotaWarning>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM quota_warnings \
             WHERE user_id = ? AND warning_type = ? AND is_resolved = 1 \
               AND created_at > ? \
             ORDER BY created_at DESC",
        )
        .bind(user_id.as_str())
        .bind(warning_type.as_str())
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(warning_from_row).collect()
    }

    // --- Escalations ---

    /// Insert or update an escalation
    pub async fn save_escalation(&self, escalation: &Escalation) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO escalations \
             (id, user_id, kind, priority, description, details, created_at, \
              updated_at, resolved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(escalation.id.to_string())
        .bind(escalation.user_id.as_ref().map(|u| u.as_str().to_string()))
        .bind(escalation.kind.as_str())
        .bind(escalation.priority.as_str())
        .bind(&escalation.description)
        .bind(escalation.details.to_string())
        .bind(escalation.created_at.to_rfc3339())
        .bind(escalation.updated_at.to_rfc3339())
        .bind(escalation.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The open escalation of one kind for a user, if any
    pub async fn open_escalation(
        &self,
        user_id: Option<&UserId>,
        kind: EscalationKind,
    ) -> Result<Option<Escalation>, StoreError> {
        let row = match user_id {
            Some(user) => {
                sqlx::query(
                    "SELECT * FROM escalations \
                     WHERE user_id = ? AND kind = ? AND resolved_at IS NULL \
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(user.as_str())
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM escalations \
                     WHERE user_id IS NULL AND kind = ? AND resolved_at IS NULL \
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(escalation_from_row).transpose()
    }

    /// Every open escalation, newest first
    pub async fn open_escalations(&self) -> Result<Vec<Escalation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM escalations WHERE resolved_at IS NULL ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(escalation_from_row).collect()
    }
}
