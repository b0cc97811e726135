//! Cloud provider state: status snapshots, sync operations, sync errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::backup::OperationStatus;
use super::newtypes::{SyncOpId, UserId};
use crate::errors::DomainError;

// ============================================================================
// Status snapshot
// ============================================================================

/// Observed sync state of the cloud client for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No signal yet
    Unknown,
    /// Everything uploaded
    UpToDate,
    /// Upload in progress
    Syncing,
    /// Paused by the user or the client
    Paused,
    /// Client reports an error
    Error,
    /// Client installed but no account signed in
    NotSignedIn,
    /// Credentials expired; interactive sign-in needed
    AuthRequired,
}

impl SyncStatus {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "unknown",
            SyncStatus::UpToDate => "up_to_date",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Paused => "paused",
            SyncStatus::Error => "error",
            SyncStatus::NotSignedIn => "not_signed_in",
            SyncStatus::AuthRequired => "auth_required",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "unknown" => Ok(SyncStatus::Unknown),
            "up_to_date" => Ok(SyncStatus::UpToDate),
            "syncing" => Ok(SyncStatus::Syncing),
            "paused" => Ok(SyncStatus::Paused),
            "error" => Ok(SyncStatus::Error),
            "not_signed_in" => Ok(SyncStatus::NotSignedIn),
            "auth_required" => Ok(SyncStatus::AuthRequired),
            other => Err(DomainError::UnknownEnumValue {
                kind: "SyncStatus",
                value: other.to_string(),
            }),
        }
    }
}

/// Account details reported by the cloud client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAccountInfo {
    /// Provider-side account identifier, if exposed
    pub account_id: Option<String>,
    /// Signed-in account email
    pub email: String,
    /// Total quota in bytes
    pub total_bytes: u64,
    /// Used quota in bytes
    pub used_bytes: u64,
}

impl CloudAccountInfo {
    /// Remaining quota in bytes
    pub fn available_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Cached per-user snapshot of cloud readiness (5-minute TTL)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudStatusSnapshot {
    /// Which user the snapshot describes
    pub user_id: UserId,
    /// Whether the cloud client is installed
    pub is_installed: bool,
    /// Whether the client process is running
    pub is_running: bool,
    /// Whether an account is signed in
    pub is_signed_in: bool,
    /// Signed-in account email
    pub account_email: Option<String>,
    /// Root of the primary sync folder
    pub primary_sync_folder: Option<String>,
    /// Observed sync state
    pub sync_status: SyncStatus,
    /// Full account details, when available
    pub account_info: Option<CloudAccountInfo>,
    /// Detection failure details, if the last probe failed
    pub error_details: Option<String>,
    /// When the snapshot was taken
    pub last_checked: DateTime<Utc>,
}

impl CloudStatusSnapshot {
    /// A snapshot representing "nothing detected yet"
    pub fn unknown(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            is_installed: false,
            is_running: false,
            is_signed_in: false,
            account_email: None,
            primary_sync_folder: None,
            sync_status: SyncStatus::Unknown,
            account_info: None,
            error_details: None,
            last_checked: now,
        }
    }

    /// Ready means installed, running and signed in
    pub fn is_ready(&self) -> bool {
        self.is_installed && self.is_running && self.is_signed_in
    }

    /// Whether the snapshot is still fresh for the given TTL
    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_checked < ttl
    }
}

/// Scope membership of one folder under an account's selective sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedFolder {
    /// Owning user
    pub user_id: UserId,
    /// Cloud account the folder belongs to
    pub account_id: String,
    /// Absolute folder path
    pub folder_path: String,
    /// Whether the folder is currently replicated
    pub in_scope: bool,
    /// Last scope evaluation
    pub updated_at: DateTime<Utc>,
}

/// Known-folder redirection state for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KfmStatus {
    /// Which user this describes
    pub user_id: UserId,
    /// Desktop folder redirected into the sync root
    pub desktop_redirected: bool,
    /// Documents folder redirected
    pub documents_redirected: bool,
    /// Pictures folder redirected
    pub pictures_redirected: bool,
    /// When the state was last read from the client
    pub last_checked: DateTime<Utc>,
}

impl KfmStatus {
    /// All three known folders are redirected
    pub fn is_fully_redirected(&self) -> bool {
        self.desktop_redirected && self.documents_redirected && self.pictures_redirected
    }
}

// ============================================================================
// Sync operations
// ============================================================================

/// One tracked local-to-cloud upload of a folder
///
/// At most one non-terminal operation may exist per (user, folder); the
/// store enforces this with a partial unique index and the service surfaces
/// violations as `Conflict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    id: SyncOpId,
    user_id: UserId,
    folder_path: String,
    status: OperationStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    files_total: Option<u64>,
    files_uploaded: Option<u64>,
    bytes_total: Option<u64>,
    bytes_uploaded: Option<u64>,
    local_only_files: Option<u64>,
    error_count: u32,
    retry_count: u32,
    last_retry: Option<DateTime<Utc>>,
}

impl SyncOperation {
    /// Create a pending operation for a folder
    pub fn new(user_id: UserId, folder_path: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: SyncOpId::new(),
            user_id,
            folder_path: folder_path.into(),
            status: OperationStatus::Pending,
            started_at: now,
            ended_at: None,
            files_total: None,
            files_uploaded: None,
            bytes_total: None,
            bytes_uploaded: None,
            local_only_files: None,
            error_count: 0,
            retry_count: 0,
            last_retry: None,
        }
    }

    /// Rehydrate a persisted operation (store row mapping only)
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: SyncOpId,
        user_id: UserId,
        folder_path: String,
        status: OperationStatus,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        files_total: Option<u64>,
        files_uploaded: Option<u64>,
        bytes_total: Option<u64>,
        bytes_uploaded: Option<u64>,
        local_only_files: Option<u64>,
        error_count: u32,
        retry_count: u32,
        last_retry: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            user_id,
            folder_path,
            status,
            started_at,
            ended_at,
            files_total,
            files_uploaded,
            bytes_total,
            bytes_uploaded,
            local_only_files,
            error_count,
            retry_count,
            last_retry,
        }
    }

    pub fn id(&self) -> SyncOpId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn files_total(&self) -> Option<u64> {
        self.files_total
    }

    pub fn files_uploaded(&self) -> Option<u64> {
        self.files_uploaded
    }

    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    pub fn bytes_uploaded(&self) -> Option<u64> {
        self.bytes_uploaded
    }

    pub fn local_only_files(&self) -> Option<u64> {
        self.local_only_files
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_retry(&self) -> Option<DateTime<Utc>> {
        self.last_retry
    }

    fn guard_mutable(&self, attempted: OperationStatus) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidState {
                from: self.status.as_str().to_string(),
                to: attempted.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Record a progress sample from the cloud connector
    ///
    /// Byte and file counters are monotone; totals may be revised by the
    /// provider as it discovers files.
    pub fn update_progress(
        &mut self,
        files_total: Option<u64>,
        files_uploaded: Option<u64>,
        bytes_total: Option<u64>,
        bytes_uploaded: Option<u64>,
        local_only_files: Option<u64>,
    ) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::InProgress)?;
        self.status = OperationStatus::InProgress;
        if files_total.is_some() {
            self.files_total = files_total;
        }
        if let Some(v) = files_uploaded {
            self.files_uploaded = Some(self.files_uploaded.unwrap_or(0).max(v));
        }
        if bytes_total.is_some() {
            self.bytes_total = bytes_total;
        }
        if let Some(v) = bytes_uploaded {
            self.bytes_uploaded = Some(self.bytes_uploaded.unwrap_or(0).max(v));
        }
        if local_only_files.is_some() {
            self.local_only_files = local_only_files;
        }
        Ok(())
    }

    /// Whether the provider still reports unfinished files
    pub fn has_remaining_files(&self) -> bool {
        match (self.files_total, self.files_uploaded) {
            (Some(total), Some(done)) => done < total,
            (Some(total), None) => total > 0,
            _ => false,
        }
    }

    /// Count one categorized error against this operation
    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Count a retry attempt
    pub fn record_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_retry = Some(now);
    }

    /// Mark completed
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Completed)?;
        self.status = OperationStatus::Completed;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark failed
    pub fn fail(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Failed)?;
        self.status = OperationStatus::Failed;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Cancelled)?;
        self.status = OperationStatus::Cancelled;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark timed out after a stall
    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::TimedOut)?;
        self.status = OperationStatus::TimedOut;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Park the operation for human intervention
    pub fn require_intervention(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::RequiresIntervention)?;
        self.status = OperationStatus::RequiresIntervention;
        self.ended_at = Some(now);
        Ok(())
    }
}

// ============================================================================
// Sync errors
// ============================================================================

/// Failure category assigned to one sync error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorCategory {
    /// File held open by another process
    FileLocked,
    /// Name or path the provider refuses
    InvalidPath,
    /// File vanished between scan and upload
    FileNotFound,
    /// Cloud quota exhausted
    QuotaExceeded,
    /// Credentials need interactive refresh
    AuthRequired,
    /// Transient connectivity failure
    TransientNetwork,
    /// Anything else
    Other,
}

impl SyncErrorCategory {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCategory::FileLocked => "file_locked",
            SyncErrorCategory::InvalidPath => "invalid_path",
            SyncErrorCategory::FileNotFound => "file_not_found",
            SyncErrorCategory::QuotaExceeded => "quota_exceeded",
            SyncErrorCategory::AuthRequired => "auth_required",
            SyncErrorCategory::TransientNetwork => "transient_network",
            SyncErrorCategory::Other => "other",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "file_locked" => Ok(SyncErrorCategory::FileLocked),
            "invalid_path" => Ok(SyncErrorCategory::InvalidPath),
            "file_not_found" => Ok(SyncErrorCategory::FileNotFound),
            "quota_exceeded" => Ok(SyncErrorCategory::QuotaExceeded),
            "auth_required" => Ok(SyncErrorCategory::AuthRequired),
            "transient_network" => Ok(SyncErrorCategory::TransientNetwork),
            "other" => Ok(SyncErrorCategory::Other),
            other => Err(DomainError::UnknownEnumValue {
                kind: "SyncErrorCategory",
                value: other.to_string(),
            }),
        }
    }
}

/// One file-level failure observed during a sync operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    /// Row id; `None` until persisted
    pub id: Option<i64>,
    /// Owning sync operation
    pub sync_op_id: SyncOpId,
    /// File the provider failed on
    pub file_path: String,
    /// Raw provider message
    pub error_message: String,
    /// Assigned category
    pub category: SyncErrorCategory,
    /// Retries attempted so far
    pub retry_attempts: u32,
    /// Whether recovery has finished with this error
    pub is_resolved: bool,
    /// Whether this error was included in an IT escalation
    pub escalated_to_it: bool,
    /// When the error was first observed
    pub error_time: DateTime<Utc>,
}

impl SyncError {
    /// Create an unresolved error record
    pub fn new(
        sync_op_id: SyncOpId,
        file_path: impl Into<String>,
        error_message: impl Into<String>,
        category: SyncErrorCategory,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            sync_op_id,
            file_path: file_path.into(),
            error_message: error_message.into(),
            category,
            retry_attempts: 0,
            is_resolved: false,
            escalated_to_it: false,
            error_time: now,
        }
    }
}
