//! Cloud connector port
//!
//! Interface to the per-user cloud sync client (OneDrive for Business in
//! practice). The adapter shells out to the client's APIs and status files;
//! the core consumes only these methods and DTOs.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are
//!   adapter-specific and don't need domain-level classification.
//! - Byte-level transfer is entirely the client's job; the core only
//!   observes progress and steers scope.

use serde::{Deserialize, Serialize};

use crate::domain::cloud::{CloudAccountInfo, KfmStatus, SyncStatus};
use crate::domain::newtypes::UserId;

/// Upload progress as sampled from the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgressSample {
    /// Files the client intends to upload from the folder
    pub files_total: Option<u64>,
    /// Files confirmed uploaded
    pub files_uploaded: Option<u64>,
    /// Bytes the client intends to upload
    pub bytes_total: Option<u64>,
    /// Bytes confirmed uploaded
    pub bytes_uploaded: Option<u64>,
    /// Files that exist only locally (not yet replicated)
    pub local_only_files: Option<u64>,
}

/// Per-file replication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSyncState {
    /// Fully uploaded
    InSync,
    /// Upload pending or running
    Pending,
    /// Client reports an error for this file
    Error,
    /// Path not under any sync root
    NotTracked,
}

/// Port trait for the cloud sync client
#[async_trait::async_trait]
pub trait CloudConnector: Send + Sync {
    /// Whether the client is installed for this user
    async fn is_installed(&self, user_id: &UserId) -> anyhow::Result<bool>;

    /// Whether the client process is running in the user's session
    async fn is_running(&self, user_id: &UserId) -> anyhow::Result<bool>;

    /// Whether an account is signed in
    async fn is_signed_in(&self, user_id: &UserId) -> anyhow::Result<bool>;

    /// Overall sync state as reported by the client
    async fn sync_status(&self, user_id: &UserId) -> anyhow::Result<SyncStatus>;

    /// Signed-in account details including quota, if signed in
    async fn account_info(&self, user_id: &UserId) -> anyhow::Result<Option<CloudAccountInfo>>;

    /// Root of the primary sync folder, if configured
    async fn primary_sync_folder(&self, user_id: &UserId) -> anyhow::Result<Option<String>>;

    /// Folders excluded from replication by selective sync
    async fn excluded_folders(
        &self,
        user_id: &UserId,
        account_id: &str,
    ) -> anyhow::Result<Vec<String>>;

    /// Replace the selective-sync exclusion list
    async fn set_excluded_folders(
        &self,
        user_id: &UserId,
        account_id: &str,
        excluded: Vec<String>,
    ) -> anyhow::Result<()>;

    /// Files under `folder` that exist only locally
    async fn local_only_files(
        &self,
        user_id: &UserId,
        folder: &str,
    ) -> anyhow::Result<Vec<String>>;

    /// Ask the client to sync a folder now
    async fn force_sync(&self, user_id: &UserId, folder: &str) -> anyhow::Result<()>;

    /// Sample current upload progress for a folder
    async fn sync_progress(
        &self,
        user_id: &UserId,
        folder: &str,
    ) -> anyhow::Result<SyncProgressSample>;

    /// Replication state of a single file
    async fn file_sync_state(
        &self,
        user_id: &UserId,
        path: &str,
    ) -> anyhow::Result<FileSyncState>;

    /// Known-folder redirection state
    async fn kfm_status(&self, user_id: &UserId) -> anyhow::Result<KfmStatus>;
}
