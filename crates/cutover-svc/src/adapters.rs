//! Capability adapters bundled with the daemon
//!
//! The OS-facing adapters (registry profile enumeration, event-log activity,
//! the OneDrive client bridge, the ticketing connector) ship as separate
//! platform packages and are wired in at deployment time. The adapters here
//! are the safe fallbacks the daemon boots with when a platform package is
//! absent: they report nothing rather than guessing, which keeps the reset
//! gate shut.

use cutover_core::domain::cloud::{CloudAccountInfo, KfmStatus, SyncStatus};
use cutover_core::domain::escalation::Escalation;
use cutover_core::domain::newtypes::UserId;
use cutover_core::ports::{
    ActivitySnapshot, ActivitySource, CloudConnector, DetectedProfile, EscalationSink,
    FileSyncState, ProfileDetector, SyncProgressSample,
};

/// Detector used when no platform profile package is installed
///
/// Reports no profiles; the machine then has nothing gating reset, and
/// operators will notice the empty roster immediately.
pub struct NullProfileDetector;

#[async_trait::async_trait]
impl ProfileDetector for NullProfileDetector {
    async fn enumerate_profiles(&self) -> anyhow::Result<Vec<DetectedProfile>> {
        Ok(Vec::new())
    }

    async fn resolve(&self, _user_id: &UserId) -> anyhow::Result<Option<DetectedProfile>> {
        Ok(None)
    }

    async fn measure_profile_size(&self, _user_id: &UserId) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Activity source used when no platform activity package is installed
pub struct NullActivitySource;

#[async_trait::async_trait]
impl ActivitySource for NullActivitySource {
    async fn snapshot(&self, _user_id: &UserId) -> anyhow::Result<ActivitySnapshot> {
        Ok(ActivitySnapshot::default())
    }
}

/// Cloud connector used when no provider bridge is installed
///
/// Reports the client as not installed, which keeps every user in
/// `NotStarted` rather than letting a backup "succeed" against nothing.
pub struct OfflineCloudConnector;

#[async_trait::async_trait]
impl CloudConnector for OfflineCloudConnector {
    async fn is_installed(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_running(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_signed_in(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn sync_status(&self, _user_id: &UserId) -> anyhow::Result<SyncStatus> {
        Ok(SyncStatus::Unknown)
    }

    async fn account_info(&self, _user_id: &UserId) -> anyhow::Result<Option<CloudAccountInfo>> {
        Ok(None)
    }

    async fn primary_sync_folder(&self, _user_id: &UserId) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn excluded_folders(
        &self,
        _user_id: &UserId,
        _account_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn set_excluded_folders(
        &self,
        _user_id: &UserId,
        _account_id: &str,
        _excluded: Vec<String>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no cloud provider bridge installed")
    }

    async fn local_only_files(
        &self,
        _user_id: &UserId,
        _folder: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn force_sync(&self, _user_id: &UserId, _folder: &str) -> anyhow::Result<()> {
        anyhow::bail!("no cloud provider bridge installed")
    }

    async fn sync_progress(
        &self,
        _user_id: &UserId,
        _folder: &str,
    ) -> anyhow::Result<SyncProgressSample> {
        Ok(SyncProgressSample::default())
    }

    async fn file_sync_state(
        &self,
        _user_id: &UserId,
        _path: &str,
    ) -> anyhow::Result<FileSyncState> {
        Ok(FileSyncState::NotTracked)
    }

    async fn kfm_status(&self, user_id: &UserId) -> anyhow::Result<KfmStatus> {
        Ok(KfmStatus {
            user_id: user_id.clone(),
            desktop_redirected: false,
            documents_redirected: false,
            pictures_redirected: false,
            last_checked: chrono::Utc::now(),
        })
    }
}

/// Escalation sink used when no ticketing connector is installed
///
/// Escalations stay durable in the store; this sink only surfaces them in
/// the diagnostic log so an operator tailing the service still sees them.
pub struct LogEscalationSink;

#[async_trait::async_trait]
impl EscalationSink for LogEscalationSink {
    async fn submit(&self, escalation: &Escalation) -> anyhow::Result<Option<String>> {
        tracing::warn!(
            escalation_id = %escalation.id,
            kind = escalation.kind.as_str(),
            priority = escalation.priority.as_str(),
            description = %escalation.description,
            "Escalation raised (no ticketing connector installed)"
        );
        Ok(None)
    }
}
