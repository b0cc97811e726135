//! Shared test doubles for the cloud crate

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

use cutover_core::domain::cloud::{CloudAccountInfo, KfmStatus, SyncStatus};
use cutover_core::domain::newtypes::UserId;
use cutover_core::ports::{Clock, CloudConnector, FileSyncState, SyncProgressSample};

/// Clock whose `now` is driven by the test
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new(start: &str) -> Self {
        Self {
            now: Mutex::new(start.parse().unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Scriptable cloud connector
pub struct MockConnector {
    pub installed: AtomicBool,
    pub running: AtomicBool,
    pub signed_in: AtomicBool,
    pub total_mb: Mutex<u64>,
    pub used_mb: Mutex<u64>,
    pub sync_status: Mutex<SyncStatus>,
    pub excluded: Mutex<Vec<String>>,
    pub progress: Mutex<SyncProgressSample>,
    pub local_only: Mutex<Vec<String>>,
    detect_calls: AtomicU32,
    force_sync_calls: AtomicU32,
    fail_detection: AtomicBool,
}

impl MockConnector {
    pub fn signed_in(total_mb: u64, used_mb: u64) -> Self {
        Self {
            installed: AtomicBool::new(true),
            running: AtomicBool::new(true),
            signed_in: AtomicBool::new(true),
            total_mb: Mutex::new(total_mb),
            used_mb: Mutex::new(used_mb),
            sync_status: Mutex::new(SyncStatus::UpToDate),
            excluded: Mutex::new(Vec::new()),
            progress: Mutex::new(SyncProgressSample::default()),
            local_only: Mutex::new(Vec::new()),
            detect_calls: AtomicU32::new(0),
            force_sync_calls: AtomicU32::new(0),
            fail_detection: AtomicBool::new(false),
        }
    }

    pub fn not_installed() -> Self {
        let mock = Self::signed_in(0, 0);
        mock.installed.store(false, Ordering::SeqCst);
        mock.running.store(false, Ordering::SeqCst);
        mock.signed_in.store(false, Ordering::SeqCst);
        mock
    }

    pub fn not_signed_in(total_mb: u64) -> Self {
        let mock = Self::signed_in(total_mb, 0);
        mock.signed_in.store(false, Ordering::SeqCst);
        mock
    }

    pub fn detect_calls(&self) -> u32 {
        self.detect_calls.load(Ordering::SeqCst)
    }

    pub fn force_sync_calls(&self) -> u32 {
        self.force_sync_calls.load(Ordering::SeqCst)
    }

    pub fn fail_detection(&self, fail: bool) {
        self.fail_detection.store(fail, Ordering::SeqCst);
    }

    pub fn set_progress(&self, sample: SyncProgressSample) {
        *self.progress.lock().unwrap() = sample;
    }

    fn check_failure(&self) -> anyhow::Result<()> {
        if self.fail_detection.load(Ordering::SeqCst) {
            anyhow::bail!("connector unavailable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CloudConnector for MockConnector {
    async fn is_installed(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(self.installed.load(Ordering::SeqCst))
    }

    async fn is_running(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        self.check_failure()?;
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn is_signed_in(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        self.check_failure()?;
        Ok(self.signed_in.load(Ordering::SeqCst))
    }

    async fn sync_status(&self, _user_id: &UserId) -> anyhow::Result<SyncStatus> {
        self.check_failure()?;
        Ok(*self.sync_status.lock().unwrap())
    }

    async fn account_info(&self, _user_id: &UserId) -> anyhow::Result<Option<CloudAccountInfo>> {
        self.check_failure()?;
        if !self.signed_in.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(CloudAccountInfo {
            account_id: Some("biz1".to_string()),
            email: "user@contoso.com".to_string(),
            total_bytes: *self.total_mb.lock().unwrap() * 1024 * 1024,
            used_bytes: *self.used_mb.lock().unwrap() * 1024 * 1024,
        }))
    }

    async fn primary_sync_folder(&self, _user_id: &UserId) -> anyhow::Result<Option<String>> {
        self.check_failure()?;
        Ok(Some(r"C:\Users\user\OneDrive - Contoso".to_string()))
    }

    async fn excluded_folders(
        &self,
        _user_id: &UserId,
        _account_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(self.excluded.lock().unwrap().clone())
    }

    async fn set_excluded_folders(
        &self,
        _user_id: &UserId,
        _account_id: &str,
        excluded: Vec<String>,
    ) -> anyhow::Result<()> {
        *self.excluded.lock().unwrap() = excluded;
        Ok(())
    }

    async fn local_only_files(
        &self,
        _user_id: &UserId,
        _folder: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(self.local_only.lock().unwrap().clone())
    }

    async fn force_sync(&self, _user_id: &UserId, _folder: &str) -> anyhow::Result<()> {
        self.force_sync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync_progress(
        &self,
        _user_id: &UserId,
        _folder: &str,
    ) -> anyhow::Result<SyncProgressSample> {
        self.check_failure()?;
        Ok(*self.progress.lock().unwrap())
    }

    async fn file_sync_state(
        &self,
        _user_id: &UserId,
        _path: &str,
    ) -> anyhow::Result<FileSyncState> {
        Ok(FileSyncState::InSync)
    }

    async fn kfm_status(&self, user_id: &UserId) -> anyhow::Result<KfmStatus> {
        Ok(KfmStatus {
            user_id: user_id.clone(),
            desktop_redirected: true,
            documents_redirected: true,
            pictures_redirected: true,
            last_checked: Utc::now(),
        })
    }
}
