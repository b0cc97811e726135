//! Integration tests for the orchestrator
//!
//! These wire the orchestrator to an in-memory store, scripted cloud and
//! profile capabilities, and a deterministic clock, then drive it with the
//! same calls the message handlers make.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

use cutover_cloud::escalate::NullEscalationSink;
use cutover_cloud::quota::QuotaPolicy;
use cutover_cloud::{CloudStatusService, EscalationEngine, QuotaService};
use cutover_core::domain::backup::{BackupCategory, MigrationPhase, OperationStatus};
use cutover_core::domain::cloud::{CloudAccountInfo, KfmStatus, SyncStatus};
use cutover_core::domain::escalation::EscalationKind;
use cutover_core::domain::newtypes::UserId;
use cutover_core::domain::profile::{ProfileType, UserProfile};
use cutover_core::domain::quota::QuotaWarningType;
use cutover_core::ports::{
    ActivitySnapshot, ActivitySource, Clock, CloudConnector, DetectedProfile, FileSyncState,
    ProfileDetector, SyncProgressSample,
};
use cutover_logging::LogPipeline;
use cutover_orchestrator::{Orchestrator, OrchestratorConfig};
use cutover_profile::{BackupPolicy, ProfileService};
use cutover_proto::message::CategoryResult;
use cutover_store::{DatabasePool, StateStore};

// ============================================================================
// Test doubles
// ============================================================================

struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new("2026-03-01T12:00:00Z".parse().unwrap()),
        })
    }

    fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Cloud connector with per-user quota scripting
#[derive(Default)]
struct TestConnector {
    ready: std::sync::atomic::AtomicBool,
    /// user id -> (total_mb, used_mb)
    quotas: Mutex<HashMap<String, (u64, u64)>>,
}

impl TestConnector {
    fn ready() -> Arc<Self> {
        let connector = Arc::new(Self::default());
        connector.ready.store(true, std::sync::atomic::Ordering::SeqCst);
        connector
    }

    fn set_quota(&self, user: &UserId, total_mb: u64, used_mb: u64) {
        self.quotas
            .lock()
            .unwrap()
            .insert(user.to_string(), (total_mb, used_mb));
    }

    fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CloudConnector for TestConnector {
    async fn is_installed(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(self.is_ready())
    }
    async fn is_running(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(self.is_ready())
    }
    async fn is_signed_in(&self, _user_id: &UserId) -> anyhow::Result<bool> {
        Ok(self.is_ready())
    }
    async fn sync_status(&self, _user_id: &UserId) -> anyhow::Result<SyncStatus> {
        Ok(SyncStatus::UpToDate)
    }
    async fn account_info(&self, user_id: &UserId) -> anyhow::Result<Option<CloudAccountInfo>> {
        let (total_mb, used_mb) = self
            .quotas
            .lock()
            .unwrap()
            .get(user_id.as_str())
            .copied()
            .unwrap_or((10_000, 1_000));
        Ok(Some(CloudAccountInfo {
            account_id: Some("biz1".to_string()),
            email: format!("{user_id}@contoso.com"),
            total_bytes: total_mb * 1024 * 1024,
            used_bytes: used_mb * 1024 * 1024,
        }))
    }
    async fn primary_sync_folder(&self, _user_id: &UserId) -> anyhow::Result<Option<String>> {
        Ok(Some(r"C:\Users\u\OneDrive - Contoso".to_string()))
    }
    async fn excluded_folders(&self, _u: &UserId, _a: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn set_excluded_folders(
        &self,
        _u: &UserId,
        _a: &str,
        _e: Vec<String>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    async fn local_only_files(&self, _u: &UserId, _f: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn force_sync(&self, _u: &UserId, _f: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn sync_progress(&self, _u: &UserId, _f: &str) -> anyhow::Result<SyncProgressSample> {
        Ok(SyncProgressSample::default())
    }
    async fn file_sync_state(&self, _u: &UserId, _p: &str) -> anyhow::Result<FileSyncState> {
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

struct EmptyDetector;

#[async_trait::async_trait]
impl ProfileDetector for EmptyDetector {
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

struct EmptyActivity;

#[async_trait::async_trait]
impl ActivitySource for EmptyActivity {
    async fn snapshot(&self, _user_id: &UserId) -> anyhow::Result<ActivitySnapshot> {
        Ok(ActivitySnapshot::default())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    store: Arc<StateStore>,
    clock: Arc<TestClock>,
    connector: Arc<TestConnector>,
}

async fn fixture() -> Fixture {
    let pool = DatabasePool::in_memory().await.unwrap();
    let store = Arc::new(StateStore::new(pool.pool().clone()));
    let clock = TestClock::new();
    let connector = TestConnector::ready();

    let status = Arc::new(CloudStatusService::new(
        connector.clone(),
        store.clone(),
        clock.clone(),
        Duration::minutes(5),
    ));
    let escalations = Arc::new(EscalationEngine::new(
        store.clone(),
        Arc::new(NullEscalationSink),
        clock.clone(),
    ));
    let quota = Arc::new(QuotaService::new(
        status.clone(),
        store.clone(),
        escalations.clone(),
        clock.clone(),
        QuotaPolicy::default(),
    ));
    let profiles = Arc::new(ProfileService::new(
        store.clone(),
        Arc::new(EmptyDetector),
        Arc::new(EmptyActivity),
        clock.clone(),
        BackupPolicy::default(),
    ));

    let orchestrator = Orchestrator::new(
        store.clone(),
        status,
        quota,
        profiles,
        escalations,
        Arc::new(LogPipeline::new()),
        clock.clone(),
        OrchestratorConfig::default(),
    );

    Fixture {
        orchestrator,
        store,
        clock,
        connector,
    }
}

fn user(n: u32) -> UserId {
    UserId::new(format!("S-1-5-21-200-{n}")).unwrap()
}

impl Fixture {
    /// Seed a gating user: active, requires backup, with a profile size
    async fn seed_user(&self, n: u32, size_bytes: u64) -> UserId {
        let uid = user(n);
        let now = self.clock.now();
        let mut profile = UserProfile::new(
            uid.clone(),
            format!("user{n}"),
            format!(r"C:\Users\user{n}"),
            ProfileType::Domain,
            now,
        );
        profile.profile_size_bytes = size_bytes;
        profile.is_active = true;
        profile.set_backup_requirement(true, 500, now).unwrap();
        self.store.save_profile(&profile).await.unwrap();
        uid
    }

    async fn phase(&self, uid: &UserId) -> MigrationPhase {
        self.store
            .get_migration_state(uid)
            .await
            .unwrap()
            .unwrap()
            .phase()
    }

    async fn complete_backup(&self, uid: &UserId, categories: &[&str]) {
        let names: Vec<String> = categories.iter().map(|c| c.to_string()).collect();
        self.orchestrator.backup_started(uid, &names).await.unwrap();
        let mut results = BTreeMap::new();
        for name in &names {
            results.insert(
                name.clone(),
                CategoryResult {
                    success: true,
                    item_count: Some(10),
                    error: None,
                },
            );
        }
        self.orchestrator
            .backup_completed(uid, true, &results)
            .await
            .unwrap();
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

fn all_categories() -> Vec<String> {
    BackupCategory::all()
        .iter()
        .map(|c| c.as_str().to_string())
        .collect()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_happy_path_reaches_ready_for_reset() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;

    assert!(fx.orchestrator.enqueue_user(&uid).await.unwrap());
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Requested);

    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::InProgress);

    // Gate stays closed while the backup runs.
    let gate = fx.orchestrator.reset_gate().await.unwrap();
    assert!(!gate.can_reset);
    assert_eq!(gate.blocking_users, vec![uid.clone()]);

    for category in BackupCategory::all() {
        fx.orchestrator
            .backup_progress(&uid, category, 50, 500, 1_000)
            .await
            .unwrap();
    }
    let state = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    assert_eq!(state.overall_progress(), 50);

    let mut results = BTreeMap::new();
    for category in BackupCategory::all() {
        results.insert(
            category.as_str().to_string(),
            CategoryResult {
                success: true,
                item_count: Some(100),
                error: None,
            },
        );
    }
    fx.orchestrator
        .backup_completed(&uid, true, &results)
        .await
        .unwrap();

    assert_eq!(fx.phase(&uid).await, MigrationPhase::ReadyForReset);
    let state = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    assert_eq!(state.overall_progress(), 100);

    let gate = fx.orchestrator.reset_gate().await.unwrap();
    assert!(gate.can_reset);
    assert_eq!(gate.ready_users, vec![uid]);
}

#[tokio::test]
async fn test_enqueue_blocked_while_cloud_not_ready() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.connector
        .ready
        .store(false, std::sync::atomic::Ordering::SeqCst);

    assert!(!fx.orchestrator.enqueue_user(&uid).await.unwrap());
    assert_eq!(fx.phase(&uid).await, MigrationPhase::NotStarted);

    // Cloud comes back; the evaluation pass picks the user up.
    fx.connector
        .ready
        .store(true, std::sync::atomic::Ordering::SeqCst);
    fx.clock.advance(Duration::minutes(6)); // age out the status cache
    fx.orchestrator.evaluate().await.unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Requested);
}

#[tokio::test]
async fn test_narrowed_category_list_drives_progress_and_completion() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();

    // The agent only backs up files and email.
    fx.orchestrator
        .backup_started(&uid, &["files".to_string(), "email".to_string()])
        .await
        .unwrap();

    let ops = fx.store.user_backup_ops(&uid).await.unwrap();
    assert_eq!(ops.len(), 2);

    fx.orchestrator
        .backup_progress(&uid, BackupCategory::Files, 80, 800, 1_000)
        .await
        .unwrap();
    let state = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    // Mean over the narrowed set {files: 80, email: 0}.
    assert_eq!(state.overall_progress(), 40);

    let mut results = BTreeMap::new();
    for name in ["files", "email"] {
        results.insert(
            name.to_string(),
            CategoryResult {
                success: true,
                item_count: None,
                error: None,
            },
        );
    }
    fx.orchestrator
        .backup_completed(&uid, true, &results)
        .await
        .unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::ReadyForReset);
}

#[tokio::test]
async fn test_progress_is_monotone_per_category() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &["files".to_string()])
        .await
        .unwrap();

    fx.orchestrator
        .backup_progress(&uid, BackupCategory::Files, 60, 600, 1_000)
        .await
        .unwrap();
    // An out-of-order lower report does not move progress backwards.
    fx.orchestrator
        .backup_progress(&uid, BackupCategory::Files, 30, 300, 1_000)
        .await
        .unwrap();

    let op = fx
        .store
        .backup_op(&uid, BackupCategory::Files)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.progress(), 60);
    assert_eq!(op.status(), OperationStatus::InProgress);
}

#[tokio::test]
async fn test_partial_failure_keeps_user_blocking() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &["files".to_string(), "email".to_string()])
        .await
        .unwrap();

    let mut results = BTreeMap::new();
    results.insert(
        "files".to_string(),
        CategoryResult {
            success: true,
            item_count: None,
            error: None,
        },
    );
    results.insert(
        "email".to_string(),
        CategoryResult {
            success: false,
            item_count: None,
            error: Some("pst locked".to_string()),
        },
    );
    fx.orchestrator
        .backup_completed(&uid, false, &results)
        .await
        .unwrap();

    assert_eq!(fx.phase(&uid).await, MigrationPhase::InProgress);
    assert!(!fx.orchestrator.reset_gate().await.unwrap().can_reset);
}

// ============================================================================
// Delay policy
// ============================================================================

#[tokio::test]
async fn test_delay_grants_consume_budget_and_extend_deadline() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();

    let before = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    let granted = fx
        .orchestrator
        .delay_requested(&uid, "user_busy", Duration::hours(4))
        .await
        .unwrap();
    assert_eq!(granted, Duration::hours(4));

    let after = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    assert_eq!(after.phase(), MigrationPhase::Delayed);
    assert_eq!(after.delays_used(), 1);
    assert_eq!(after.deadline(), before.deadline() + Duration::hours(4));
}

#[tokio::test]
async fn test_single_delay_capped_at_policy_maximum() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();

    let granted = fx
        .orchestrator
        .delay_requested(&uid, "need_time", Duration::hours(72))
        .await
        .unwrap();
    assert_eq!(granted, Duration::hours(24));
}

#[tokio::test]
async fn test_unrecognized_reason_rejected_without_spending_budget() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();

    let err = fx
        .orchestrator
        .delay_requested(&uid, "feeling_lazy", Duration::hours(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "POLICY");

    let state = fx.store.get_migration_state(&uid).await.unwrap().unwrap();
    assert_eq!(state.delays_used(), 0);
    assert_eq!(state.phase(), MigrationPhase::InProgress);
}

#[tokio::test]
async fn test_exhausted_delay_budget_escalates() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();

    for _ in 0..3 {
        fx.orchestrator
            .delay_requested(&uid, "user_busy", Duration::hours(1))
            .await
            .unwrap();
        // Resume so the next delay starts from InProgress.
        fx.orchestrator.user_action(&uid, "resume").await.unwrap();
    }

    let err = fx
        .orchestrator
        .delay_requested(&uid, "user_busy", Duration::hours(1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "POLICY");
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Escalated);

    let escalation = fx
        .store
        .open_escalation(Some(&uid), EscalationKind::UserBusyExhausted)
        .await
        .unwrap();
    assert!(escalation.is_some());
}

#[tokio::test]
async fn test_elapsed_delay_resumes_on_evaluation() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();
    fx.orchestrator
        .backup_started(&uid, &all_categories())
        .await
        .unwrap();
    fx.orchestrator
        .delay_requested(&uid, "user_busy", Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Delayed);

    // Not elapsed yet.
    fx.clock.advance(Duration::hours(1));
    fx.orchestrator.evaluate().await.unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Delayed);

    // Elapsed.
    fx.clock.advance(Duration::hours(2));
    fx.orchestrator.evaluate().await.unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::InProgress);
}

// ============================================================================
// Escalation triggers
// ============================================================================

#[tokio::test]
async fn test_fatal_error_report_escalates() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();

    fx.orchestrator
        .error_reported(&uid, "FATAL", "agent cannot continue", true)
        .await
        .unwrap();

    assert_eq!(fx.phase(&uid).await, MigrationPhase::Escalated);
    assert!(fx
        .store
        .open_escalation(Some(&uid), EscalationKind::ServiceFault)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_nonfatal_error_report_does_not_escalate() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();

    fx.orchestrator
        .error_reported(&uid, "E_RETRY", "transient problem", false)
        .await
        .unwrap();

    assert_eq!(fx.phase(&uid).await, MigrationPhase::Requested);
}

#[tokio::test]
async fn test_missed_deadline_escalates_on_evaluation() {
    let fx = fixture().await;
    let uid = fx.seed_user(1, GIB).await;
    fx.orchestrator.enqueue_user(&uid).await.unwrap();

    fx.clock.advance(Duration::days(8));
    fx.orchestrator.evaluate().await.unwrap();

    assert_eq!(fx.phase(&uid).await, MigrationPhase::Escalated);
    assert!(fx
        .store
        .open_escalation(Some(&uid), EscalationKind::UserBusyExhausted)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_persistent_quota_shortfall_escalates_user() {
    let fx = fixture().await;
    // 8 GiB profile against 3 GB free: critical shortfall.
    let uid = fx.seed_user(3, 8 * GIB).await;
    fx.connector.set_quota(&uid, 10_000, 7_000);
    fx.orchestrator.enqueue_user(&uid).await.unwrap();

    // First critical check: strike one, no phase change.
    fx.orchestrator.evaluate().await.unwrap();
    assert_ne!(fx.phase(&uid).await, MigrationPhase::Escalated);

    // Second critical check after the cache expires: escalated.
    fx.clock.advance(Duration::minutes(6));
    fx.orchestrator.evaluate().await.unwrap();
    assert_eq!(fx.phase(&uid).await, MigrationPhase::Escalated);
}

// ============================================================================
// Multi-user reset gate
// ============================================================================

#[tokio::test]
async fn test_multi_user_gate_and_quota_outcomes() {
    let fx = fixture().await;

    // u1 healthy, u2 high usage, u3 insufficient space.
    let u1 = fx.seed_user(1, GIB).await;
    let u2 = fx.seed_user(2, 500 * 1024 * 1024).await;
    let u3 = fx.seed_user(3, 8 * GIB).await;
    fx.connector.set_quota(&u1, 10_000, 1_000);
    fx.connector.set_quota(&u2, 10_000, 8_500);
    fx.connector.set_quota(&u3, 10_000, 7_000);

    fx.orchestrator.evaluate().await.unwrap();

    // u1: no warnings.
    assert!(fx.store.unresolved_warnings(&u1).await.unwrap().is_empty());

    // u2: exactly one high-usage warning, no escalation.
    let warnings = fx.store.unresolved_warnings(&u2).await.unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].warning_type, QuotaWarningType::HighUsage);
    assert!(fx
        .store
        .open_escalation(Some(&u2), EscalationKind::InsufficientSpace)
        .await
        .unwrap()
        .is_none());

    // u3: insufficient-space warning plus escalation.
    let warnings = fx.store.unresolved_warnings(&u3).await.unwrap();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].warning_type,
        QuotaWarningType::InsufficientBackupSpace
    );
    assert!(fx
        .store
        .open_escalation(Some(&u3), EscalationKind::InsufficientSpace)
        .await
        .unwrap()
        .is_some());

    // u1 and u2 can still complete their backups; u3 cannot.
    fx.complete_backup(&u1, &["files", "browsers", "email", "system"]).await;
    fx.complete_backup(&u2, &["files", "browsers", "email", "system"]).await;

    let gate = fx.orchestrator.reset_gate().await.unwrap();
    assert!(!gate.can_reset);
    assert_eq!(gate.blocking_users, vec![u3.clone()]);
    assert_eq!(gate.total_users, 3);
    assert!(gate.ready_users.contains(&u1));
    assert!(gate.ready_users.contains(&u2));
}

#[tokio::test]
async fn test_gate_never_open_with_unfinished_gating_user() {
    let fx = fixture().await;
    let u1 = fx.seed_user(1, GIB).await;
    let u2 = fx.seed_user(2, GIB).await;

    // Drive u1 through every phase; the gate must stay shut while u2 is
    // untouched.
    fx.orchestrator.enqueue_user(&u1).await.unwrap();
    assert!(!fx.orchestrator.reset_gate().await.unwrap().can_reset);
    fx.complete_backup(&u1, &["files", "browsers", "email", "system"]).await;
    assert!(!fx.orchestrator.reset_gate().await.unwrap().can_reset);

    fx.complete_backup(&u2, &["files", "browsers", "email", "system"]).await;
    let gate = fx.orchestrator.reset_gate().await.unwrap();
    assert!(gate.can_reset);
    assert_eq!(gate.total_users, 2);
}
