//! Orchestrator core: state machine, progress roll-up, delay policy, gate

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cutover_bus::ConnHub;
use cutover_cloud::{CloudStatusService, EscalationEngine, QuotaService};
use cutover_core::domain::backup::{
    BackupCategory, BackupOperation, MigrationPhase, MigrationState, OperationStatus,
};
use cutover_core::domain::escalation::{EscalationKind, EscalationPriority};
use cutover_core::domain::newtypes::UserId;
use cutover_core::domain::quota::QuotaHealth;
use cutover_core::ports::Clock;
use cutover_core::ServiceError;
use cutover_logging::{ActivityLevel, ActivityRecord, LogPipeline};
use cutover_profile::ProfileService;
use cutover_proto::message::{BackupRequest, CategoryResult, Envelope, RequestPriority, StatusUpdate};
use cutover_store::StateStore;

/// Delay reasons the policy recognizes
const RECOGNIZED_DELAY_REASONS: [&str; 3] = ["user_busy", "need_time", "other"];

/// Orchestration policy knobs (mirrors the `backup` and `delays` config)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Categories every user is expected to back up
    pub categories: Vec<BackupCategory>,
    /// Window from enqueue to the per-user deadline
    pub deadline_window: Duration,
    /// Delay budget per user
    pub max_delays: u32,
    /// Longest single delay a user may request
    pub max_single_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            categories: BackupCategory::all().to_vec(),
            deadline_window: Duration::days(7),
            max_delays: 3,
            max_single_delay: Duration::hours(24),
        }
    }
}

/// The machine-wide reset gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetGate {
    /// True iff no gating user remains outside `ReadyForReset`/`Completed`
    pub can_reset: bool,
    /// Users still blocking the reset
    pub blocking_users: Vec<UserId>,
    /// Users that have reached a gate-satisfying phase
    pub ready_users: Vec<UserId>,
    /// Number of gating users considered
    pub total_users: u32,
}

/// Coordinates per-user backup lifecycles and the reset gate
pub struct Orchestrator {
    store: Arc<StateStore>,
    cloud_status: Arc<CloudStatusService>,
    quota: Arc<QuotaService>,
    profiles: Arc<ProfileService>,
    escalations: Arc<EscalationEngine>,
    pipeline: Arc<LogPipeline>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    /// Set after the hub exists; broadcasts are skipped until then
    hub: OnceLock<Arc<ConnHub>>,
    /// When each delayed user's delay elapses
    delays: Mutex<HashMap<UserId, DateTime<Utc>>>,
    /// Consecutive critical quota checks per user (escalate on the second)
    quota_strikes: Mutex<HashMap<UserId, u32>>,
}

impl Orchestrator {
    /// Create the orchestrator
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        cloud_status: Arc<CloudStatusService>,
        quota: Arc<QuotaService>,
        profiles: Arc<ProfileService>,
        escalations: Arc<EscalationEngine>,
        pipeline: Arc<LogPipeline>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cloud_status,
            quota,
            profiles,
            escalations,
            pipeline,
            clock,
            config,
            hub: OnceLock::new(),
            delays: Mutex::new(HashMap::new()),
            quota_strikes: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the connection hub once it exists
    ///
    /// The hub is built after the orchestrator (its dispatcher carries
    /// handlers that reference the orchestrator), so the back-reference is
    /// installed late.
    pub fn attach_hub(&self, hub: Arc<ConnHub>) {
        if self.hub.set(hub).is_err() {
            warn!("Hub attached twice; keeping the first");
        }
    }

    async fn activity(&self, level: ActivityLevel, user: Option<&UserId>, message: String, fields: serde_json::Value) {
        let mut record = ActivityRecord::new(level, "orchestrator", message, self.clock.now());
        if let Some(user) = user {
            record = record.with_user(user.as_str());
        }
        if !fields.is_null() {
            record = record.with_fields(fields);
        }
        self.pipeline.log(record).await;
    }

    // ========================================================================
    // State machine entry points
    // ========================================================================

    /// Enter a user into the migration
    ///
    /// Returns `true` when the user moved to `Requested`; `false` when the
    /// cloud is not ready and the user stays in `NotStarted`.
    pub async fn enqueue_user(&self, user_id: &UserId) -> Result<bool, ServiceError> {
        let now = self.clock.now();
        let mut state = self.load_or_create_state(user_id, now).await?;

        if state.phase() != MigrationPhase::NotStarted {
            debug!(user_id = %user_id, phase = state.phase().as_str(), "User already enqueued");
            return Ok(true);
        }

        if !self.cloud_status.is_ready(user_id).await? {
            info!(user_id = %user_id, "Cloud not ready; user stays in NotStarted");
            return Ok(false);
        }

        self.transition(&mut state, MigrationPhase::Requested, "backup requested")
            .await?;
        self.send_backup_request(user_id, &state).await;
        Ok(true)
    }

    /// An agent announced itself for a user
    pub async fn agent_started(&self, user_id: &UserId) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let state = self.load_or_create_state(user_id, now).await?;

        if state.phase() == MigrationPhase::NotStarted {
            // The agent is up; ask for the backup if the cloud allows it.
            self.enqueue_user(user_id).await?;
        } else if state.phase() == MigrationPhase::Requested {
            // Remind a reconnecting agent what is expected of it.
            self.send_backup_request(user_id, &state).await;
        }

        self.publish_gate().await?;
        Ok(())
    }

    /// The agent began backing up the listed categories
    ///
    /// A narrower category list permanently narrows the set over which the
    /// user's overall progress is computed.
    pub async fn backup_started(
        &self,
        user_id: &UserId,
        categories: &[String],
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let mut state = self.load_or_create_state(user_id, now).await?;

        if state.phase() == MigrationPhase::NotStarted {
            // Unprompted but welcome; pass through Requested.
            self.transition(&mut state, MigrationPhase::Requested, "agent-initiated backup")
                .await?;
        }
        self.transition(&mut state, MigrationPhase::InProgress, "backup started")
            .await?;

        let effective = self.effective_categories(categories);
        for category in &effective {
            if self.store.backup_op(user_id, *category).await?.is_none() {
                let op = BackupOperation::new(user_id.clone(), *category, now);
                match self.store.save_backup_op(&op).await {
                    Ok(()) | Err(cutover_store::StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.refresh_overall_progress(user_id, &mut state).await?;
        self.activity(
            ActivityLevel::Info,
            Some(user_id),
            "backup started".to_string(),
            serde_json::json!({"categories": effective.iter().map(|c| c.as_str()).collect::<Vec<_>>()}),
        )
        .await;
        Ok(())
    }

    /// A per-category progress report arrived
    pub async fn backup_progress(
        &self,
        user_id: &UserId,
        category: BackupCategory,
        progress: u8,
        bytes_transferred: u64,
        bytes_total: u64,
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let mut state = self.load_or_create_state(user_id, now).await?;

        // Progress while delayed means the user resumed.
        if state.phase() == MigrationPhase::Delayed {
            self.transition(&mut state, MigrationPhase::InProgress, "user resumed")
                .await?;
            self.delays.lock().await.remove(user_id);
        }

        let mut op = match self.store.backup_op(user_id, category).await? {
            Some(op) => op,
            None => BackupOperation::new(user_id.clone(), category, now),
        };
        if op.status().is_terminal() {
            // Late report for a finished category; nothing to move.
            debug!(user_id = %user_id, category = category.as_str(), "Progress after terminal status ignored");
            return Ok(());
        }
        op.update_progress(progress, bytes_transferred, bytes_total, now)
            .map_err(|e| ServiceError::Policy(e.to_string()))?;
        self.store.save_backup_op(&op).await?;

        self.refresh_overall_progress(user_id, &mut state).await?;
        Ok(())
    }

    /// The agent reported backup completion
    pub async fn backup_completed(
        &self,
        user_id: &UserId,
        success: bool,
        category_results: &std::collections::BTreeMap<String, CategoryResult>,
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();
        let mut state = self.load_or_create_state(user_id, now).await?;

        for (name, result) in category_results {
            let Ok(category) = BackupCategory::parse(name) else {
                warn!(user_id = %user_id, category = %name, "Unknown category in completion report");
                continue;
            };
            let mut op = match self.store.backup_op(user_id, category).await? {
                Some(op) => op,
                None => BackupOperation::new(user_id.clone(), category, now),
            };
            if op.status().is_terminal() {
                continue;
            }
            let outcome = if result.success {
                op.complete(now)
            } else {
                op.fail(result.error.clone().unwrap_or_else(|| "category failed".to_string()), now)
            };
            outcome.map_err(|e| ServiceError::Policy(e.to_string()))?;
            self.store.save_backup_op(&op).await?;
        }

        self.refresh_overall_progress(user_id, &mut state).await?;

        if success && self.all_categories_completed(user_id).await? {
            self.transition(&mut state, MigrationPhase::ReadyForReset, "all categories backed up")
                .await?;
            self.activity(
                ActivityLevel::Info,
                Some(user_id),
                "user ready for reset".to_string(),
                serde_json::Value::Null,
            )
            .await;
        } else if !success {
            self.activity(
                ActivityLevel::Warn,
                Some(user_id),
                "backup completed with failures".to_string(),
                serde_json::json!({
                    "failed": category_results
                        .iter()
                        .filter(|(_, r)| !r.success)
                        .map(|(n, _)| n.clone())
                        .collect::<Vec<_>>(),
                }),
            )
            .await;
        }

        self.publish_gate().await?;
        Ok(())
    }

    /// A user asked to postpone their backup
    ///
    /// Returns the granted delay. Unrecognized reasons are rejected without
    /// consuming budget; an exhausted budget escalates.
    pub async fn delay_requested(
        &self,
        user_id: &UserId,
        reason: &str,
        requested: Duration,
    ) -> Result<Duration, ServiceError> {
        if !RECOGNIZED_DELAY_REASONS.contains(&reason) {
            return Err(ServiceError::Policy(format!(
                "unrecognized delay reason '{reason}'"
            )));
        }

        let now = self.clock.now();
        let mut state = self.load_or_create_state(user_id, now).await?;

        if state.delays_used() >= self.config.max_delays {
            self.escalations
                .raise(
                    Some(user_id),
                    EscalationKind::UserBusyExhausted,
                    EscalationPriority::Normal,
                    "delay budget exhausted",
                    serde_json::json!({"delaysUsed": state.delays_used(), "reason": reason}),
                )
                .await?;
            self.transition(&mut state, MigrationPhase::Escalated, "delay budget exhausted")
                .await?;
            return Err(ServiceError::Policy(
                "delay budget exhausted; escalated to IT".to_string(),
            ));
        }

        let mut granted = requested.min(self.config.max_single_delay);
        let remaining = state.deadline() - now;
        if remaining > Duration::zero() {
            granted = granted.min(remaining);
        }

        state.record_delay(granted, now);
        self.transition(&mut state, MigrationPhase::Delayed, reason).await?;
        self.delays.lock().await.insert(user_id.clone(), now + granted);

        self.activity(
            ActivityLevel::Info,
            Some(user_id),
            "delay granted".to_string(),
            serde_json::json!({
                "reason": reason,
                "grantedSeconds": granted.num_seconds(),
                "delaysUsed": state.delays_used(),
            }),
        )
        .await;
        Ok(granted)
    }

    /// A user acted in the agent UI
    pub async fn user_action(&self, user_id: &UserId, action: &str) -> Result<(), ServiceError> {
        match action {
            "resume" => {
                let now = self.clock.now();
                let mut state = self.load_or_create_state(user_id, now).await?;
                if state.phase() == MigrationPhase::Delayed {
                    self.transition(&mut state, MigrationPhase::InProgress, "user resumed")
                        .await?;
                    self.delays.lock().await.remove(user_id);
                }
            }
            other => {
                debug!(user_id = %user_id, action = other, "User action noted");
            }
        }
        Ok(())
    }

    /// An agent reported an error
    pub async fn error_reported(
        &self,
        user_id: &UserId,
        error_code: &str,
        message: &str,
        fatal: bool,
    ) -> Result<(), ServiceError> {
        self.activity(
            ActivityLevel::Error,
            Some(user_id),
            format!("agent error {error_code}"),
            serde_json::json!({"message": message, "fatal": fatal}),
        )
        .await;

        if fatal {
            let now = self.clock.now();
            let mut state = self.load_or_create_state(user_id, now).await?;
            self.escalations
                .raise(
                    Some(user_id),
                    EscalationKind::ServiceFault,
                    EscalationPriority::High,
                    format!("fatal agent error {error_code}"),
                    serde_json::json!({"message": message}),
                )
                .await?;
            if !state.phase().is_terminal() && state.phase() != MigrationPhase::Escalated {
                self.transition(&mut state, MigrationPhase::Escalated, "fatal agent error")
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Periodic evaluation
    // ========================================================================

    /// One evaluation pass over every gating user
    ///
    /// Refreshes classifications, enqueues newly gating users, resumes
    /// elapsed delays, escalates missed deadlines and repeated quota
    /// shortfalls, and republishes the gate.
    pub async fn evaluate(&self) -> Result<ResetGate, ServiceError> {
        let now = self.clock.now();

        if let Err(e) = self.profiles.refresh_all().await {
            warn!(error = %e, "Profile refresh failed during evaluation");
        }

        for profile in self.store.profiles_requiring_backup().await? {
            let user_id = profile.user_id.clone();
            if let Err(e) = self.evaluate_user(&user_id, now).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(user_id = %user_id, error = %e, "User evaluation failed");
            }
        }

        self.publish_gate().await
    }

    async fn evaluate_user(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<(), ServiceError> {
        let mut state = self.load_or_create_state(user_id, now).await?;

        if state.phase().is_terminal() {
            return Ok(());
        }

        // Newly gating users get enqueued as soon as the cloud is ready.
        if state.phase() == MigrationPhase::NotStarted {
            self.enqueue_user(user_id).await?;
            state = self.load_or_create_state(user_id, now).await?;
        }

        // Resume users whose delay has elapsed.
        if state.phase() == MigrationPhase::Delayed {
            let elapsed = self
                .delays
                .lock()
                .await
                .get(user_id)
                .map(|until| now >= *until)
                .unwrap_or(true);
            if elapsed {
                self.transition(&mut state, MigrationPhase::InProgress, "delay elapsed")
                    .await?;
                self.delays.lock().await.remove(user_id);
                self.send_backup_request(user_id, &state).await;
            }
        }

        // Missed deadline: hand the user to IT.
        if state.is_past_deadline(now) && state.phase() != MigrationPhase::Escalated {
            self.escalations
                .raise(
                    Some(user_id),
                    EscalationKind::UserBusyExhausted,
                    EscalationPriority::High,
                    "migration deadline missed",
                    serde_json::json!({"deadline": state.deadline()}),
                )
                .await?;
            self.transition(&mut state, MigrationPhase::Escalated, "deadline missed")
                .await?;
            return Ok(());
        }

        // Quota shortfall still present after one retry escalates the user.
        let quota = self.quota.check_quota(user_id).await?;
        let shortfall_persisted = {
            let mut strikes = self.quota_strikes.lock().await;
            if matches!(quota.health, QuotaHealth::Critical | QuotaHealth::Exceeded) {
                let count = strikes.entry(user_id.clone()).or_insert(0);
                *count += 1;
                *count >= 2
            } else {
                strikes.remove(user_id);
                false
            }
        };
        if shortfall_persisted && state.phase() != MigrationPhase::Escalated {
            self.transition(&mut state, MigrationPhase::Escalated, "quota shortfall persisted")
                .await?;
        }

        Ok(())
    }

    /// Run the evaluation loop until shutdown
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Orchestrator evaluation loop starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.evaluate().await {
                        Ok(gate) => {
                            debug!(can_reset = gate.can_reset, blocking = gate.blocking_users.len(), "Evaluation pass done");
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Fatal error in evaluation; requesting shutdown");
                            shutdown.cancel();
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Evaluation pass failed");
                        }
                    }
                }
            }
        }

        info!("Orchestrator evaluation loop stopped");
    }

    // ========================================================================
    // Reset gate
    // ========================================================================

    /// Compute the reset gate from persisted state
    pub async fn reset_gate(&self) -> Result<ResetGate, ServiceError> {
        let gating = self.store.profiles_requiring_backup().await?;
        let mut blocking = Vec::new();
        let mut ready = Vec::new();

        for profile in &gating {
            let satisfied = self
                .store
                .get_migration_state(&profile.user_id)
                .await?
                .map(|s| s.phase().satisfies_gate())
                .unwrap_or(false);
            if satisfied {
                ready.push(profile.user_id.clone());
            } else {
                blocking.push(profile.user_id.clone());
            }
        }

        Ok(ResetGate {
            can_reset: blocking.is_empty(),
            blocking_users: blocking,
            ready_users: ready,
            total_users: gating.len() as u32,
        })
    }

    /// Recompute the gate and broadcast a STATUS_UPDATE
    pub async fn publish_gate(&self) -> Result<ResetGate, ServiceError> {
        let gate = self.reset_gate().await?;

        let update = StatusUpdate {
            overall_status: if gate.can_reset { "ready" } else { "blocked" }.to_string(),
            blocking_users: gate.blocking_users.iter().map(|u| u.to_string()).collect(),
            ready_users: gate.ready_users.iter().map(|u| u.to_string()).collect(),
            total_users: gate.total_users,
        };

        if let Some(hub) = self.hub.get() {
            match Envelope::new(&update, self.clock.now()) {
                Ok(envelope) => hub.broadcast(&envelope).await,
                Err(e) => warn!(error = %e, "Status update did not serialize"),
            }
        }

        Ok(gate)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load_or_create_state(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<MigrationState, ServiceError> {
        if let Some(state) = self.store.get_migration_state(user_id).await? {
            return Ok(state);
        }
        let state = MigrationState::new(user_id.clone(), now + self.config.deadline_window, now);
        self.store.save_migration_state(&state).await?;
        Ok(state)
    }

    async fn transition(
        &self,
        state: &mut MigrationState,
        next: MigrationPhase,
        reason: &str,
    ) -> Result<(), ServiceError> {
        let from = state.phase();
        state
            .transition(next, self.clock.now())
            .map_err(|e| ServiceError::Policy(e.to_string()))?;
        self.store.save_migration_state(state).await?;

        if from != next {
            info!(
                user_id = %state.user_id(),
                from = from.as_str(),
                to = next.as_str(),
                reason,
                "Migration phase changed"
            );
            self.activity(
                ActivityLevel::Info,
                Some(&state.user_id().clone()),
                format!("phase {} -> {}", from.as_str(), next.as_str()),
                serde_json::json!({"reason": reason}),
            )
            .await;
            self.publish_gate().await?;
        }
        Ok(())
    }

    /// The category set used for a user's roll-up
    ///
    /// Categories named by the agent, filtered to the configured set; an
    /// empty or unparsable list falls back to the full configured set.
    fn effective_categories(&self, names: &[String]) -> Vec<BackupCategory> {
        let mut parsed: Vec<BackupCategory> = names
            .iter()
            .filter_map(|n| BackupCategory::parse(n).ok())
            .filter(|c| self.config.categories.contains(c))
            .collect();
        parsed.sort();
        parsed.dedup();
        if parsed.is_empty() {
            self.config.categories.clone()
        } else {
            parsed
        }
    }

    /// Overall progress = arithmetic mean over the user's operations
    ///
    /// Before any operation exists the user is at 0. Once `BACKUP_STARTED`
    /// has created operations (possibly for a narrower category list), the
    /// mean runs over exactly those.
    async fn refresh_overall_progress(
        &self,
        user_id: &UserId,
        state: &mut MigrationState,
    ) -> Result<(), ServiceError> {
        let ops = self.store.user_backup_ops(user_id).await?;
        let overall = if ops.is_empty() {
            0
        } else {
            let sum: u32 = ops.iter().map(|op| op.progress() as u32).sum();
            (sum / ops.len() as u32) as u8
        };
        state.set_overall_progress(overall, self.clock.now());
        self.store.save_migration_state(state).await?;
        Ok(())
    }

    async fn all_categories_completed(&self, user_id: &UserId) -> Result<bool, ServiceError> {
        let ops = self.store.user_backup_ops(user_id).await?;
        Ok(!ops.is_empty() && ops.iter().all(|op| op.status() == OperationStatus::Completed))
    }

    async fn send_backup_request(&self, user_id: &UserId, state: &MigrationState) {
        let Some(hub) = self.hub.get() else {
            return;
        };
        let request = BackupRequest {
            user_id: user_id.to_string(),
            priority: RequestPriority::Normal,
            deadline: state.deadline(),
            categories: self
                .config
                .categories
                .iter()
                .map(|c| c.as_str().to_string())
                .collect(),
        };
        match Envelope::new(&request, self.clock.now()) {
            Ok(envelope) => {
                if let Err(e) = hub.send_to_user(user_id, &envelope).await {
                    debug!(user_id = %user_id, error = %e, "Backup request not deliverable");
                }
            }
            Err(e) => warn!(error = %e, "Backup request did not serialize"),
        }
    }
}
