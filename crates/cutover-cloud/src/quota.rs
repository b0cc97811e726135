//! Quota evaluation, warnings and escalation
//!
//! `check_quota` derives a health band from the signed-in account's quota
//! and the user's estimated backup footprint. Warning creation is throttled
//! by a cooldown; a run of resolved warnings of the same type within the
//! horizon raises a single repeated-warnings escalation.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use cutover_core::domain::escalation::{EscalationKind, EscalationPriority};
use cutover_core::domain::newtypes::UserId;
use cutover_core::domain::quota::{
    QuotaHealth, QuotaStatus, QuotaWarning, QuotaWarningType, WarningLevel,
};
use cutover_core::ports::Clock;
use cutover_core::ServiceError;
use cutover_store::StateStore;

use crate::escalate::EscalationEngine;
use crate::status::CloudStatusService;

const MIB: u64 = 1024 * 1024;

/// Quota policy knobs (mirrors the `quota` config section)
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    /// Usage percentage that triggers a warning
    pub warning_pct: f64,
    /// Usage percentage that triggers critical health
    pub critical_pct: f64,
    /// Safety floor of free space to preserve, in MB
    pub min_free_mb: u64,
    /// Same-type warnings within this window collapse
    pub warning_cooldown: Duration,
    /// Resolved same-type warnings examined within this window
    pub repeated_warning_horizon: Duration,
    /// Resolved same-type warnings that trigger escalation
    pub repeated_warning_threshold: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            warning_pct: 80.0,
            critical_pct: 95.0,
            min_free_mb: 500,
            warning_cooldown: Duration::hours(24),
            repeated_warning_horizon: Duration::days(14),
            repeated_warning_threshold: 3,
        }
    }
}

/// Quota health assessment and warning throttling
pub struct QuotaService {
    status: Arc<CloudStatusService>,
    store: Arc<StateStore>,
    escalations: Arc<EscalationEngine>,
    clock: Arc<dyn Clock>,
    policy: QuotaPolicy,
}

impl QuotaService {
    /// Create the service
    pub fn new(
        status: Arc<CloudStatusService>,
        store: Arc<StateStore>,
        escalations: Arc<EscalationEngine>,
        clock: Arc<dyn Clock>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            status,
            store,
            escalations,
            clock,
            policy,
        }
    }

    /// Estimated MB of cloud space a user's backup will need
    ///
    /// Profile size plus a flat 10% overhead for manifests and versioning.
    fn required_mb(profile_size_bytes: u64) -> u64 {
        let size_mb = profile_size_bytes / MIB;
        size_mb + size_mb / 10
    }

    /// Evaluate quota health for one user
    ///
    /// Also persists the snapshot, raises or resolves warnings, and raises
    /// escalations per policy.
    pub async fn check_quota(&self, user_id: &UserId) -> Result<QuotaStatus, ServiceError> {
        let now = self.clock.now();
        let snapshot = self.status.get_status(user_id).await?;

        if !snapshot.is_installed || !snapshot.is_signed_in {
            let status = QuotaStatus::unknown(
                user_id.clone(),
                if snapshot.is_installed {
                    "OneDrive is not signed in"
                } else {
                    "OneDrive is not installed"
                },
            );
            self.store.save_quota_snapshot(&status, now).await?;
            return Ok(status);
        }

        let Some(account) = snapshot.account_info else {
            let status = QuotaStatus::unknown(user_id.clone(), "account quota is unavailable");
            self.store.save_quota_snapshot(&status, now).await?;
            return Ok(status);
        };

        let profile_size = self
            .store
            .get_profile(user_id)
            .await?
            .map(|p| p.profile_size_bytes)
            .unwrap_or(0);

        let total_mb = account.total_bytes / MIB;
        let used_mb = account.used_bytes / MIB;
        let available_mb = total_mb.saturating_sub(used_mb);
        let required_mb = Self::required_mb(profile_size);
        let usage_pct = if total_mb > 0 {
            (used_mb as f64 / total_mb as f64) * 100.0
        } else {
            100.0
        };

        let can_accommodate_backup = available_mb >= required_mb + self.policy.min_free_mb;
        let shortfall_mb = (required_mb + self.policy.min_free_mb).saturating_sub(available_mb);

        let health = if usage_pct >= 100.0 {
            QuotaHealth::Exceeded
        } else if !can_accommodate_backup || usage_pct >= self.policy.critical_pct {
            QuotaHealth::Critical
        } else if usage_pct >= self.policy.warning_pct || available_mb < self.policy.min_free_mb {
            QuotaHealth::Warning
        } else {
            QuotaHealth::Healthy
        };

        let mut status = QuotaStatus {
            user_id: user_id.clone(),
            health,
            total_mb,
            used_mb,
            available_mb,
            required_mb,
            shortfall_mb,
            usage_pct,
            can_accommodate_backup,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };
        self.annotate(&mut status);

        self.store.save_quota_snapshot(&status, now).await?;
        self.react(&status).await?;

        debug!(
            user_id = %user_id,
            health = health.as_str(),
            usage_pct = %format!("{usage_pct:.1}"),
            shortfall_mb,
            "Quota checked"
        );
        Ok(status)
    }

    fn annotate(&self, status: &mut QuotaStatus) {
        match status.health {
            QuotaHealth::Exceeded => {
                status.issues.push("cloud quota is fully consumed".to_string());
                status
                    .recommendations
                    .push("free space or request a quota increase before backup".to_string());
            }
            QuotaHealth::Critical => {
                if !status.can_accommodate_backup {
                    status.issues.push(format!(
                        "backup needs {} MB but only {} MB are available",
                        status.required_mb, status.available_mb
                    ));
                    status
                        .recommendations
                        .push("remove large unused files from OneDrive".to_string());
                }
                if status.usage_pct >= self.policy.critical_pct {
                    status
                        .issues
                        .push(format!("usage at {:.1}%", status.usage_pct));
                }
            }
            QuotaHealth::Warning => {
                status
                    .issues
                    .push(format!("usage at {:.1}%", status.usage_pct));
                status
                    .recommendations
                    .push("consider cleaning up before the migration deadline".to_string());
            }
            QuotaHealth::Healthy | QuotaHealth::Unknown => {}
        }
    }

    /// Create warnings/escalations (or resolve stale warnings) per health
    async fn react(&self, status: &QuotaStatus) -> Result<(), ServiceError> {
        let now = self.clock.now();
        match status.health {
            QuotaHealth::Critical | QuotaHealth::Exceeded => {
                self.raise_warning(
                    status,
                    QuotaWarningType::InsufficientBackupSpace,
                    WarningLevel::Critical,
                    "Backup does not fit in OneDrive",
                    format!(
                        "{} MB short of the space needed to back up this profile",
                        status.shortfall_mb
                    ),
                )
                .await?;

                self.escalations
                    .raise(
                        Some(&status.user_id),
                        EscalationKind::InsufficientSpace,
                        EscalationPriority::Critical,
                        "cloud quota cannot hold the planned backup",
                        serde_json::json!({
                            "requiredMb": status.required_mb,
                            "availableMb": status.available_mb,
                            "shortfallMb": status.shortfall_mb,
                            "usagePct": status.usage_pct,
                        }),
                    )
                    .await?;
            }
            QuotaHealth::Warning => {
                self.raise_warning(
                    status,
                    QuotaWarningType::HighUsage,
                    WarningLevel::Warning,
                    "OneDrive usage is high",
                    format!("usage at {:.1}% of quota", status.usage_pct),
                )
                .await?;
            }
            QuotaHealth::Healthy => {
                // The condition cleared: resolve anything still open.
                for mut warning in self.store.unresolved_warnings(&status.user_id).await? {
                    warning.resolve(now);
                    self.store.save_warning(&warning).await?;
                    info!(user_id = %status.user_id, warning = %warning.id, "Quota warning resolved");
                }
            }
            QuotaHealth::Unknown => {}
        }
        Ok(())
    }

    async fn raise_warning(
        &self,
        status: &QuotaStatus,
        warning_type: QuotaWarningType,
        level: WarningLevel,
        title: &str,
        message: String,
    ) -> Result<(), ServiceError> {
        let now = self.clock.now();

        // Throttle: an open warning of this type, or any warning of this
        // type within the cooldown, suppresses a new one.
        if let Some(latest) = self.store.latest_warning(&status.user_id, warning_type).await? {
            if !latest.is_resolved || now - latest.created_at < self.policy.warning_cooldown {
                debug!(
                    user_id = %status.user_id,
                    warning_type = warning_type.as_str(),
                    "Warning suppressed by cooldown"
                );
                return Ok(());
            }
        }

        let warning = QuotaWarning::new(
            status.user_id.clone(),
            warning_type,
            level,
            title,
            message,
            now,
        );
        self.store.save_warning(&warning).await?;
        info!(
            user_id = %status.user_id,
            warning_type = warning_type.as_str(),
            level = level.as_str(),
            "Quota warning raised"
        );

        self.escalate_repeats(&status.user_id, warning_type).await
    }

    /// Raise one escalation when warnings of a type keep recurring
    async fn escalate_repeats(
        &self,
        user_id: &UserId,
        warning_type: QuotaWarningType,
    ) -> Result<(), ServiceError> {
        let since = self.clock.now() - self.policy.repeated_warning_horizon;
        let resolved = self
            .store
            .resolved_warnings_since(user_id, warning_type, since)
            .await?;
        if (resolved.len() as u32) < self.policy.repeated_warning_threshold {
            return Ok(());
        }

        self.escalations
            .raise(
                Some(user_id),
                EscalationKind::RepeatedWarnings,
                EscalationPriority::High,
                format!(
                    "repeated {} warnings ({} in the last {} days)",
                    warning_type.as_str(),
                    resolved.len(),
                    self.policy.repeated_warning_horizon.num_days()
                ),
                serde_json::json!({
                    "warningType": warning_type.as_str(),
                    "resolvedCount": resolved.len(),
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalate::NullEscalationSink;
    use crate::testutil::{MockClock, MockConnector};
    use cutover_core::domain::profile::{ProfileType, UserProfile};
    use cutover_store::DatabasePool;

    const GIB: u64 = 1024 * MIB;

    fn user() -> UserId {
        UserId::new("S-1-5-21-100").unwrap()
    }

    struct Fixture {
        quota: QuotaService,
        store: Arc<StateStore>,
        clock: Arc<MockClock>,
        connector: Arc<MockConnector>,
    }

    async fn fixture(total_mb: u64, used_mb: u64, profile_size: u64) -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(StateStore::new(pool.pool().clone()));
        let clock = Arc::new(MockClock::new("2026-03-01T12:00:00Z"));
        let connector = Arc::new(MockConnector::signed_in(total_mb, used_mb));

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

        let mut profile = UserProfile::new(
            user(),
            "alice",
            r"C:\Users\alice",
            ProfileType::Domain,
            clock.now(),
        );
        profile.profile_size_bytes = profile_size;
        profile.is_active = true;
        store.save_profile(&profile).await.unwrap();

        Fixture {
            quota: QuotaService::new(
                status,
                store.clone(),
                escalations,
                clock.clone(),
                QuotaPolicy::default(),
            ),
            store,
            clock,
            connector,
        }
    }

    #[tokio::test]
    async fn test_healthy_user_gets_no_warnings() {
        // 1 GiB profile, 10 GB quota with 1 GB used: fits comfortably.
        let fx = fixture(10_000, 1_000, GIB).await;
        let status = fx.quota.check_quota(&user()).await.unwrap();

        assert_eq!(status.health, QuotaHealth::Healthy);
        assert!(status.can_accommodate_backup);
        assert_eq!(status.shortfall_mb, 0);
        assert!(fx.store.unresolved_warnings(&user()).await.unwrap().is_empty());
        assert!(fx.store.open_escalations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_high_usage_raises_exactly_one_warning() {
        // Small profile so the backup fits, but usage at 85%.
        let fx = fixture(10_000, 8_500, 500 * MIB).await;
        let status = fx.quota.check_quota(&user()).await.unwrap();

        assert_eq!(status.health, QuotaHealth::Warning);
        assert!(status.can_accommodate_backup);

        let warnings = fx.store.unresolved_warnings(&user()).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].warning_type, QuotaWarningType::HighUsage);
        assert_eq!(warnings[0].level, WarningLevel::Warning);
        assert!(fx.store.open_escalations().await.unwrap().is_empty());

        // A second check inside the cooldown does not duplicate it.
        fx.clock.advance(Duration::hours(1));
        fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(fx.store.unresolved_warnings(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_space_raises_warning_and_escalation() {
        // 8 GiB profile against 3 GB of free quota: cannot fit.
        let fx = fixture(10_000, 7_000, 8 * GIB).await;
        let status = fx.quota.check_quota(&user()).await.unwrap();

        assert_eq!(status.health, QuotaHealth::Critical);
        assert!(!status.can_accommodate_backup);
        assert!(status.shortfall_mb > 0);

        let warnings = fx.store.unresolved_warnings(&user()).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0].warning_type,
            QuotaWarningType::InsufficientBackupSpace
        );
        assert_eq!(warnings[0].level, WarningLevel::Critical);

        let escalations = fx.store.open_escalations().await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, EscalationKind::InsufficientSpace);
        assert_eq!(escalations[0].priority, EscalationPriority::Critical);
    }

    #[tokio::test]
    async fn test_critical_cooldown_collapses_escalations() {
        let fx = fixture(10_000, 7_000, 8 * GIB).await;

        fx.quota.check_quota(&user()).await.unwrap();
        let first = fx.store.open_escalations().await.unwrap();
        assert_eq!(first.len(), 1);
        let first_updated = first[0].updated_at;

        // Second critical check within the cooldown: still one escalation,
        // with its updated_at advanced.
        fx.clock.advance(Duration::hours(6));
        // The status cache TTL has passed, so this is a fresh evaluation.
        fx.quota.check_quota(&user()).await.unwrap();

        let after = fx.store.open_escalations().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, first[0].id);
        assert!(after[0].updated_at > first_updated);
    }

    #[tokio::test]
    async fn test_exceeded_quota() {
        let fx = fixture(10_000, 10_000, GIB).await;
        let status = fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(status.health, QuotaHealth::Exceeded);
    }

    #[tokio::test]
    async fn test_not_signed_in_is_unknown() {
        let fx = fixture(10_000, 1_000, GIB).await;
        fx.connector
            .signed_in
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let status = fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(status.health, QuotaHealth::Unknown);
        assert!(!status.can_accommodate_backup);
        assert!(!status.issues.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_resolved_warnings_escalate_once() {
        let fx = fixture(10_000, 8_500, 500 * MIB).await;

        // Seed three historical resolved HighUsage warnings inside the
        // horizon.
        for i in 0..3 {
            let mut warning = QuotaWarning::new(
                user(),
                QuotaWarningType::HighUsage,
                WarningLevel::Warning,
                "High usage",
                "historical",
                fx.clock.now() - Duration::days(10) + Duration::days(i),
            );
            warning.resolve(fx.clock.now() - Duration::days(9) + Duration::days(i));
            fx.store.save_warning(&warning).await.unwrap();
        }

        // A fresh check produces a new warning and the repeat escalation.
        let status = fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(status.health, QuotaHealth::Warning);

        let escalations = fx.store.open_escalations().await.unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, EscalationKind::RepeatedWarnings);
        assert!(escalations[0].description.contains("repeated"));
    }

    #[tokio::test]
    async fn test_recovered_health_resolves_open_warnings() {
        let fx = fixture(10_000, 8_500, 500 * MIB).await;
        fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(fx.store.unresolved_warnings(&user()).await.unwrap().len(), 1);

        // Usage drops well below the warning line.
        *fx.connector.used_mb.lock().unwrap() = 2_000;
        fx.clock.advance(Duration::minutes(6));

        let status = fx.quota.check_quota(&user()).await.unwrap();
        assert_eq!(status.health, QuotaHealth::Healthy);
        assert!(fx.store.unresolved_warnings(&user()).await.unwrap().is_empty());
    }
}
