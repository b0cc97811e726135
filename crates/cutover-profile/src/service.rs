//! Profile service - discovery, classification and persistence
//!
//! Pulls profiles from the `ProfileDetector`, usage signals from the
//! `ActivitySource`, runs the decision ladder (override, fixed rules, rule
//! set) and persists the outcome. Every effective classification change
//! appends an immutable history entry with a snapshot of the decisive
//! metrics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cutover_core::domain::classification::{
    Classification, ClassificationChange, ClassificationOverride, ClassificationRecord,
};
use cutover_core::domain::newtypes::UserId;
use cutover_core::domain::profile::{ProfileMetrics, ProfileType, UserProfile};
use cutover_core::ports::{ActivitySource, Clock, DetectedProfile, ProfileDetector};
use cutover_core::ServiceError;
use cutover_store::StateStore;

use crate::requirements::{backup_requirement, BackupPolicy};
use crate::rules::{CompiledRuleSet, EvalContext, RuleSet};
use crate::score::activity_score;

/// Well-known system SIDs that never get user treatment
const SYSTEM_SIDS: [&str; 3] = ["S-1-5-18", "S-1-5-19", "S-1-5-20"];

/// SID prefixes of service and virtual accounts
const SERVICE_SID_PREFIXES: [&str; 2] = ["S-1-5-80-", "S-1-5-82-"];

/// Classification engine over profile metrics and rule sets
pub struct ProfileService {
    store: Arc<StateStore>,
    detector: Arc<dyn ProfileDetector>,
    activity: Arc<dyn ActivitySource>,
    clock: Arc<dyn Clock>,
    /// Swapped copy-on-write; readers clone the Arc and evaluate lock-free
    rule_set: RwLock<Arc<CompiledRuleSet>>,
    policy: BackupPolicy,
}

impl ProfileService {
    /// Create a service with the built-in rule set
    pub fn new(
        store: Arc<StateStore>,
        detector: Arc<dyn ProfileDetector>,
        activity: Arc<dyn ActivitySource>,
        clock: Arc<dyn Clock>,
        policy: BackupPolicy,
    ) -> Self {
        let builtin =
            CompiledRuleSet::compile(&RuleSet::builtin()).expect("builtin rule set compiles");
        Self {
            store,
            detector,
            activity,
            clock,
            rule_set: RwLock::new(Arc::new(builtin)),
            policy,
        }
    }

    /// Compile and install a new rule set
    ///
    /// Validation failures leave the current rule set in place.
    pub async fn load_rule_set(&self, ruleset: &RuleSet) -> Result<(), ServiceError> {
        let compiled = CompiledRuleSet::compile(ruleset)?;
        info!(name = %ruleset.name, version = %ruleset.version, "Installing rule set");
        *self.rule_set.write().await = Arc::new(compiled);
        Ok(())
    }

    // ========================================================================
    // Classification ladder
    // ========================================================================

    /// Classify one profile from its metrics
    ///
    /// Deterministic: the same profile, metrics, rule set, override and
    /// `now` always produce the same record, confidence included.
    pub async fn classify(
        &self,
        profile: &UserProfile,
        metrics: &ProfileMetrics,
        override_: Option<&ClassificationOverride>,
        now: DateTime<Utc>,
    ) -> ClassificationRecord {
        let score = activity_score(metrics, now);

        // 1. Manual override wins while unexpired.
        if let Some(over) = override_ {
            if !over.is_expired(now) {
                let mut record = ClassificationRecord::new(
                    profile.user_id.clone(),
                    over.target_classification,
                    1.0,
                    "manual override",
                    now,
                );
                record.is_overridden = true;
                record.activity_score = Some(score);
                return record;
            }
        }

        // 2. Fixed rules.
        if let Some(record) = self.fixed_rules(profile, metrics, score, now) {
            return record;
        }

        // 3. Rule set evaluation.
        let rule_set = self.rule_set.read().await.clone();
        let ctx = EvalContext {
            profile,
            metrics,
            activity_score: score,
            now,
        };
        let outcome = rule_set.evaluate(&ctx);

        let mut record = ClassificationRecord::new(
            profile.user_id.clone(),
            outcome.classification,
            outcome.confidence,
            outcome.reason,
            now,
        );
        record.rule_set_name = Some(rule_set.name().to_string());
        record.rule_set_version = Some(rule_set.version().to_string());
        record.activity_score = Some(score);
        record
    }

    fn fixed_rules(
        &self,
        profile: &UserProfile,
        metrics: &ProfileMetrics,
        score: u8,
        now: DateTime<Utc>,
    ) -> Option<ClassificationRecord> {
        let sid = profile.user_id.as_str();
        let is_system_sid = SYSTEM_SIDS.contains(&sid)
            || SERVICE_SID_PREFIXES.iter().any(|p| sid.starts_with(p));
        if is_system_sid || profile.profile_type == ProfileType::System {
            let mut record = ClassificationRecord::new(
                profile.user_id.clone(),
                Classification::System,
                1.0,
                "system or service account",
                now,
            );
            record.activity_score = Some(score);
            return Some(record);
        }

        let path = profile.profile_path.to_lowercase();
        if path.ends_with(".tmp")
            || path.ends_with(".temp")
            || profile.profile_type == ProfileType::Temporary
        {
            let mut record = ClassificationRecord::new(
                profile.user_id.clone(),
                Classification::Temporary,
                1.0,
                "temporary profile path",
                now,
            );
            record.activity_score = Some(score);
            return Some(record);
        }

        if !metrics.is_accessible || !metrics.errors.is_empty() {
            let reason = if metrics.is_accessible {
                format!("metric gathering errors: {}", metrics.errors.join("; "))
            } else {
                "profile directory is not accessible".to_string()
            };
            let mut record = ClassificationRecord::new(
                profile.user_id.clone(),
                Classification::Corrupted,
                0.9,
                reason,
                now,
            );
            record.activity_score = Some(score);
            return Some(record);
        }

        None
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Refresh every discoverable profile
    ///
    /// Per-profile failures are logged and skipped; one bad profile never
    /// stops the sweep.
    pub async fn refresh_all(&self) -> Result<Vec<ClassificationRecord>, ServiceError> {
        let detected = self
            .detector
            .enumerate_profiles()
            .await
            .map_err(|e| ServiceError::capability("profile_detector", e.to_string()))?;

        let mut records = Vec::with_capacity(detected.len());
        for profile in detected {
            let user_id = profile.user_id.clone();
            match self.refresh_one(profile).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Profile refresh failed");
                }
            }
        }
        Ok(records)
    }

    /// Refresh a single user by id
    pub async fn refresh_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ClassificationRecord>, ServiceError> {
        let detected = self
            .detector
            .resolve(user_id)
            .await
            .map_err(|e| ServiceError::capability("profile_detector", e.to_string()))?;
        match detected {
            Some(profile) => self.refresh_one(profile).await.map(Some),
            None => Ok(None),
        }
    }

    async fn refresh_one(
        &self,
        detected: DetectedProfile,
    ) -> Result<ClassificationRecord, ServiceError> {
        let now = self.clock.now();
        let metrics = self.gather_metrics(&detected).await;

        // Merge onto the stored profile, or create one on first sight.
        let mut profile = match self.store.get_profile(&detected.user_id).await? {
            Some(existing) => existing,
            None => UserProfile::new(
                detected.user_id.clone(),
                detected.user_name.clone(),
                detected.profile_path.clone(),
                detected.profile_type,
                now,
            ),
        };
        profile.user_name = detected.user_name;
        profile.profile_path = detected.profile_path;
        profile.profile_type = detected.profile_type;
        profile.profile_size_bytes = metrics.profile_size_bytes;
        profile.last_login = metrics.last_login;
        profile.updated_at = now;

        let override_ = match self.store.get_override(&detected.user_id).await? {
            Some(over) if over.is_expired(now) => {
                debug!(user_id = %detected.user_id, "Dropping expired override");
                self.store.delete_override(&detected.user_id).await?;
                None
            }
            other => other,
        };

        let record = self
            .classify(&profile, &metrics, override_.as_ref(), now)
            .await;

        self.persist(&mut profile, &metrics, record, now).await
    }

    async fn gather_metrics(&self, detected: &DetectedProfile) -> ProfileMetrics {
        let mut metrics = ProfileMetrics {
            is_loaded: detected.is_loaded,
            is_accessible: detected.is_accessible,
            ..ProfileMetrics::default()
        };

        metrics.profile_size_bytes = match detected.size_bytes {
            Some(size) => size,
            None if detected.is_accessible => {
                match self.detector.measure_profile_size(&detected.user_id).await {
                    Ok(size) => size,
                    Err(e) => {
                        metrics.errors.push(format!("size measurement failed: {e}"));
                        0
                    }
                }
            }
            None => 0,
        };

        match self.activity.snapshot(&detected.user_id).await {
            Ok(snapshot) => {
                metrics.last_login = snapshot.last_login;
                metrics.last_activity = snapshot.last_activity;
                metrics.active_process_count = snapshot.active_process_count;
                metrics.has_active_session = snapshot.has_active_session;
            }
            Err(e) => {
                metrics.errors.push(format!("activity source failed: {e}"));
            }
        }

        metrics
    }

    async fn persist(
        &self,
        profile: &mut UserProfile,
        metrics: &ProfileMetrics,
        mut record: ClassificationRecord,
        now: DateTime<Utc>,
    ) -> Result<ClassificationRecord, ServiceError> {
        let previous = self.store.get_classification(&profile.user_id).await?;

        if let Some(ref prev) = previous {
            record.created_at = prev.created_at;
        }

        // Apply backup requirements onto the profile.
        let requirement =
            backup_requirement(record.classification, profile, metrics, &self.policy, now);
        profile.is_active = record.classification == Classification::Active;
        profile
            .set_backup_requirement(requirement.requires_backup, requirement.priority, now)
            .map_err(|e| ServiceError::Policy(e.to_string()))?;

        self.store.save_profile(profile).await?;
        self.store.save_classification(&record).await?;

        let changed = previous
            .as_ref()
            .map(|p| p.classification != record.classification)
            .unwrap_or(true);
        if changed {
            let change = ClassificationChange {
                id: None,
                user_id: profile.user_id.clone(),
                old_classification: previous.map(|p| p.classification),
                new_classification: record.classification,
                change_time: now,
                reason: record.reason.clone(),
                activity_snapshot: serde_json::json!({
                    "profileSizeBytes": metrics.profile_size_bytes,
                    "lastLogin": metrics.last_login,
                    "lastActivity": metrics.last_activity,
                    "activeProcessCount": metrics.active_process_count,
                    "isLoaded": metrics.is_loaded,
                    "hasActiveSession": metrics.has_active_session,
                    "isAccessible": metrics.is_accessible,
                    "activityScore": record.activity_score,
                }),
            };
            self.store.append_classification_change(&change).await?;
            info!(
                user_id = %profile.user_id,
                classification = record.classification.as_str(),
                "Classification changed"
            );
        }

        Ok(record)
    }
}
