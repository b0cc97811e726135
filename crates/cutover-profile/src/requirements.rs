//! Backup requirements derived from a classification
//!
//! Active users always back up; Inactive users only when policy says so and
//! their profile is big enough to matter; System, Temporary, Corrupted and
//! Unknown never do. Priority is a fixed function of size, login recency,
//! loaded state and profile type, clamped to 1-999.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cutover_core::domain::classification::Classification;
use cutover_core::domain::profile::{ProfileMetrics, ProfileType, UserProfile};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Policy knobs for backup requirement decisions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPolicy {
    /// Whether Inactive users are backed up at all
    pub backup_inactive: bool,
    /// Minimum profile size (MB) for an Inactive user to qualify
    pub inactive_min_size_mb: u64,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self {
            backup_inactive: false,
            inactive_min_size_mb: 100,
        }
    }
}

/// The backup decision for one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRequirement {
    /// Whether a backup is required before reset
    pub requires_backup: bool,
    /// Ordering priority, 1-999 (0 when no backup is required)
    pub priority: u16,
}

/// Decide backup requirements for a classified profile
pub fn backup_requirement(
    classification: Classification,
    profile: &UserProfile,
    metrics: &ProfileMetrics,
    policy: &BackupPolicy,
    now: DateTime<Utc>,
) -> BackupRequirement {
    let requires_backup = match classification {
        Classification::Active => true,
        Classification::Inactive => {
            policy.backup_inactive && metrics.profile_size_mb() >= policy.inactive_min_size_mb
        }
        Classification::System
        | Classification::Temporary
        | Classification::Corrupted
        | Classification::Unknown => false,
    };

    if !requires_backup {
        return BackupRequirement {
            requires_backup: false,
            priority: 0,
        };
    }

    BackupRequirement {
        requires_backup: true,
        priority: priority_for(profile, metrics, now),
    }
}

fn priority_for(profile: &UserProfile, metrics: &ProfileMetrics, now: DateTime<Utc>) -> u16 {
    let mut priority: u32 = 400;

    priority += match metrics.profile_size_bytes {
        s if s >= 10 * GIB => 150,
        s if s >= GIB => 100,
        s if s >= 100 * MIB => 50,
        _ => 0,
    };

    priority += match metrics.days_since_login(now) {
        Some(d) if d <= 7 => 200,
        Some(d) if d <= 30 => 100,
        Some(d) if d <= 90 => 50,
        _ => 0,
    };

    if metrics.is_loaded {
        priority += 100;
    }

    priority += match profile.profile_type {
        ProfileType::AzureAd | ProfileType::Hybrid => 50,
        ProfileType::Domain => 25,
        _ => 0,
    };

    priority.clamp(1, 999) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use cutover_core::domain::newtypes::UserId;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn profile(profile_type: ProfileType) -> UserProfile {
        UserProfile::new(
            UserId::new("S-1-5-21-1").unwrap(),
            "alice",
            r"C:\Users\alice",
            profile_type,
            now(),
        )
    }

    fn busy_metrics() -> ProfileMetrics {
        ProfileMetrics {
            profile_size_bytes: 12 * GIB,
            last_activity: Some(now()),
            last_login: Some(now() - chrono::Duration::days(2)),
            active_process_count: 6,
            is_loaded: true,
            has_active_session: true,
            is_accessible: true,
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_active_user_requires_backup_with_high_priority() {
        let p = profile(ProfileType::AzureAd);
        let decision = backup_requirement(
            Classification::Active,
            &p,
            &busy_metrics(),
            &BackupPolicy::default(),
            now(),
        );
        assert!(decision.requires_backup);
        // 400 + 150 + 200 + 100 + 50 = 900
        assert_eq!(decision.priority, 900);
    }

    #[test]
    fn test_priority_never_exceeds_999() {
        let p = profile(ProfileType::AzureAd);
        let decision = backup_requirement(
            Classification::Active,
            &p,
            &busy_metrics(),
            &BackupPolicy::default(),
            now(),
        );
        assert!(decision.priority <= 999);
    }

    #[test]
    fn test_inactive_excluded_by_default_policy() {
        let p = profile(ProfileType::Domain);
        let decision = backup_requirement(
            Classification::Inactive,
            &p,
            &busy_metrics(),
            &BackupPolicy::default(),
            now(),
        );
        assert!(!decision.requires_backup);
        assert_eq!(decision.priority, 0);
    }

    #[test]
    fn test_inactive_included_when_policy_allows_and_big_enough() {
        let p = profile(ProfileType::Domain);
        let policy = BackupPolicy {
            backup_inactive: true,
            inactive_min_size_mb: 100,
        };
        let decision =
            backup_requirement(Classification::Inactive, &p, &busy_metrics(), &policy, now());
        assert!(decision.requires_backup);

        let small = ProfileMetrics {
            profile_size_bytes: 10 * MIB,
            ..busy_metrics()
        };
        let decision = backup_requirement(Classification::Inactive, &p, &small, &policy, now());
        assert!(!decision.requires_backup);
    }

    #[test]
    fn test_exempt_classifications_never_require_backup() {
        let p = profile(ProfileType::System);
        for classification in [
            Classification::System,
            Classification::Temporary,
            Classification::Corrupted,
            Classification::Unknown,
        ] {
            let decision = backup_requirement(
                classification,
                &p,
                &busy_metrics(),
                &BackupPolicy {
                    backup_inactive: true,
                    inactive_min_size_mb: 0,
                },
                now(),
            );
            assert!(!decision.requires_backup, "{classification:?}");
        }
    }
}
