//! Activity scoring
//!
//! A weighted 0-100 score summarizing how "alive" a profile looks. The
//! score is informational: rules may reference it via the `activityScore`
//! property, and it is persisted with each classification for operators.
//!
//! Weights: login recency up to 40, active processes up to 20, loaded
//! profile up to 15, recent file activity up to 15, size tier up to 10.

use chrono::{DateTime, Utc};

use cutover_core::domain::profile::ProfileMetrics;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Compute the activity score for one set of metrics
pub fn activity_score(metrics: &ProfileMetrics, now: DateTime<Utc>) -> u8 {
    let mut score = 0u32;

    score += match metrics.days_since_login(now) {
        Some(d) if d <= 1 => 40,
        Some(d) if d <= 7 => 30,
        Some(d) if d <= 30 => 20,
        Some(d) if d <= 90 => 10,
        _ => 0,
    };

    score += match metrics.active_process_count {
        0 => 0,
        1..=2 => 8,
        3..=5 => 14,
        _ => 20,
    };

    if metrics.is_loaded {
        score += 10;
    }
    if metrics.has_active_session {
        score += 5;
    }

    score += match metrics.days_since_activity(now) {
        Some(d) if d <= 1 => 15,
        Some(d) if d <= 7 => 10,
        Some(d) if d <= 30 => 5,
        _ => 0,
    };

    score += match metrics.profile_size_bytes {
        s if s >= 10 * GIB => 10,
        s if s >= GIB => 7,
        s if s >= 100 * MIB => 4,
        s if s >= 10 * MIB => 2,
        _ => 0,
    };

    score.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn days_ago(d: i64) -> DateTime<Utc> {
        now() - chrono::Duration::days(d)
    }

    #[test]
    fn test_fully_active_profile_scores_maximum() {
        let metrics = ProfileMetrics {
            profile_size_bytes: 20 * GIB,
            last_activity: Some(days_ago(0)),
            last_login: Some(days_ago(0)),
            active_process_count: 12,
            is_loaded: true,
            has_active_session: true,
            is_accessible: true,
            errors: Vec::new(),
        };
        assert_eq!(activity_score(&metrics, now()), 100);
    }

    #[test]
    fn test_empty_profile_scores_zero() {
        let metrics = ProfileMetrics::default();
        assert_eq!(activity_score(&metrics, now()), 0);
    }

    #[test]
    fn test_login_recency_tiers() {
        let base = ProfileMetrics::default();
        for (days, expected) in [(0, 40), (5, 30), (20, 20), (60, 10), (365, 0)] {
            let metrics = ProfileMetrics {
                last_login: Some(days_ago(days)),
                ..base.clone()
            };
            assert_eq!(activity_score(&metrics, now()), expected, "at {days} days");
        }
    }

    #[test]
    fn test_component_weights_are_bounded() {
        // Only processes: capped at 20
        let metrics = ProfileMetrics {
            active_process_count: 500,
            ..ProfileMetrics::default()
        };
        assert_eq!(activity_score(&metrics, now()), 20);

        // Only loaded + session: capped at 15
        let metrics = ProfileMetrics {
            is_loaded: true,
            has_active_session: true,
            ..ProfileMetrics::default()
        };
        assert_eq!(activity_score(&metrics, now()), 15);

        // Only size: capped at 10
        let metrics = ProfileMetrics {
            profile_size_bytes: 100 * GIB,
            ..ProfileMetrics::default()
        };
        assert_eq!(activity_score(&metrics, now()), 10);
    }

    #[test]
    fn test_score_is_deterministic() {
        let metrics = ProfileMetrics {
            profile_size_bytes: 2 * GIB,
            last_activity: Some(days_ago(3)),
            last_login: Some(days_ago(10)),
            active_process_count: 2,
            is_loaded: true,
            has_active_session: false,
            is_accessible: true,
            errors: Vec::new(),
        };
        let a = activity_score(&metrics, now());
        let b = activity_score(&metrics, now());
        assert_eq!(a, b);
        // 20 (login) + 8 (procs) + 10 (loaded) + 10 (activity) + 7 (size)
        assert_eq!(a, 55);
    }
}
