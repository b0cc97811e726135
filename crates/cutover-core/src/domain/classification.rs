//! Classification of user profiles and its audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::UserId;
use crate::errors::DomainError;

/// The effective classification of a user profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Recently used account with data worth backing up
    Active,
    /// Dormant account
    Inactive,
    /// Built-in system or service account
    System,
    /// Temporary profile
    Temporary,
    /// Profile that could not be read or is marked damaged
    Corrupted,
    /// Not yet classified, or insufficient signal
    Unknown,
}

impl Classification {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Active => "active",
            Classification::Inactive => "inactive",
            Classification::System => "system",
            Classification::Temporary => "temporary",
            Classification::Corrupted => "corrupted",
            Classification::Unknown => "unknown",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "active" => Ok(Classification::Active),
            "inactive" => Ok(Classification::Inactive),
            "system" => Ok(Classification::System),
            "temporary" => Ok(Classification::Temporary),
            "corrupted" => Ok(Classification::Corrupted),
            "unknown" => Ok(Classification::Unknown),
            other => Err(DomainError::UnknownEnumValue {
                kind: "Classification",
                value: other.to_string(),
            }),
        }
    }
}

/// The current classification decision for one user
///
/// At most one record per user is live; changes append a
/// [`ClassificationChange`] to the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    /// Which user this record classifies
    pub user_id: UserId,
    /// The decided classification
    pub classification: Classification,
    /// Confidence in the decision, 0.0 to 1.0
    pub confidence: f64,
    /// Human-readable reason (rule name, override note, ...)
    pub reason: String,
    /// Name of the rule set that produced the decision, if any
    pub rule_set_name: Option<String>,
    /// Version of that rule set
    pub rule_set_version: Option<String>,
    /// Informational activity score, 0 to 100
    pub activity_score: Option<u8>,
    /// Whether a manual override determined the outcome
    pub is_overridden: bool,
    /// When the record was first written
    pub created_at: DateTime<Utc>,
    /// When the record was last refreshed
    pub updated_at: DateTime<Utc>,
}

impl ClassificationRecord {
    /// Create a record, clamping confidence into `[0, 1]`
    pub fn new(
        user_id: UserId,
        classification: Classification,
        confidence: f64,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            classification,
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            rule_set_name: None,
            rule_set_version: None,
            activity_score: None,
            is_overridden: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One append-only history entry recording a classification change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationChange {
    /// Row id; `None` until persisted
    pub id: Option<i64>,
    /// Which user changed
    pub user_id: UserId,
    /// Previous classification, `None` on first classification
    pub old_classification: Option<Classification>,
    /// New classification
    pub new_classification: Classification,
    /// When the change was observed
    pub change_time: DateTime<Utc>,
    /// Why it changed
    pub reason: String,
    /// JSON snapshot of the decisive metrics at decision time
    pub activity_snapshot: serde_json::Value,
}

/// A manual classification override
///
/// While unexpired, the override wins over any rule-engine outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOverride {
    /// Which user the override applies to
    pub user_id: UserId,
    /// Forced classification
    pub target_classification: Classification,
    /// Operator who applied the override
    pub applied_by: String,
    /// Justification
    pub reason: String,
    /// When the override was applied
    pub applied_at: DateTime<Utc>,
    /// Optional expiry; `None` means it never expires
    pub expires_at: Option<DateTime<Utc>>,
}

impl ClassificationOverride {
    /// Whether the override has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_classification_round_trip() {
        for c in [
            Classification::Active,
            Classification::Inactive,
            Classification::System,
            Classification::Temporary,
            Classification::Corrupted,
            Classification::Unknown,
        ] {
            assert_eq!(Classification::parse(c.as_str()).unwrap(), c);
        }
    }

    #[test]
    fn test_classification_parse_rejects_unknown_text() {
        assert!(Classification::parse("archived").is_err());
    }

    #[test]
    fn test_record_clamps_confidence() {
        let user = UserId::new("S-1-5-21-1").unwrap();
        let record =
            ClassificationRecord::new(user.clone(), Classification::Active, 1.7, "test", now());
        assert_eq!(record.confidence, 1.0);
        let record = ClassificationRecord::new(user, Classification::Active, -0.5, "test", now());
        assert_eq!(record.confidence, 0.0);
    }

    #[test]
    fn test_override_expiry() {
        let over = ClassificationOverride {
            user_id: UserId::new("S-1-5-21-1").unwrap(),
            target_classification: Classification::Inactive,
            applied_by: "helpdesk".to_string(),
            reason: "user left the team".to_string(),
            applied_at: now(),
            expires_at: Some("2026-03-02T12:00:00Z".parse().unwrap()),
        };
        assert!(!over.is_expired(now()));
        assert!(over.is_expired("2026-03-02T12:00:00Z".parse().unwrap()));
        assert!(over.is_expired("2026-04-01T00:00:00Z".parse().unwrap()));
    }

    #[test]
    fn test_override_without_expiry_never_expires() {
        let over = ClassificationOverride {
            user_id: UserId::new("S-1-5-21-1").unwrap(),
            target_classification: Classification::Active,
            applied_by: "it".to_string(),
            reason: "vip".to_string(),
            applied_at: now(),
            expires_at: None,
        };
        assert!(!over.is_expired("2030-01-01T00:00:00Z".parse().unwrap()));
    }
}
