//! Quota health assessment and warnings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{UserId, WarningId};
use crate::errors::DomainError;

/// Health band derived from a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaHealth {
    /// Plenty of room
    Healthy,
    /// Usage above the warning threshold
    Warning,
    /// Backup cannot be accommodated, or usage above the critical threshold
    Critical,
    /// Quota fully consumed
    Exceeded,
    /// Cloud not reachable or not signed in
    Unknown,
}

impl QuotaHealth {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaHealth::Healthy => "healthy",
            QuotaHealth::Warning => "warning",
            QuotaHealth::Critical => "critical",
            QuotaHealth::Exceeded => "exceeded",
            QuotaHealth::Unknown => "unknown",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "healthy" => Ok(QuotaHealth::Healthy),
            "warning" => Ok(QuotaHealth::Warning),
            "critical" => Ok(QuotaHealth::Critical),
            "exceeded" => Ok(QuotaHealth::Exceeded),
            "unknown" => Ok(QuotaHealth::Unknown),
            other => Err(DomainError::UnknownEnumValue {
                kind: "QuotaHealth",
                value: other.to_string(),
            }),
        }
    }
}

/// Result of one quota evaluation for a user
///
/// Transient; re-derived on every check. A latest-snapshot row is persisted
/// for operator inspection but never read back for decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Which user was evaluated
    pub user_id: UserId,
    /// Derived health band
    pub health: QuotaHealth,
    /// Total quota in MB
    pub total_mb: u64,
    /// Used quota in MB
    pub used_mb: u64,
    /// Free quota in MB
    pub available_mb: u64,
    /// Estimated MB required for this user's backup
    pub required_mb: u64,
    /// MB missing to accommodate the backup plus the safety floor
    pub shortfall_mb: u64,
    /// Used percentage of total, 0.0 to 100.0 (and above when exceeded)
    pub usage_pct: f64,
    /// Whether the backup fits with the safety floor intact
    pub can_accommodate_backup: bool,
    /// Human-readable findings
    pub issues: Vec<String>,
    /// Suggested operator actions
    pub recommendations: Vec<String>,
}

impl QuotaStatus {
    /// A status representing "cloud unavailable"
    pub fn unknown(user_id: UserId, issue: impl Into<String>) -> Self {
        Self {
            user_id,
            health: QuotaHealth::Unknown,
            total_mb: 0,
            used_mb: 0,
            available_mb: 0,
            required_mb: 0,
            shortfall_mb: 0,
            usage_pct: 0.0,
            can_accommodate_backup: false,
            issues: vec![issue.into()],
            recommendations: Vec::new(),
        }
    }
}

/// Kind of quota warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWarningType {
    /// Usage crossed the warning threshold
    HighUsage,
    /// The planned backup does not fit
    InsufficientBackupSpace,
    /// Usage is closing in on the hard limit
    ApproachingLimit,
}

impl QuotaWarningType {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaWarningType::HighUsage => "high_usage",
            QuotaWarningType::InsufficientBackupSpace => "insufficient_backup_space",
            QuotaWarningType::ApproachingLimit => "approaching_limit",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "high_usage" => Ok(QuotaWarningType::HighUsage),
            "insufficient_backup_space" => Ok(QuotaWarningType::InsufficientBackupSpace),
            "approaching_limit" => Ok(QuotaWarningType::ApproachingLimit),
            other => Err(DomainError::UnknownEnumValue {
                kind: "QuotaWarningType",
                value: other.to_string(),
            }),
        }
    }
}

/// Severity of a quota warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Info,
    Warning,
    Critical,
}

impl WarningLevel {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Info => "info",
            WarningLevel::Warning => "warning",
            WarningLevel::Critical => "critical",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "info" => Ok(WarningLevel::Info),
            "warning" => Ok(WarningLevel::Warning),
            "critical" => Ok(WarningLevel::Critical),
            other => Err(DomainError::UnknownEnumValue {
                kind: "WarningLevel",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable quota warning raised for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaWarning {
    /// Warning identifier
    pub id: WarningId,
    /// Which user the warning concerns
    pub user_id: UserId,
    /// Warning kind
    pub warning_type: QuotaWarningType,
    /// Severity
    pub level: WarningLevel,
    /// Short title for operator surfaces
    pub title: String,
    /// Full description
    pub message: String,
    /// When raised
    pub created_at: DateTime<Utc>,
    /// When resolved, if resolved
    pub resolved_at: Option<DateTime<Utc>>,
    /// Whether the underlying condition has cleared
    pub is_resolved: bool,
}

impl QuotaWarning {
    /// Raise a new unresolved warning
    pub fn new(
        user_id: UserId,
        warning_type: QuotaWarningType,
        level: WarningLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: WarningId::new(),
            user_id,
            warning_type,
            level,
            title: title.into(),
            message: message.into(),
            created_at: now,
            resolved_at: None,
            is_resolved: false,
        }
    }

    /// Mark the warning resolved
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if !self.is_resolved {
            self.is_resolved = true;
            self.resolved_at = Some(now);
        }
    }
}
