//! Escalations - durable records that hand a problem to a human

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{EscalationId, UserId};
use crate::errors::DomainError;

/// What pushed the situation past automated recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// Cloud quota cannot hold the planned backup
    InsufficientSpace,
    /// The same warning kept recurring
    RepeatedWarnings,
    /// Sync errors exhausted their retry budget
    SyncErrors,
    /// A single file too large for the provider
    LargeFile,
    /// The user spent the whole delay budget
    UserBusyExhausted,
    /// The service itself faulted
    ServiceFault,
    /// Raised by an operator
    Manual,
}

impl EscalationKind {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationKind::InsufficientSpace => "insufficient_space",
            EscalationKind::RepeatedWarnings => "repeated_warnings",
            EscalationKind::SyncErrors => "sync_errors",
            EscalationKind::LargeFile => "large_file",
            EscalationKind::UserBusyExhausted => "user_busy_exhausted",
            EscalationKind::ServiceFault => "service_fault",
            EscalationKind::Manual => "manual",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "insufficient_space" => Ok(EscalationKind::InsufficientSpace),
            "repeated_warnings" => Ok(EscalationKind::RepeatedWarnings),
            "sync_errors" => Ok(EscalationKind::SyncErrors),
            "large_file" => Ok(EscalationKind::LargeFile),
            "user_busy_exhausted" => Ok(EscalationKind::UserBusyExhausted),
            "service_fault" => Ok(EscalationKind::ServiceFault),
            "manual" => Ok(EscalationKind::Manual),
            other => Err(DomainError::UnknownEnumValue {
                kind: "EscalationKind",
                value: other.to_string(),
            }),
        }
    }
}

/// Ticket priority for an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl EscalationPriority {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationPriority::Low => "low",
            EscalationPriority::Normal => "normal",
            EscalationPriority::High => "high",
            EscalationPriority::Critical => "critical",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "low" => Ok(EscalationPriority::Low),
            "normal" => Ok(EscalationPriority::Normal),
            "high" => Ok(EscalationPriority::High),
            "critical" => Ok(EscalationPriority::Critical),
            other => Err(DomainError::UnknownEnumValue {
                kind: "EscalationPriority",
                value: other.to_string(),
            }),
        }
    }
}

/// A durable escalation record
///
/// Escalations of the same kind for the same user within the cooldown window
/// collapse into the open record: `details` is amended and `updated_at`
/// bumped instead of creating a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Escalation identifier
    pub id: EscalationId,
    /// User concerned; `None` for machine-wide faults
    pub user_id: Option<UserId>,
    /// What went wrong
    pub kind: EscalationKind,
    /// Ticket priority
    pub priority: EscalationPriority,
    /// One-line description
    pub description: String,
    /// Structured context (offending paths, counters, ...)
    pub details: serde_json::Value,
    /// When first raised
    pub created_at: DateTime<Utc>,
    /// When last amended
    pub updated_at: DateTime<Utc>,
    /// When resolved, if resolved
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Escalation {
    /// Raise a new open escalation
    pub fn new(
        user_id: Option<UserId>,
        kind: EscalationKind,
        priority: EscalationPriority,
        description: impl Into<String>,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EscalationId::new(),
            user_id,
            kind,
            priority,
            description: description.into(),
            details,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    /// Whether the escalation is still open
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Merge a recurrence into this open escalation
    ///
    /// Appends the occurrence to a `recurrences` array inside `details` and
    /// bumps `updated_at`.
    pub fn amend(&mut self, occurrence: serde_json::Value, now: DateTime<Utc>) {
        match self.details.as_object_mut() {
            Some(map) => {
                let entry = map
                    .entry("recurrences")
                    .or_insert_with(|| serde_json::Value::Array(Vec::new()));
                match entry.as_array_mut() {
                    Some(array) => array.push(occurrence),
                    None => *entry = serde_json::Value::Array(vec![occurrence]),
                }
            }
            None => {
                let original = std::mem::take(&mut self.details);
                self.details = serde_json::json!({
                    "original": original,
                    "recurrences": [occurrence],
                });
            }
        }
        self.updated_at = now;
    }

    /// Mark the escalation resolved
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(now);
            self.updated_at = now;
        }
    }
}
