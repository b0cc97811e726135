//! Backup operations and the per-user migration lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{OperationId, UserId};
use crate::errors::DomainError;

// ============================================================================
// Categories and operation status
// ============================================================================

/// A category of user data covered by one backup operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCategory {
    /// Documents, desktop, pictures and other user files
    Files,
    /// Browser profiles (bookmarks, saved passwords)
    Browsers,
    /// Mail client data stores
    Email,
    /// Per-user system settings
    System,
}

impl BackupCategory {
    /// Text form used on the wire and for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCategory::Files => "files",
            BackupCategory::Browsers => "browsers",
            BackupCategory::Email => "email",
            BackupCategory::System => "system",
        }
    }

    /// Strict parse of the text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "files" => Ok(BackupCategory::Files),
            "browsers" => Ok(BackupCategory::Browsers),
            "email" => Ok(BackupCategory::Email),
            "system" => Ok(BackupCategory::System),
            other => Err(DomainError::UnknownEnumValue {
                kind: "BackupCategory",
                value: other.to_string(),
            }),
        }
    }

    /// Every category, in canonical order
    pub fn all() -> [BackupCategory; 4] {
        [
            BackupCategory::Files,
            BackupCategory::Browsers,
            BackupCategory::Email,
            BackupCategory::System,
        ]
    }
}

/// Lifecycle status shared by backup and sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created, not yet started
    Pending,
    /// Actively transferring
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished with an unrecoverable error
    Failed,
    /// Cancelled by operator or shutdown
    Cancelled,
    /// Abandoned after making no progress
    TimedOut,
    /// Parked until a human intervenes
    RequiresIntervention,
}

impl OperationStatus {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::TimedOut => "timed_out",
            OperationStatus::RequiresIntervention => "requires_intervention",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            "timed_out" => Ok(OperationStatus::TimedOut),
            "requires_intervention" => Ok(OperationStatus::RequiresIntervention),
            other => Err(DomainError::UnknownEnumValue {
                kind: "OperationStatus",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal statuses are immutable once set
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed
                | OperationStatus::Failed
                | OperationStatus::Cancelled
                | OperationStatus::TimedOut
                | OperationStatus::RequiresIntervention
        )
    }
}

// ============================================================================
// BackupOperation
// ============================================================================

/// One tracked backup of a single (user, category) pair
///
/// Progress is monotone non-decreasing; the value 100 is reserved for
/// [`BackupOperation::complete`] so that `progress == 100` holds exactly when
/// the status is `Completed`. Once a terminal status is set, every further
/// mutation is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupOperation {
    id: OperationId,
    user_id: UserId,
    category: BackupCategory,
    status: OperationStatus,
    progress: u8,
    bytes_transferred: u64,
    bytes_total: u64,
    started_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl BackupOperation {
    /// Create a pending operation
    pub fn new(user_id: UserId, category: BackupCategory, now: DateTime<Utc>) -> Self {
        Self {
            id: OperationId::new(),
            user_id,
            category,
            status: OperationStatus::Pending,
            progress: 0,
            bytes_transferred: 0,
            bytes_total: 0,
            started_at: now,
            last_updated: now,
            ended_at: None,
            error: None,
        }
    }

    /// Rehydrate a persisted operation without invariant re-checks
    ///
    /// Intended for the store's row mapping only; the store trusts its own
    /// prior writes.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: OperationId,
        user_id: UserId,
        category: BackupCategory,
        status: OperationStatus,
        progress: u8,
        bytes_transferred: u64,
        bytes_total: u64,
        started_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            category,
            status,
            progress,
            bytes_transferred,
            bytes_total,
            started_at,
            last_updated,
            ended_at,
            error,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn category(&self) -> BackupCategory {
        self.category
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Current progress, 0 to 100
    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn guard_mutable(&self, attempted: OperationStatus) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::InvalidState {
                from: self.status.as_str().to_string(),
                to: attempted.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Record a progress report
    ///
    /// Values above the current progress advance it (capped at 99; 100 is
    /// reserved for completion); lower values are kept at the current level,
    /// preserving monotonicity against out-of-order reports. Byte counters
    /// are likewise monotone.
    pub fn update_progress(
        &mut self,
        progress: u8,
        bytes_transferred: u64,
        bytes_total: u64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::InProgress)?;
        if progress > 100 {
            return Err(DomainError::ValidationFailed(format!(
                "progress {progress} out of range"
            )));
        }
        self.status = OperationStatus::InProgress;
        self.progress = self.progress.max(progress.min(99));
        self.bytes_transferred = self.bytes_transferred.max(bytes_transferred);
        if bytes_total > 0 {
            self.bytes_total = bytes_total;
        }
        self.last_updated = now;
        Ok(())
    }

    /// Mark the operation completed; sets progress to exactly 100
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Completed)?;
        self.status = OperationStatus::Completed;
        self.progress = 100;
        self.last_updated = now;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark the operation failed with an error description
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Failed)?;
        self.status = OperationStatus::Failed;
        self.error = Some(error.into());
        self.last_updated = now;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark the operation cancelled
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::Cancelled)?;
        self.status = OperationStatus::Cancelled;
        self.last_updated = now;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Mark the operation timed out
    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.guard_mutable(OperationStatus::TimedOut)?;
        self.status = OperationStatus::TimedOut;
        self.last_updated = now;
        self.ended_at = Some(now);
        Ok(())
    }
}

// ============================================================================
// Migration phase and state
// ============================================================================

/// Phase of one user's migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Nothing requested yet
    NotStarted,
    /// Backup requested, waiting for the user's agent
    Requested,
    /// Backup running
    InProgress,
    /// User asked for a delay
    Delayed,
    /// Automated recovery exhausted; waiting on IT
    Escalated,
    /// All categories backed up; user no longer blocks reset
    ReadyForReset,
    /// Post-reset restore confirmed
    Completed,
    /// Unrecoverable failure
    Failed,
}

impl MigrationPhase {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::NotStarted => "not_started",
            MigrationPhase::Requested => "requested",
            MigrationPhase::InProgress => "in_progress",
            MigrationPhase::Delayed => "delayed",
            MigrationPhase::Escalated => "escalated",
            MigrationPhase::ReadyForReset => "ready_for_reset",
            MigrationPhase::Completed => "completed",
            MigrationPhase::Failed => "failed",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "not_started" => Ok(MigrationPhase::NotStarted),
            "requested" => Ok(MigrationPhase::Requested),
            "in_progress" => Ok(MigrationPhase::InProgress),
            "delayed" => Ok(MigrationPhase::Delayed),
            "escalated" => Ok(MigrationPhase::Escalated),
            "ready_for_reset" => Ok(MigrationPhase::ReadyForReset),
            "completed" => Ok(MigrationPhase::Completed),
            "failed" => Ok(MigrationPhase::Failed),
            other => Err(DomainError::UnknownEnumValue {
                kind: "MigrationPhase",
                value: other.to_string(),
            }),
        }
    }

    /// `Completed` and `Failed` are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Completed | MigrationPhase::Failed)
    }

    /// Whether this phase satisfies the reset gate for its user
    pub fn satisfies_gate(&self) -> bool {
        matches!(self, MigrationPhase::ReadyForReset | MigrationPhase::Completed)
    }

    /// Whether `next` is a legal successor of `self`
    ///
    /// `Failed` is reachable from any non-terminal phase; the rest follow
    /// the orchestrator's transition table.
    pub fn can_transition_to(&self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (NotStarted, Requested)
                | (Requested, InProgress)
                | (Requested, Escalated)
                | (InProgress, InProgress)
                | (InProgress, Delayed)
                | (InProgress, Escalated)
                | (InProgress, ReadyForReset)
                | (Delayed, InProgress)
                | (Delayed, Escalated)
                | (Escalated, InProgress)
                | (Escalated, ReadyForReset)
                | (ReadyForReset, Completed)
        )
    }
}

/// Aggregate migration state for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationState {
    user_id: UserId,
    phase: MigrationPhase,
    overall_progress: u8,
    deadline: DateTime<Utc>,
    delays_used: u32,
    last_updated: DateTime<Utc>,
}

impl MigrationState {
    /// Create a fresh `NotStarted` state with the given deadline
    pub fn new(user_id: UserId, deadline: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            phase: MigrationPhase::NotStarted,
            overall_progress: 0,
            deadline,
            delays_used: 0,
            last_updated: now,
        }
    }

    /// Rehydrate a persisted state without transition checks
    pub fn from_parts(
        user_id: UserId,
        phase: MigrationPhase,
        overall_progress: u8,
        deadline: DateTime<Utc>,
        delays_used: u32,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            phase,
            overall_progress,
            deadline,
            delays_used,
            last_updated,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Mean progress across the user's configured categories, 0 to 100
    pub fn overall_progress(&self) -> u8 {
        self.overall_progress
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn delays_used(&self) -> u32 {
        self.delays_used
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Attempt a phase transition, validating it against the table
    pub fn transition(
        &mut self,
        next: MigrationPhase,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.phase == next && next != MigrationPhase::InProgress {
            // Idempotent re-entry is only meaningful for progress updates.
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(DomainError::InvalidState {
                from: self.phase.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.phase = next;
        self.last_updated = now;
        Ok(())
    }

    /// Update the rolled-up progress value
    pub fn set_overall_progress(&mut self, progress: u8, now: DateTime<Utc>) {
        self.overall_progress = progress.min(100);
        self.last_updated = now;
    }

    /// Consume one delay and push the per-user deadline out
    pub fn record_delay(&mut self, extend_by: chrono::Duration, now: DateTime<Utc>) {
        self.delays_used += 1;
        self.deadline = self.deadline.max(now) + extend_by;
        self.last_updated = now;
    }

    /// Whether the per-user deadline has passed
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        !self.phase.is_terminal() && now > self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn user() -> UserId {
        UserId::new("S-1-5-21-1").unwrap()
    }

    #[test]
    fn test_progress_is_monotone() {
        let mut op = BackupOperation::new(user(), BackupCategory::Files, now());
        op.update_progress(40, 400, 1000, now()).unwrap();
        assert_eq!(op.progress(), 40);
        // A late, lower report does not roll progress back
        op.update_progress(25, 250, 1000, now()).unwrap();
        assert_eq!(op.progress(), 40);
        assert_eq!(op.bytes_transferred(), 400);
        op.update_progress(90, 900, 1000, now()).unwrap();
        assert_eq!(op.progress(), 90);
    }

    #[test]
    fn test_progress_100_reserved_for_completion() {
        let mut op = BackupOperation::new(user(), BackupCategory::Email, now());
        op.update_progress(100, 1000, 1000, now()).unwrap();
        assert_eq!(op.progress(), 99);
        assert_eq!(op.status(), OperationStatus::InProgress);
        op.complete(now()).unwrap();
        assert_eq!(op.progress(), 100);
        assert_eq!(op.status(), OperationStatus::Completed);
    }

    #[test]
    fn test_terminal_status_is_immutable() {
        let mut op = BackupOperation::new(user(), BackupCategory::Browsers, now());
        op.fail("disk error", now()).unwrap();
        assert!(op.update_progress(10, 0, 0, now()).is_err());
        assert!(op.complete(now()).is_err());
        assert!(op.cancel(now()).is_err());
        assert_eq!(op.status(), OperationStatus::Failed);
        assert_eq!(op.error(), Some("disk error"));
    }

    #[test]
    fn test_progress_rejects_out_of_range() {
        let mut op = BackupOperation::new(user(), BackupCategory::Files, now());
        assert!(op.update_progress(101, 0, 0, now()).is_err());
    }

    #[test]
    fn test_phase_transition_table() {
        use MigrationPhase::*;
        assert!(NotStarted.can_transition_to(Requested));
        assert!(Requested.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Delayed));
        assert!(InProgress.can_transition_to(ReadyForReset));
        assert!(Delayed.can_transition_to(InProgress));
        assert!(ReadyForReset.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!NotStarted.can_transition_to(InProgress));
        assert!(!Delayed.can_transition_to(ReadyForReset));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn test_migration_state_transitions() {
        let mut state = MigrationState::new(user(), now() + chrono::Duration::days(7), now());
        state.transition(MigrationPhase::Requested, now()).unwrap();
        state.transition(MigrationPhase::InProgress, now()).unwrap();
        state.transition(MigrationPhase::ReadyForReset, now()).unwrap();
        assert!(state.phase().satisfies_gate());

        let err = state.transition(MigrationPhase::InProgress, now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { .. }));
    }

    #[test]
    fn test_same_phase_transition_is_idempotent() {
        let mut state = MigrationState::new(user(), now() + chrono::Duration::days(7), now());
        state.transition(MigrationPhase::Requested, now()).unwrap();
        // Re-entering Requested is a no-op rather than an error
        state.transition(MigrationPhase::Requested, now()).unwrap();
        assert_eq!(state.phase(), MigrationPhase::Requested);
    }

    #[test]
    fn test_record_delay_extends_deadline() {
        let deadline = now() + chrono::Duration::days(7);
        let mut state = MigrationState::new(user(), deadline, now());
        state.record_delay(chrono::Duration::hours(24), now());
        assert_eq!(state.delays_used(), 1);
        assert_eq!(state.deadline(), deadline + chrono::Duration::hours(24));
    }

    #[test]
    fn test_deadline_check() {
        let mut state = MigrationState::new(user(), now() + chrono::Duration::hours(1), now());
        assert!(!state.is_past_deadline(now()));
        assert!(state.is_past_deadline(now() + chrono::Duration::hours(2)));
        // Terminal phases stop tripping the deadline
        state.transition(MigrationPhase::Failed, now()).unwrap();
        assert!(!state.is_past_deadline(now() + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_category_round_trip() {
        for c in BackupCategory::all() {
            assert_eq!(BackupCategory::parse(c.as_str()).unwrap(), c);
        }
        assert!(BackupCategory::parse("registry").is_err());
    }
}
