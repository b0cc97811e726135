//! Sync error categorization and recovery
//!
//! Each file-level failure reported by the provider is categorized from its
//! message and driven through a per-category recovery strategy. When an
//! operation accumulates enough unresolved errors, a single IT escalation
//! is raised listing the offending paths and the operation is parked for
//! intervention.

use std::sync::Arc;

use tracing::{debug, info, warn};

use cutover_core::domain::cloud::{SyncError, SyncErrorCategory, SyncOperation};
use cutover_core::domain::escalation::{EscalationKind, EscalationPriority};
use cutover_core::ports::Clock;
use cutover_core::ServiceError;
use cutover_store::StateStore;

use crate::escalate::EscalationEngine;
use crate::ops::SyncOperationService;

/// Retries granted to lock and not-found errors before giving up
const FILE_RETRY_LIMIT: u32 = 3;

/// Categorize a provider error message
///
/// Heuristic keyword matching over the (lowercased) message; anything
/// unrecognized lands in `Other`.
pub fn categorize_error(message: &str) -> SyncErrorCategory {
    let msg = message.to_lowercase();
    if msg.contains("locked") || msg.contains("in use") || msg.contains("sharing violation") {
        SyncErrorCategory::FileLocked
    } else if msg.contains("invalid") && (msg.contains("path") || msg.contains("name"))
        || msg.contains("characters that aren't allowed")
        || msg.contains("path too long")
    {
        SyncErrorCategory::InvalidPath
    } else if msg.contains("not found") || msg.contains("no longer exists") {
        SyncErrorCategory::FileNotFound
    } else if msg.contains("quota") || msg.contains("storage is full") || msg.contains("insufficient space") {
        SyncErrorCategory::QuotaExceeded
    } else if msg.contains("sign in") || msg.contains("signin") || msg.contains("credentials")
        || msg.contains("unauthorized") || msg.contains("authentication")
    {
        SyncErrorCategory::AuthRequired
    } else if msg.contains("network") || msg.contains("timed out") || msg.contains("timeout")
        || msg.contains("connection") || msg.contains("unreachable")
    {
        SyncErrorCategory::TransientNetwork
    } else {
        SyncErrorCategory::Other
    }
}

/// What recovery decided to do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the file (transient or lock contention)
    Retry,
    /// The error was resolved (retries exhausted or the file is moot)
    Resolved,
    /// The error needs the quota subsystem (quota exhaustion)
    HandOffQuota,
    /// The error needs interactive sign-in (raised as escalation)
    HandOffAuth,
}

/// Drives sync errors through their recovery strategies
pub struct ErrorRecoveryService {
    store: Arc<StateStore>,
    ops: Arc<SyncOperationService>,
    escalations: Arc<EscalationEngine>,
    clock: Arc<dyn Clock>,
    escalation_threshold: u32,
}

impl ErrorRecoveryService {
    /// Create the service
    pub fn new(
        store: Arc<StateStore>,
        ops: Arc<SyncOperationService>,
        escalations: Arc<EscalationEngine>,
        clock: Arc<dyn Clock>,
        escalation_threshold: u32,
    ) -> Self {
        Self {
            store,
            ops,
            escalations,
            clock,
            escalation_threshold,
        }
    }

    /// Record a provider failure against an operation and react to it
    pub async fn record_error(
        &self,
        operation: &mut SyncOperation,
        file_path: &str,
        message: &str,
    ) -> Result<RecoveryAction, ServiceError> {
        let now = self.clock.now();
        let category = categorize_error(message);
        let mut error = SyncError::new(operation.id(), file_path, message, category, now);

        operation.record_error();

        let action = match category {
            SyncErrorCategory::TransientNetwork => {
                error.retry_attempts += 1;
                debug!(file = file_path, "Transient network error; retrying with backoff");
                RecoveryAction::Retry
            }
            SyncErrorCategory::FileLocked | SyncErrorCategory::FileNotFound => {
                // Counted per distinct report of the same file below.
                let prior = self
                    .store
                    .unresolved_sync_errors(operation.id())
                    .await?
                    .into_iter()
                    .filter(|e| e.file_path == file_path && e.category == category)
                    .count() as u32;
                if prior + 1 >= FILE_RETRY_LIMIT {
                    error.is_resolved = true;
                    debug!(file = file_path, "Retry budget spent; resolving error");
                    RecoveryAction::Resolved
                } else {
                    error.retry_attempts = prior + 1;
                    RecoveryAction::Retry
                }
            }
            SyncErrorCategory::InvalidPath => {
                warn!(file = file_path, "Path rejected by provider; skipping file");
                error.is_resolved = true;
                RecoveryAction::Resolved
            }
            SyncErrorCategory::QuotaExceeded => RecoveryAction::HandOffQuota,
            SyncErrorCategory::AuthRequired => {
                self.escalations
                    .raise(
                        Some(operation.user_id()),
                        EscalationKind::SyncErrors,
                        EscalationPriority::High,
                        "cloud sign-in required to continue backup",
                        serde_json::json!({"file": file_path, "message": message}),
                    )
                    .await?;
                RecoveryAction::HandOffAuth
            }
            SyncErrorCategory::Other => {
                error.retry_attempts += 1;
                RecoveryAction::Retry
            }
        };

        let id = self.store.insert_sync_error(&error).await?;
        error.id = Some(id);
        self.store.update_sync_op(operation).await?;

        self.escalate_if_exhausted(operation).await?;
        Ok(action)
    }

    /// Raise one IT escalation once an operation has too many unresolved
    /// errors, and park the operation
    async fn escalate_if_exhausted(
        &self,
        operation: &mut SyncOperation,
    ) -> Result<(), ServiceError> {
        let unresolved = self.store.unresolved_sync_errors(operation.id()).await?;
        let fresh: Vec<&SyncError> = unresolved.iter().filter(|e| !e.escalated_to_it).collect();
        if (fresh.len() as u32) < self.escalation_threshold {
            return Ok(());
        }

        let paths: Vec<&str> = fresh.iter().map(|e| e.file_path.as_str()).collect();
        info!(
            sync_op = %operation.id(),
            errors = paths.len(),
            "Unresolved sync errors exceeded threshold; escalating to IT"
        );

        self.escalations
            .raise(
                Some(operation.user_id()),
                EscalationKind::SyncErrors,
                EscalationPriority::High,
                format!(
                    "{} files failed to sync for folder {}",
                    paths.len(),
                    operation.folder_path()
                ),
                serde_json::json!({"files": paths}),
            )
            .await?;

        for error in fresh {
            let mut marked = error.clone();
            marked.escalated_to_it = true;
            self.store.update_sync_error(&marked).await?;
        }

        let parked = self.ops.require_intervention(operation.id()).await?;
        *operation = parked;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalate::NullEscalationSink;
    use crate::testutil::{MockClock, MockConnector};
    use chrono::Duration;
    use cutover_core::domain::backup::OperationStatus;
    use cutover_core::domain::newtypes::UserId;
    use cutover_store::DatabasePool;

    #[test]
    fn test_categorization_table() {
        assert_eq!(
            categorize_error("The file is locked by another process"),
            SyncErrorCategory::FileLocked
        );
        assert_eq!(
            categorize_error("The name contains characters that aren't allowed"),
            SyncErrorCategory::InvalidPath
        );
        assert_eq!(
            categorize_error("Invalid path segment"),
            SyncErrorCategory::InvalidPath
        );
        assert_eq!(
            categorize_error("File not found on disk"),
            SyncErrorCategory::FileNotFound
        );
        assert_eq!(
            categorize_error("Your OneDrive storage is full"),
            SyncErrorCategory::QuotaExceeded
        );
        assert_eq!(
            categorize_error("Please sign in to continue"),
            SyncErrorCategory::AuthRequired
        );
        assert_eq!(
            categorize_error("The network connection timed out"),
            SyncErrorCategory::TransientNetwork
        );
        assert_eq!(categorize_error("something odd"), SyncErrorCategory::Other);
    }

    struct Fixture {
        recovery: ErrorRecoveryService,
        ops: Arc<SyncOperationService>,
        store: Arc<StateStore>,
    }

    async fn fixture() -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(StateStore::new(pool.pool().clone()));
        let clock = Arc::new(MockClock::new("2026-03-01T12:00:00Z"));
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        let ops = Arc::new(SyncOperationService::new(
            connector,
            store.clone(),
            clock.clone(),
            Duration::minutes(5),
        ));
        let escalations = Arc::new(EscalationEngine::new(
            store.clone(),
            Arc::new(NullEscalationSink),
            clock.clone(),
        ));
        Fixture {
            recovery: ErrorRecoveryService::new(
                store.clone(),
                ops.clone(),
                escalations,
                clock,
                3,
            ),
            ops,
            store,
        }
    }

    fn user() -> UserId {
        UserId::new("S-1-5-21-90").unwrap()
    }

    #[tokio::test]
    async fn test_locked_file_retries_then_resolves() {
        let fx = fixture().await;
        let mut op = fx.ops.start_sync(&user(), r"C:\U\docs").await.unwrap();

        let a = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\ledger.xlsx", "file is locked")
            .await
            .unwrap();
        assert_eq!(a, RecoveryAction::Retry);
        let b = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\ledger.xlsx", "file is locked")
            .await
            .unwrap();
        assert_eq!(b, RecoveryAction::Retry);
        let c = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\ledger.xlsx", "file is locked")
            .await
            .unwrap();
        assert_eq!(c, RecoveryAction::Resolved);
        assert_eq!(op.error_count(), 3);
    }

    #[tokio::test]
    async fn test_invalid_path_resolves_immediately() {
        let fx = fixture().await;
        let mut op = fx.ops.start_sync(&user(), r"C:\U\docs").await.unwrap();

        let action = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\CON.txt", "invalid name")
            .await
            .unwrap();
        assert_eq!(action, RecoveryAction::Resolved);
        assert!(fx
            .store
            .unresolved_sync_errors(op.id())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_three_unresolved_errors_escalate_once_and_park_operation() {
        let fx = fixture().await;
        let mut op = fx.ops.start_sync(&user(), r"C:\U\docs").await.unwrap();

        for i in 0..3 {
            fx.recovery
                .record_error(
                    &mut op,
                    &format!(r"C:\U\docs\file{i}.bin"),
                    "connection timed out",
                )
                .await
                .unwrap();
        }

        assert_eq!(op.status(), OperationStatus::RequiresIntervention);

        let open = fx.store.open_escalations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, EscalationKind::SyncErrors);
        let files = open[0].details["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);

        // The errors were stamped as escalated, so a fourth error does not
        // re-escalate the same batch.
        let errors = fx.store.unresolved_sync_errors(op.id()).await.unwrap();
        assert!(errors.iter().all(|e| e.escalated_to_it));
    }

    #[tokio::test]
    async fn test_auth_error_raises_escalation() {
        let fx = fixture().await;
        let mut op = fx.ops.start_sync(&user(), r"C:\U\docs").await.unwrap();

        let action = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\a.txt", "please sign in to OneDrive")
            .await
            .unwrap();
        assert_eq!(action, RecoveryAction::HandOffAuth);
        assert_eq!(fx.store.open_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quota_error_hands_off() {
        let fx = fixture().await;
        let mut op = fx.ops.start_sync(&user(), r"C:\U\docs").await.unwrap();

        let action = fx
            .recovery
            .record_error(&mut op, r"C:\U\docs\big.iso", "storage is full")
            .await
            .unwrap();
        assert_eq!(action, RecoveryAction::HandOffQuota);
        // No escalation from recovery itself; the quota service owns that.
        assert!(fx.store.open_escalations().await.unwrap().is_empty());
    }
}
