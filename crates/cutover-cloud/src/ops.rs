//! Sync operation lifecycle
//!
//! One tracked operation per (user, folder) at a time. `start_sync` creates
//! the record and kicks the provider; `poll` samples progress, completes or
//! stalls the operation, and schedules retries after a timeout.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cutover_core::domain::backup::OperationStatus;
use cutover_core::domain::cloud::SyncOperation;
use cutover_core::domain::newtypes::{SyncOpId, UserId};
use cutover_core::ports::{Clock, CloudConnector};
use cutover_core::ServiceError;
use cutover_store::{StateStore, StoreError};

/// Progress watermark used for stall detection
#[derive(Debug, Clone, Copy)]
struct ProgressMark {
    bytes_uploaded: u64,
    changed_at: DateTime<Utc>,
}

/// Tracks folder uploads through the cloud connector
pub struct SyncOperationService {
    connector: Arc<dyn CloudConnector>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    stall_window: Duration,
    marks: Mutex<HashMap<SyncOpId, ProgressMark>>,
}

impl SyncOperationService {
    /// Create the service with the given stall window
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        stall_window: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            clock,
            stall_window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a folder upload
    ///
    /// Fails with `Conflict` when a non-terminal operation already exists
    /// for the same (user, folder).
    pub async fn start_sync(
        &self,
        user_id: &UserId,
        folder: &str,
    ) -> Result<SyncOperation, ServiceError> {
        if let Some(active) = self.store.active_sync_op(user_id, folder).await? {
            return Err(ServiceError::Conflict(format!(
                "sync operation {} already active for this folder",
                active.id()
            )));
        }

        let now = self.clock.now();
        let operation = SyncOperation::new(user_id.clone(), folder, now);
        match self.store.insert_sync_op(&operation).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                // Lost the race to a concurrent starter.
                return Err(ServiceError::Conflict(msg));
            }
            Err(e) => return Err(e.into()),
        }

        self.connector
            .force_sync(user_id, folder)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;

        self.marks.lock().await.insert(
            operation.id(),
            ProgressMark {
                bytes_uploaded: 0,
                changed_at: now,
            },
        );

        info!(user_id = %user_id, folder, sync_op = %operation.id(), "Sync operation started");
        Ok(operation)
    }

    /// Sample progress for one operation and advance its lifecycle
    ///
    /// Returns the updated operation. Terminal operations are returned
    /// unchanged.
    pub async fn poll(&self, sync_op_id: SyncOpId) -> Result<SyncOperation, ServiceError> {
        let Some(mut operation) = self.store.get_sync_op(sync_op_id).await? else {
            return Err(ServiceError::Store(format!(
                "sync operation {sync_op_id} not found"
            )));
        };
        if operation.status().is_terminal() {
            return Ok(operation);
        }

        let now = self.clock.now();
        let sample = self
            .connector
            .sync_progress(operation.user_id(), operation.folder_path())
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;

        operation
            .update_progress(
                sample.files_total,
                sample.files_uploaded,
                sample.bytes_total,
                sample.bytes_uploaded,
                sample.local_only_files,
            )
            .map_err(|e| ServiceError::Policy(e.to_string()))?;

        let uploaded = operation.bytes_uploaded().unwrap_or(0);
        let finished = !operation.has_remaining_files()
            && operation.local_only_files().unwrap_or(0) == 0
            && operation.files_total().is_some();

        if finished {
            operation
                .complete(now)
                .map_err(|e| ServiceError::Policy(e.to_string()))?;
            self.marks.lock().await.remove(&sync_op_id);
            info!(sync_op = %sync_op_id, "Sync operation completed");
        } else {
            // Stall detection: no upload progress for a whole window while
            // files remain.
            let mut marks = self.marks.lock().await;
            let mark = marks.entry(sync_op_id).or_insert(ProgressMark {
                bytes_uploaded: uploaded,
                changed_at: now,
            });
            if uploaded > mark.bytes_uploaded {
                mark.bytes_uploaded = uploaded;
                mark.changed_at = now;
            } else if operation.has_remaining_files()
                && now - mark.changed_at >= self.stall_window
            {
                operation
                    .time_out(now)
                    .map_err(|e| ServiceError::Policy(e.to_string()))?;
                marks.remove(&sync_op_id);
                warn!(
                    sync_op = %sync_op_id,
                    window_secs = self.stall_window.num_seconds(),
                    "Sync operation stalled; marked timed out"
                );
            }
        }

        self.store.update_sync_op(&operation).await?;
        Ok(operation)
    }

    /// Start a fresh operation retrying a timed-out or failed one
    ///
    /// Carries the retry count forward so escalation thresholds see the
    /// full history.
    pub async fn retry(&self, previous: &SyncOperation) -> Result<SyncOperation, ServiceError> {
        if !previous.status().is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "sync operation {} is still running",
                previous.id()
            )));
        }

        let now = self.clock.now();
        let mut operation =
            SyncOperation::new(previous.user_id().clone(), previous.folder_path(), now);
        for _ in 0..=previous.retry_count() {
            operation.record_retry(now);
        }

        self.store.insert_sync_op(&operation).await?;
        self.connector
            .force_sync(operation.user_id(), operation.folder_path())
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;

        debug!(
            previous = %previous.id(),
            sync_op = %operation.id(),
            retry = operation.retry_count(),
            "Sync operation retried"
        );
        Ok(operation)
    }

    /// Mark an operation as needing human intervention
    pub async fn require_intervention(
        &self,
        sync_op_id: SyncOpId,
    ) -> Result<SyncOperation, ServiceError> {
        let Some(mut operation) = self.store.get_sync_op(sync_op_id).await? else {
            return Err(ServiceError::Store(format!(
                "sync operation {sync_op_id} not found"
            )));
        };
        if !operation.status().is_terminal() {
            operation
                .require_intervention(self.clock.now())
                .map_err(|e| ServiceError::Policy(e.to_string()))?;
            self.store.update_sync_op(&operation).await?;
            self.marks.lock().await.remove(&sync_op_id);
        }
        Ok(operation)
    }
}
