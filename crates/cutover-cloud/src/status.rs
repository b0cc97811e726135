//! Cloud status cache
//!
//! Readiness snapshots are cached per user with a TTL (default 5 minutes).
//! A fresh cached value is served without touching the connector; a failed
//! detection records its error on the returned snapshot but never evicts a
//! previously good cache entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use cutover_core::domain::cloud::{CloudStatusSnapshot, KfmStatus, SyncStatus};
use cutover_core::domain::newtypes::UserId;
use cutover_core::ports::{Clock, CloudConnector};
use cutover_core::ServiceError;
use cutover_store::StateStore;

/// Cached per-user cloud readiness
pub struct CloudStatusService {
    connector: Arc<dyn CloudConnector>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<UserId, CloudStatusSnapshot>>,
}

impl CloudStatusService {
    /// Create the service with the given snapshot TTL
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            clock,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current readiness for a user, served from cache while fresh
    pub async fn get_status(&self, user_id: &UserId) -> Result<CloudStatusSnapshot, ServiceError> {
        let now = self.clock.now();

        if let Some(cached) = self.cache.read().await.get(user_id) {
            if cached.is_fresh(self.ttl, now) {
                debug!(user_id = %user_id, "Serving cached cloud status");
                return Ok(cached.clone());
            }
        }

        match self.detect(user_id).await {
            Ok(snapshot) => {
                self.cache
                    .write()
                    .await
                    .insert(user_id.clone(), snapshot.clone());
                self.store.save_cloud_status(&snapshot).await?;
                if let Some(ref info) = snapshot.account_info {
                    self.store.save_cloud_account(user_id, info, now).await?;
                }
                Ok(snapshot)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Cloud detection failed");
                // Keep any stale cache entry; hand back a snapshot carrying
                // the failure so callers can see why readiness is unknown.
                let mut snapshot = self
                    .cache
                    .read()
                    .await
                    .get(user_id)
                    .cloned()
                    .unwrap_or_else(|| CloudStatusSnapshot::unknown(user_id.clone(), now));
                snapshot.error_details = Some(e.to_string());
                Ok(snapshot)
            }
        }
    }

    /// Drop the cached snapshot for a user (e.g. after forcing a sign-in)
    pub async fn invalidate(&self, user_id: &UserId) {
        self.cache.write().await.remove(user_id);
    }

    /// Whether backups can proceed for a user right now
    pub async fn is_ready(&self, user_id: &UserId) -> Result<bool, ServiceError> {
        Ok(self.get_status(user_id).await?.is_ready())
    }

    /// Refresh and persist known-folder redirection state
    pub async fn refresh_kfm(&self, user_id: &UserId) -> Result<KfmStatus, ServiceError> {
        let status = self
            .connector
            .kfm_status(user_id)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;
        self.store.save_kfm_status(&status).await?;
        Ok(status)
    }

    async fn detect(&self, user_id: &UserId) -> anyhow::Result<CloudStatusSnapshot> {
        let now = self.clock.now();
        let is_installed = self.connector.is_installed(user_id).await?;
        if !is_installed {
            return Ok(CloudStatusSnapshot {
                sync_status: SyncStatus::Unknown,
                last_checked: now,
                ..CloudStatusSnapshot::unknown(user_id.clone(), now)
            });
        }

        let is_running = self.connector.is_running(user_id).await?;
        let is_signed_in = self.connector.is_signed_in(user_id).await?;
        let sync_status = if is_signed_in {
            self.connector.sync_status(user_id).await?
        } else {
            SyncStatus::NotSignedIn
        };
        let account_info = if is_signed_in {
            self.connector.account_info(user_id).await?
        } else {
            None
        };
        let primary_sync_folder = self.connector.primary_sync_folder(user_id).await?;

        Ok(CloudStatusSnapshot {
            user_id: user_id.clone(),
            is_installed,
            is_running,
            is_signed_in,
            account_email: account_info.as_ref().map(|a| a.email.clone()),
            primary_sync_folder,
            sync_status,
            account_info,
            error_details: None,
            last_checked: now,
        })
    }
}
