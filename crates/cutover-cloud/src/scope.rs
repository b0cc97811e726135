//! Selective sync scope control
//!
//! Scope membership is derived from the provider's excluded-folders list
//! plus the primary sync-folder root: a folder is in scope when it lives
//! under the root and neither it nor any of its ancestors is excluded.
//! Adding a folder to scope removes it and any excluded ancestor from the
//! exclusion list, because excluding an ancestor excludes the whole
//! subtree.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use cutover_core::domain::cloud::SyncedFolder;
use cutover_core::domain::newtypes::UserId;
use cutover_core::ports::{Clock, CloudConnector};
use cutover_core::ServiceError;
use cutover_store::StateStore;

/// Normalize a Windows-style path for comparison: lowercase, forward
/// slashes, no trailing separator
fn normalize(path: &str) -> String {
    let mut normalized = path.replace('\\', "/").to_lowercase();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Whether `ancestor` contains `path` (or is equal to it)
fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    let ancestor = normalize(ancestor);
    let path = normalize(path);
    path == ancestor || path.starts_with(&format!("{ancestor}/"))
}

/// Selective-sync scope operations for one cloud account per user
pub struct SelectiveSyncService {
    connector: Arc<dyn CloudConnector>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl SelectiveSyncService {
    /// Create the service
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        store: Arc<StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connector,
            store,
            clock,
        }
    }

    /// Whether `path` is currently replicated for the user
    pub async fn is_folder_in_scope(
        &self,
        user_id: &UserId,
        account_id: &str,
        path: &str,
    ) -> Result<bool, ServiceError> {
        let root = self
            .connector
            .primary_sync_folder(user_id)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;
        let Some(root) = root else {
            return Ok(false);
        };
        if !is_ancestor_or_self(&root, path) {
            return Ok(false);
        }

        let excluded = self
            .connector
            .excluded_folders(user_id, account_id)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;
        Ok(!excluded.iter().any(|ex| is_ancestor_or_self(ex, path)))
    }

    /// Bring a folder into scope
    ///
    /// Removes the folder and every excluded ancestor of it from the
    /// exclusion list.
    pub async fn add_to_scope(
        &self,
        user_id: &UserId,
        account_id: &str,
        path: &str,
    ) -> Result<(), ServiceError> {
        let excluded = self
            .connector
            .excluded_folders(user_id, account_id)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;

        let retained: Vec<String> = excluded
            .iter()
            .filter(|ex| !is_ancestor_or_self(ex, path))
            .cloned()
            .collect();

        if retained.len() != excluded.len() {
            debug!(
                user_id = %user_id,
                path,
                removed = excluded.len() - retained.len(),
                "Removing exclusions to bring folder into scope"
            );
            self.connector
                .set_excluded_folders(user_id, account_id, retained)
                .await
                .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;
        }

        self.record_membership(user_id, account_id, path, true).await
    }

    /// Take a folder out of scope by excluding it
    pub async fn remove_from_scope(
        &self,
        user_id: &UserId,
        account_id: &str,
        path: &str,
    ) -> Result<(), ServiceError> {
        let mut excluded = self
            .connector
            .excluded_folders(user_id, account_id)
            .await
            .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;

        if !excluded.iter().any(|ex| normalize(ex) == normalize(path)) {
            excluded.push(path.to_string());
            self.connector
                .set_excluded_folders(user_id, account_id, excluded)
                .await
                .map_err(|e| ServiceError::capability("cloud_connector", e.to_string()))?;
        }

        self.record_membership(user_id, account_id, path, false).await
    }

    /// Make sure every critical folder is in scope
    ///
    /// Returns per-path success; one failing folder does not stop the rest.
    pub async fn ensure_critical_folders_included(
        &self,
        user_id: &UserId,
        account_id: &str,
        paths: &[String],
    ) -> Result<HashMap<String, bool>, ServiceError> {
        let mut results = HashMap::with_capacity(paths.len());
        for path in paths {
            let ok = match self.add_to_scope(user_id, account_id, path).await {
                Ok(()) => self
                    .is_folder_in_scope(user_id, account_id, path)
                    .await
                    .unwrap_or(false),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, path, error = %e, "Could not include folder");
                    false
                }
            };
            results.insert(path.clone(), ok);
        }
        info!(
            user_id = %user_id,
            included = results.values().filter(|v| **v).count(),
            total = paths.len(),
            "Critical folder scope ensured"
        );
        Ok(results)
    }

    async fn record_membership(
        &self,
        user_id: &UserId,
        account_id: &str,
        path: &str,
        in_scope: bool,
    ) -> Result<(), ServiceError> {
        self.store
            .save_synced_folder(&SyncedFolder {
                user_id: user_id.clone(),
                account_id: account_id.to_string(),
                folder_path: path.to_string(),
                in_scope,
                updated_at: self.clock.now(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockClock, MockConnector};
    use cutover_store::DatabasePool;

    fn user() -> UserId {
        UserId::new("S-1-5-21-60").unwrap()
    }

    async fn service(connector: Arc<MockConnector>) -> (SelectiveSyncService, Arc<StateStore>) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(StateStore::new(pool.pool().clone()));
        let clock = Arc::new(MockClock::new("2026-03-01T12:00:00Z"));
        (
            SelectiveSyncService::new(connector, store.clone(), clock),
            store,
        )
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(normalize(r"C:\Users\A\Documents\"), "c:/users/a/documents");
        assert!(is_ancestor_or_self(
            r"C:\Users\A",
            r"c:\users\a\documents\taxes"
        ));
        assert!(is_ancestor_or_self(r"C:\Users\A", r"C:\Users\A"));
        assert!(!is_ancestor_or_self(r"C:\Users\A", r"C:\Users\AB"));
    }

    #[tokio::test]
    async fn test_folder_under_root_and_not_excluded_is_in_scope() {
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        let (service, _store) = service(connector.clone()).await;

        let path = r"C:\Users\user\OneDrive - Contoso\Documents";
        assert!(service.is_folder_in_scope(&user(), "biz1", path).await.unwrap());

        // Outside the sync root: never in scope.
        assert!(!service
            .is_folder_in_scope(&user(), "biz1", r"D:\Stuff")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_excluded_ancestor_takes_folder_out_of_scope() {
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        connector
            .excluded
            .lock()
            .unwrap()
            .push(r"C:\Users\user\OneDrive - Contoso\Archive".to_string());
        let (service, _store) = service(connector.clone()).await;

        let nested = r"C:\Users\user\OneDrive - Contoso\Archive\2019";
        assert!(!service.is_folder_in_scope(&user(), "biz1", nested).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_to_scope_removes_excluded_ancestors() {
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        {
            let mut excluded = connector.excluded.lock().unwrap();
            excluded.push(r"C:\Users\user\OneDrive - Contoso\Archive".to_string());
            excluded.push(r"C:\Users\user\OneDrive - Contoso\Archive\2019".to_string());
            excluded.push(r"C:\Users\user\OneDrive - Contoso\Other".to_string());
        }
        let (service, store) = service(connector.clone()).await;

        let target = r"C:\Users\user\OneDrive - Contoso\Archive\2019\Taxes";
        service.add_to_scope(&user(), "biz1", target).await.unwrap();

        // Both ancestors are gone; the unrelated exclusion stays.
        let excluded = connector.excluded.lock().unwrap().clone();
        assert_eq!(
            excluded,
            vec![r"C:\Users\user\OneDrive - Contoso\Other".to_string()]
        );

        assert!(service.is_folder_in_scope(&user(), "biz1", target).await.unwrap());

        let folders = store.synced_folders(&user(), "biz1").await.unwrap();
        assert_eq!(folders.len(), 1);
        assert!(folders[0].in_scope);
    }

    #[tokio::test]
    async fn test_remove_from_scope_excludes_folder() {
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        let (service, _store) = service(connector.clone()).await;

        let path = r"C:\Users\user\OneDrive - Contoso\Scratch";
        service.remove_from_scope(&user(), "biz1", path).await.unwrap();
        assert!(!service.is_folder_in_scope(&user(), "biz1", path).await.unwrap());

        // Doing it again does not duplicate the exclusion entry.
        service.remove_from_scope(&user(), "biz1", path).await.unwrap();
        assert_eq!(connector.excluded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_critical_folders_reports_per_path() {
        let connector = Arc::new(MockConnector::signed_in(10_000, 0));
        let (service, _store) = service(connector.clone()).await;

        let inside = r"C:\Users\user\OneDrive - Contoso\Documents".to_string();
        let outside = r"D:\NotSynced".to_string();
        let results = service
            .ensure_critical_folders_included(&user(), "biz1", &[inside.clone(), outside.clone()])
            .await
            .unwrap();

        assert_eq!(results[&inside], true);
        assert_eq!(results[&outside], false);
    }
}
