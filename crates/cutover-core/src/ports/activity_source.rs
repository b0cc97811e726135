//! Activity source port
//!
//! Supplies the usage signals the classification engine scores: last login,
//! session presence, process counts, recent file activity. The Windows
//! adapter reads event logs and session APIs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::newtypes::UserId;

/// One activity reading for a user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    /// Last interactive login, if recorded
    pub last_login: Option<DateTime<Utc>>,
    /// Most recent file modification inside the profile
    pub last_activity: Option<DateTime<Utc>>,
    /// Processes currently running as the user
    pub active_process_count: u32,
    /// Whether the user has a live interactive session
    pub has_active_session: bool,
}

/// Port trait for user activity signals
#[async_trait::async_trait]
pub trait ActivitySource: Send + Sync {
    /// Gather the current activity snapshot for a user
    async fn snapshot(&self, user_id: &UserId) -> anyhow::Result<ActivitySnapshot>;
}
