//! Profile detector port
//!
//! Enumerates local user profiles. The Windows adapter reads the ProfileList
//! registry hive; the core only sees this DTO.

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::UserId;
use crate::domain::profile::ProfileType;

/// Raw profile facts as reported by the OS
///
/// This is a port-level DTO, not a domain entity; the profile service maps
/// it onto [`crate::domain::UserProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedProfile {
    /// Security identifier of the account
    pub user_id: UserId,
    /// Account name
    pub user_name: String,
    /// Profile directory path
    pub profile_path: String,
    /// Best-effort account kind
    pub profile_type: ProfileType,
    /// Directory size in bytes, when already measured by the adapter
    pub size_bytes: Option<u64>,
    /// Whether the profile hive is loaded
    pub is_loaded: bool,
    /// Whether the profile directory could be read
    pub is_accessible: bool,
}

/// Port trait for enumerating local profiles
#[async_trait::async_trait]
pub trait ProfileDetector: Send + Sync {
    /// List every local profile present on the machine
    async fn enumerate_profiles(&self) -> anyhow::Result<Vec<DetectedProfile>>;

    /// Resolve a single profile by its security identifier
    async fn resolve(&self, user_id: &UserId) -> anyhow::Result<Option<DetectedProfile>>;

    /// Measure the on-disk size of a profile directory
    ///
    /// Separated from enumeration because the walk is expensive; adapters
    /// run it on the blocking pool rather than the I/O executor.
    async fn measure_profile_size(&self, user_id: &UserId) -> anyhow::Result<u64>;
}
