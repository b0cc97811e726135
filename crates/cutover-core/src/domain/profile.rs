//! User profiles and the transient metrics gathered about them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::UserId;
use crate::errors::DomainError;

/// Kind of a local user profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    /// Purely local account
    Local,
    /// Active Directory domain account
    Domain,
    /// Azure AD (Entra ID) account
    AzureAd,
    /// Hybrid-joined account
    Hybrid,
    /// Built-in system or service account
    System,
    /// Temporary profile (e.g. `C:\Users\user.TMP`)
    Temporary,
}

impl ProfileType {
    /// Text form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::Local => "local",
            ProfileType::Domain => "domain",
            ProfileType::AzureAd => "azure_ad",
            ProfileType::Hybrid => "hybrid",
            ProfileType::System => "system",
            ProfileType::Temporary => "temporary",
        }
    }

    /// Strict parse of the persisted text form
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "local" => Ok(ProfileType::Local),
            "domain" => Ok(ProfileType::Domain),
            "azure_ad" => Ok(ProfileType::AzureAd),
            "hybrid" => Ok(ProfileType::Hybrid),
            "system" => Ok(ProfileType::System),
            "temporary" => Ok(ProfileType::Temporary),
            other => Err(DomainError::UnknownEnumValue {
                kind: "ProfileType",
                value: other.to_string(),
            }),
        }
    }

    /// System and temporary profiles are never backed up
    pub fn is_backup_exempt(&self) -> bool {
        matches!(self, ProfileType::System | ProfileType::Temporary)
    }
}

/// One local user profile known to the service
///
/// Created on first discovery, updated on each refresh, never deleted
/// (a profile that disappears from the OS is simply observed as inactive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Opaque user identifier (SID)
    pub user_id: UserId,
    /// Display / account name
    pub user_name: String,
    /// Filesystem path of the profile directory
    pub profile_path: String,
    /// Kind of account backing the profile
    pub profile_type: ProfileType,
    /// Total size of the profile directory in bytes
    pub profile_size_bytes: u64,
    /// Last interactive login, if known
    pub last_login: Option<DateTime<Utc>>,
    /// Whether the classification engine considers this user active
    pub is_active: bool,
    /// Whether this user's data must be backed up before reset
    pub requires_backup: bool,
    /// Backup ordering priority, 0 (exempt) to 999 (most urgent)
    pub backup_priority: u16,
    /// First discovery time
    pub created_at: DateTime<Utc>,
    /// Last refresh time
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Create a freshly discovered profile
    ///
    /// System and temporary profiles are normalized to `requires_backup =
    /// false` and `backup_priority = 0`, which later updates preserve via
    /// [`UserProfile::set_backup_requirement`].
    pub fn new(
        user_id: UserId,
        user_name: impl Into<String>,
        profile_path: impl Into<String>,
        profile_type: ProfileType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            profile_path: profile_path.into(),
            profile_type,
            profile_size_bytes: 0,
            last_login: None,
            is_active: false,
            requires_backup: false,
            backup_priority: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a backup requirement decision, enforcing the exemption invariant
    ///
    /// Returns an error when attempting to require backup for a system or
    /// temporary profile.
    pub fn set_backup_requirement(
        &mut self,
        requires_backup: bool,
        priority: u16,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if requires_backup && self.profile_type.is_backup_exempt() {
            return Err(DomainError::ValidationFailed(format!(
                "{} profiles are exempt from backup",
                self.profile_type.as_str()
            )));
        }
        self.requires_backup = requires_backup;
        self.backup_priority = if requires_backup {
            priority.clamp(1, 999)
        } else {
            0
        };
        self.updated_at = now;
        Ok(())
    }

    /// Whether this profile currently blocks the reset gate if unfinished
    pub fn gates_reset(&self) -> bool {
        self.is_active && self.requires_backup
    }
}

/// Transient per-refresh measurements about a profile
///
/// Never persisted as a row of its own; a JSON snapshot of the decisive
/// fields is carried in classification history entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetrics {
    /// Measured size of the profile directory in bytes
    pub profile_size_bytes: u64,
    /// Most recent file activity inside the profile
    pub last_activity: Option<DateTime<Utc>>,
    /// Last interactive login
    pub last_login: Option<DateTime<Utc>>,
    /// Number of processes currently running as this user
    pub active_process_count: u32,
    /// Whether the profile hive is currently loaded
    pub is_loaded: bool,
    /// Whether the user has an interactive session right now
    pub has_active_session: bool,
    /// Whether the profile directory could be read
    pub is_accessible: bool,
    /// Non-fatal errors hit while gathering metrics
    pub errors: Vec<String>,
}

impl ProfileMetrics {
    /// Days since last login relative to `now`, if a login is known
    pub fn days_since_login(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_login.map(|t| (now - t).num_days())
    }

    /// Days since last observed activity relative to `now`
    pub fn days_since_activity(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_activity.map(|t| (now - t).num_days())
    }

    /// Profile size in whole megabytes
    pub fn profile_size_mb(&self) -> u64 {
        self.profile_size_bytes / (1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_profile_type_round_trip() {
        for ty in [
            ProfileType::Local,
            ProfileType::Domain,
            ProfileType::AzureAd,
            ProfileType::Hybrid,
            ProfileType::System,
            ProfileType::Temporary,
        ] {
            assert_eq!(ProfileType::parse(ty.as_str()).unwrap(), ty);
        }
    }

    #[test]
    fn test_profile_type_parse_rejects_unknown() {
        let err = ProfileType::parse("roaming").unwrap_err();
        assert!(matches!(err, DomainError::UnknownEnumValue { .. }));
    }

    #[test]
    fn test_new_profile_defaults_to_no_backup() {
        let profile = UserProfile::new(
            UserId::new("S-1-5-21-1").unwrap(),
            "alice",
            r"C:\Users\alice",
            ProfileType::Domain,
            now(),
        );
        assert!(!profile.requires_backup);
        assert_eq!(profile.backup_priority, 0);
        assert!(!profile.gates_reset());
    }

    #[test]
    fn test_system_profile_cannot_require_backup() {
        let mut profile = UserProfile::new(
            UserId::new("S-1-5-18").unwrap(),
            "SYSTEM",
            r"C:\Windows\system32\config\systemprofile",
            ProfileType::System,
            now(),
        );
        let err = profile.set_backup_requirement(true, 500, now()).unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
        assert!(!profile.requires_backup);
        assert_eq!(profile.backup_priority, 0);
    }

    #[test]
    fn test_priority_clamped_to_valid_range() {
        let mut profile = UserProfile::new(
            UserId::new("S-1-5-21-2").unwrap(),
            "bob",
            r"C:\Users\bob",
            ProfileType::AzureAd,
            now(),
        );
        profile.set_backup_requirement(true, 0, now()).unwrap();
        assert_eq!(profile.backup_priority, 1);
        profile.set_backup_requirement(true, 5000, now()).unwrap();
        assert_eq!(profile.backup_priority, 999);
    }

    #[test]
    fn test_clearing_backup_resets_priority() {
        let mut profile = UserProfile::new(
            UserId::new("S-1-5-21-3").unwrap(),
            "carol",
            r"C:\Users\carol",
            ProfileType::Local,
            now(),
        );
        profile.set_backup_requirement(true, 300, now()).unwrap();
        profile.set_backup_requirement(false, 300, now()).unwrap();
        assert_eq!(profile.backup_priority, 0);
    }

    #[test]
    fn test_metrics_derived_fields() {
        let metrics = ProfileMetrics {
            profile_size_bytes: 3 * 1024 * 1024,
            last_login: Some("2026-02-19T12:00:00Z".parse().unwrap()),
            last_activity: Some("2026-02-27T12:00:00Z".parse().unwrap()),
            ..ProfileMetrics::default()
        };
        assert_eq!(metrics.days_since_login(now()), Some(10));
        assert_eq!(metrics.days_since_activity(now()), Some(2));
        assert_eq!(metrics.profile_size_mb(), 3);
    }
}
