//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for identifiers. User identifiers are opaque
//! strings (Windows SIDs in practice); everything the service mints itself
//! is a UUID.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

// ============================================================================
// UserId - opaque string identifier
// ============================================================================

/// Opaque identifier for a local user account
///
/// In practice this is a Windows SID (`S-1-5-21-...`), but the service never
/// interprets its structure beyond the well-known system prefixes checked by
/// the classification engine. Must be non-empty and free of whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a UserId, validating the raw string
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::InvalidId("user id must not be empty".into()));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidId(format!(
                "user id must not contain whitespace: {raw:?}"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrow the raw identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// UUID-based ID types
// ============================================================================

macro_rules! uuid_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID value
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| DomainError::InvalidId(format!(
                        concat!("Invalid ", stringify!($name), ": {}"), e
                    )))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_newtype! {
    /// Identifier assigned to each accepted bus connection
    ClientId
}

uuid_newtype! {
    /// Identifier for a per-category backup operation
    OperationId
}

uuid_newtype! {
    /// Identifier for a tracked cloud sync operation
    SyncOpId
}

uuid_newtype! {
    /// Identifier for an escalation record
    EscalationId
}

uuid_newtype! {
    /// Identifier for a quota warning
    WarningId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_accepts_sid() {
        let id = UserId::new("S-1-5-21-1004336348-1177238915-682003330-512").unwrap();
        assert_eq!(id.as_str(), "S-1-5-21-1004336348-1177238915-682003330-512");
    }

    #[test]
    fn test_user_id_rejects_empty() {
        assert!(UserId::new("").is_err());
    }

    #[test]
    fn test_user_id_rejects_whitespace() {
        assert!(UserId::new("S-1-5 21").is_err());
        assert!(UserId::new("user\tname").is_err());
    }

    #[test]
    fn test_user_id_round_trips_via_display() {
        let id = UserId::new("S-1-5-21-42").unwrap();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_client_id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<ClientId>().is_err());
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        assert_ne!(OperationId::new(), OperationId::new());
        assert_ne!(SyncOpId::new(), SyncOpId::new());
    }

    #[test]
    fn test_uuid_id_round_trip() {
        let id = EscalationId::new();
        let parsed: EscalationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_serde_transparent() {
        let id = UserId::new("S-1-5-18").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"S-1-5-18\"");
    }
}
