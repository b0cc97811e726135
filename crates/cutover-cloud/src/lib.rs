//! Cutover Cloud - cloud readiness and quota
//!
//! Everything the orchestrator needs to know about the per-user cloud sync
//! client:
//! - [`status::CloudStatusService`] - cached readiness snapshots (5-minute TTL)
//! - [`scope::SelectiveSyncService`] - selective-sync scope control
//! - [`ops::SyncOperationService`] - tracked folder uploads with stall detection
//! - [`recovery::ErrorRecoveryService`] - sync-error categorization and retry
//! - [`quota::QuotaService`] - quota health, warnings and escalation
//! - [`escalate::EscalationEngine`] - cooldown-collapsed escalation records

pub mod escalate;
pub mod ops;
#[cfg(test)]
pub(crate) mod testutil;
pub mod quota;
pub mod recovery;
pub mod scope;
pub mod status;

pub use escalate::EscalationEngine;
pub use ops::SyncOperationService;
pub use quota::QuotaService;
pub use recovery::{categorize_error, ErrorRecoveryService};
pub use scope::SelectiveSyncService;
pub use status::CloudStatusService;
