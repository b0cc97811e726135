//! Domain model for the migration service
//!
//! Entities are grouped by subsystem. All timestamps are UTC; all
//! identifiers are strongly typed via [`newtypes`].

pub mod backup;
pub mod classification;
pub mod cloud;
pub mod escalation;
pub mod newtypes;
pub mod profile;
pub mod quota;

pub use backup::{BackupCategory, BackupOperation, MigrationPhase, MigrationState, OperationStatus};
pub use classification::{
    Classification, ClassificationChange, ClassificationOverride, ClassificationRecord,
};
pub use cloud::{
    CloudAccountInfo, CloudStatusSnapshot, KfmStatus, SyncError, SyncErrorCategory, SyncOperation,
    SyncStatus, SyncedFolder,
};
pub use escalation::{Escalation, EscalationKind, EscalationPriority};
pub use profile::{ProfileMetrics, ProfileType, UserProfile};
pub use quota::{QuotaHealth, QuotaStatus, QuotaWarning, QuotaWarningType, WarningLevel};
