//! Cutover Profile - classification of local user profiles
//!
//! Given a profile and its freshly gathered metrics, the engine decides
//! whether the user is Active, Inactive, System, Temporary, Corrupted or
//! Unknown, and from that whether their data must be backed up before the
//! machine may be reset.
//!
//! Decision order:
//! 1. An unexpired manual override wins outright.
//! 2. Fixed rules catch system accounts, temporary profiles and unreadable
//!    profiles.
//! 3. The active rule set is evaluated (rules sorted by descending
//!    priority; first decisive match wins).
//! 4. If nothing matches, the rule set's default classification applies.
//!
//! An informational activity score (0-100) is computed alongside and may be
//! referenced by rules via the `activityScore` property.

pub mod requirements;
pub mod rules;
pub mod score;
pub mod service;

pub use requirements::BackupPolicy;
pub use rules::{CompiledRuleSet, Condition, Combinator, Operator, Rule, RuleSet};
pub use score::activity_score;
pub use service::ProfileService;
