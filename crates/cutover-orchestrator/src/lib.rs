//! Cutover Orchestrator - the per-user backup state machine
//!
//! The orchestrator owns every user's [`MigrationPhase`], rolls per-category
//! backup progress up into an overall figure, enforces the delay policy,
//! raises escalations when progress stalls, and maintains the machine-wide
//! reset gate: no reset while any active user with backup requirements has
//! not reached `ReadyForReset` or `Completed`.
//!
//! Inbound agent messages reach it through the handlers in [`handlers`],
//! registered on the bus dispatcher; a periodic evaluation pass re-checks
//! cloud readiness, quotas, deadlines and elapsed delays.
//!
//! [`MigrationPhase`]: cutover_core::domain::backup::MigrationPhase

pub mod handlers;
pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorConfig, ResetGate};
