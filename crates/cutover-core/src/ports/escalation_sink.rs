//! Escalation sink port
//!
//! Hands a created escalation to the ticketing system. The adapter owns
//! transport and authentication; the core only submits.

use crate::domain::escalation::Escalation;

/// Port trait for the ticketing system
#[async_trait::async_trait]
pub trait EscalationSink: Send + Sync {
    /// Submit an escalation, returning the ticket number when one is issued
    async fn submit(&self, escalation: &Escalation) -> anyhow::Result<Option<String>>;
}
