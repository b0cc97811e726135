//! Escalation engine
//!
//! Creates durable escalation records and submits them to the ticketing
//! sink. Recurrences collapse: while an open escalation of the same kind
//! exists for the same user, a new occurrence amends its details and bumps
//! `updated_at` instead of creating a duplicate record or a second ticket.

use std::sync::Arc;

use tracing::{info, warn};

use cutover_core::domain::escalation::{Escalation, EscalationKind, EscalationPriority};
use cutover_core::domain::newtypes::UserId;
use cutover_core::ports::{Clock, EscalationSink};
use cutover_core::ServiceError;
use cutover_store::StateStore;

/// Cooldown-collapsed escalation creation
pub struct EscalationEngine {
    store: Arc<StateStore>,
    sink: Arc<dyn EscalationSink>,
    clock: Arc<dyn Clock>,
}

impl EscalationEngine {
    /// Create the engine
    pub fn new(store: Arc<StateStore>, sink: Arc<dyn EscalationSink>, clock: Arc<dyn Clock>) -> Self {
        Self { store, sink, clock }
    }

    /// Raise an escalation, collapsing into an existing open one
    ///
    /// Returns the escalation record (new or amended). Sink submission
    /// failures are logged and never block the durable record.
    pub async fn raise(
        &self,
        user_id: Option<&UserId>,
        kind: EscalationKind,
        priority: EscalationPriority,
        description: impl Into<String>,
        details: serde_json::Value,
    ) -> Result<Escalation, ServiceError> {
        let now = self.clock.now();

        if let Some(mut open) = self.store.open_escalation(user_id, kind).await? {
            open.amend(details, now);
            if priority > open.priority {
                open.priority = priority;
            }
            self.store.save_escalation(&open).await?;
            info!(
                escalation_id = %open.id,
                kind = kind.as_str(),
                "Escalation recurrence collapsed into open record"
            );
            return Ok(open);
        }

        let escalation = Escalation::new(
            user_id.cloned(),
            kind,
            priority,
            description.into(),
            details,
            now,
        );
        self.store.save_escalation(&escalation).await?;

        match self.sink.submit(&escalation).await {
            Ok(ticket) => {
                info!(
                    escalation_id = %escalation.id,
                    kind = kind.as_str(),
                    ticket = ticket.as_deref().unwrap_or("-"),
                    "Escalation submitted"
                );
            }
            Err(e) => {
                warn!(
                    escalation_id = %escalation.id,
                    error = %e,
                    "Ticketing sink rejected escalation; record kept"
                );
            }
        }

        Ok(escalation)
    }

    /// Resolve the open escalation of a kind for a user, if one exists
    pub async fn resolve(
        &self,
        user_id: Option<&UserId>,
        kind: EscalationKind,
    ) -> Result<(), ServiceError> {
        if let Some(mut open) = self.store.open_escalation(user_id, kind).await? {
            open.resolve(self.clock.now());
            self.store.save_escalation(&open).await?;
            info!(escalation_id = %open.id, kind = kind.as_str(), "Escalation resolved");
        }
        Ok(())
    }
}

/// Sink used in tests and in installations without a ticketing system
pub struct NullEscalationSink;

#[async_trait::async_trait]
impl EscalationSink for NullEscalationSink {
    async fn submit(&self, _escalation: &Escalation) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockClock;
    use chrono::Duration;
    use cutover_store::DatabasePool;
    use std::sync::Mutex;

    struct CountingSink {
        submissions: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl EscalationSink for CountingSink {
        async fn submit(&self, _escalation: &Escalation) -> anyhow::Result<Option<String>> {
            *self.submissions.lock().unwrap() += 1;
            Ok(Some("IT-1001".to_string()))
        }
    }

    fn user() -> UserId {
        UserId::new("S-1-5-21-70").unwrap()
    }

    async fn engine() -> (EscalationEngine, Arc<StateStore>, Arc<CountingSink>, Arc<MockClock>) {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(StateStore::new(pool.pool().clone()));
        let sink = Arc::new(CountingSink {
            submissions: Mutex::new(0),
        });
        let clock = Arc::new(MockClock::new("2026-03-01T12:00:00Z"));
        (
            EscalationEngine::new(store.clone(), sink.clone(), clock.clone()),
            store,
            sink,
            clock,
        )
    }

    #[tokio::test]
    async fn test_second_raise_collapses_and_bumps_updated_at() {
        let (engine, store, sink, clock) = engine().await;

        let first = engine
            .raise(
                Some(&user()),
                EscalationKind::InsufficientSpace,
                EscalationPriority::Critical,
                "backup does not fit",
                serde_json::json!({"shortfall_mb": 2600}),
            )
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        let second = engine
            .raise(
                Some(&user()),
                EscalationKind::InsufficientSpace,
                EscalationPriority::Critical,
                "backup does not fit",
                serde_json::json!({"shortfall_mb": 2700}),
            )
            .await
            .unwrap();

        // One record, one ticket; updated_at advanced.
        assert_eq!(first.id, second.id);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(*sink.submissions.lock().unwrap(), 1);
        assert_eq!(store.open_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolved_escalation_allows_a_new_one() {
        let (engine, store, sink, clock) = engine().await;

        engine
            .raise(
                Some(&user()),
                EscalationKind::SyncErrors,
                EscalationPriority::High,
                "sync errors exhausted retries",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        engine
            .resolve(Some(&user()), EscalationKind::SyncErrors)
            .await
            .unwrap();

        clock.advance(Duration::hours(1));
        engine
            .raise(
                Some(&user()),
                EscalationKind::SyncErrors,
                EscalationPriority::High,
                "sync errors exhausted retries again",
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(*sink.submissions.lock().unwrap(), 2);
        assert_eq!(store.open_escalations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_kinds_do_not_collapse() {
        let (engine, store, _sink, _clock) = engine().await;

        engine
            .raise(
                Some(&user()),
                EscalationKind::InsufficientSpace,
                EscalationPriority::Critical,
                "space",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        engine
            .raise(
                Some(&user()),
                EscalationKind::UserBusyExhausted,
                EscalationPriority::Normal,
                "delays exhausted",
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(store.open_escalations().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_collapse_escalates_priority_upward_only() {
        let (engine, _store, _sink, _clock) = engine().await;

        engine
            .raise(
                Some(&user()),
                EscalationKind::SyncErrors,
                EscalationPriority::Normal,
                "first",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        let amended = engine
            .raise(
                Some(&user()),
                EscalationKind::SyncErrors,
                EscalationPriority::Critical,
                "worse now",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(amended.priority, EscalationPriority::Critical);

        let still = engine
            .raise(
                Some(&user()),
                EscalationKind::SyncErrors,
                EscalationPriority::Low,
                "minor recurrence",
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(still.priority, EscalationPriority::Critical);
    }
}
