//! Message handlers
//!
//! One handler per accepted inbound type, each a thin decode-and-delegate
//! shim over the orchestrator. Handlers are idempotent per message id: the
//! dispatcher's replay cache returns recorded responses, and the
//! orchestrator's state transitions tolerate re-application (monotone
//! progress, no-op phase re-entry).

use std::sync::Arc;

use chrono::Duration;

use cutover_bus::{Dispatcher, Handler, HandlerContext, HandlerResult};
use cutover_core::domain::backup::BackupCategory;
use cutover_core::domain::newtypes::UserId;
use cutover_core::ServiceError;
use cutover_proto::message::{
    AgentStarted, BackupCompleted, BackupProgress, BackupStarted, DelayRequest, Envelope,
    ErrorReport, MessageType, UserAction,
};

use crate::orchestrator::Orchestrator;

fn parse_user(raw: &str) -> Result<UserId, ServiceError> {
    UserId::new(raw).map_err(|e| ServiceError::Protocol(e.to_string()))
}

fn decode<P: cutover_proto::message::Payload>(envelope: &Envelope) -> Result<P, ServiceError> {
    envelope
        .decode_payload()
        .map_err(|e| ServiceError::Protocol(e.to_string()))
}

/// Register every inbound handler on the dispatcher
pub fn register_all(dispatcher: &mut Dispatcher, orchestrator: Arc<Orchestrator>) {
    dispatcher.register(
        MessageType::AgentStarted,
        Box::new(AgentStartedHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::BackupStarted,
        Box::new(BackupStartedHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::BackupProgress,
        Box::new(BackupProgressHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::BackupCompleted,
        Box::new(BackupCompletedHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::DelayRequest,
        Box::new(DelayRequestHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::UserAction,
        Box::new(UserActionHandler(orchestrator.clone())),
    );
    dispatcher.register(
        MessageType::ErrorReport,
        Box::new(ErrorReportHandler(orchestrator)),
    );
    dispatcher.register(MessageType::Heartbeat, Box::new(HeartbeatHandler));
    dispatcher.register(MessageType::Acknowledgment, Box::new(AckHandler));
}

struct AgentStartedHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for AgentStartedHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: AgentStarted = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        self.0.agent_started(&user_id).await?;
        Ok(None)
    }
}

struct BackupStartedHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for BackupStartedHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: BackupStarted = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        self.0.backup_started(&user_id, &payload.categories).await?;
        Ok(None)
    }
}

struct BackupProgressHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for BackupProgressHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: BackupProgress = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        let category = BackupCategory::parse(&payload.category)
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        self.0
            .backup_progress(
                &user_id,
                category,
                payload.progress,
                payload.bytes_transferred,
                payload.bytes_total,
            )
            .await?;
        Ok(None)
    }
}

struct BackupCompletedHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for BackupCompletedHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: BackupCompleted = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        self.0
            .backup_completed(&user_id, payload.success, &payload.categories)
            .await?;
        Ok(None)
    }
}

struct DelayRequestHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for DelayRequestHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: DelayRequest = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        self.0
            .delay_requested(
                &user_id,
                &payload.reason,
                Duration::seconds(payload.requested_delay_seconds as i64),
            )
            .await?;
        Ok(None)
    }
}

struct UserActionHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for UserActionHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: UserAction = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        self.0.user_action(&user_id, &payload.action).await?;
        Ok(None)
    }
}

struct ErrorReportHandler(Arc<Orchestrator>);

#[async_trait::async_trait]
impl Handler for ErrorReportHandler {
    async fn handle(&self, _ctx: HandlerContext, envelope: &Envelope) -> HandlerResult {
        let payload: ErrorReport = decode(envelope)?;
        let user_id = parse_user(&payload.user_id)?;
        let fatal = payload.is_fatal();
        self.0
            .error_reported(&user_id, &payload.error_code, &payload.message, fatal)
            .await?;
        Ok(None)
    }
}

/// Heartbeats refresh the connection's liveness in the hub; nothing to do
/// here beyond acknowledging.
struct HeartbeatHandler;

#[async_trait::async_trait]
impl Handler for HeartbeatHandler {
    async fn handle(&self, _ctx: HandlerContext, _envelope: &Envelope) -> HandlerResult {
        Ok(None)
    }
}

/// Agents acknowledge our broadcasts; those acks need no response.
struct AckHandler;

#[async_trait::async_trait]
impl Handler for AckHandler {
    async fn handle(&self, _ctx: HandlerContext, _envelope: &Envelope) -> HandlerResult {
        Ok(None)
    }
}
