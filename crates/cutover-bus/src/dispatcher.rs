//! Dispatcher - routes decoded messages to their handlers
//!
//! Exactly one handler per message type; registering a second handler for
//! the same type is a programmer error and panics. Dispatch enforces a
//! per-call timeout and replay idempotency: a message id seen before gets
//! the recorded response back without re-invoking the handler.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use cutover_core::domain::newtypes::ClientId;
use cutover_core::ServiceError;
use cutover_proto::message::{Acknowledgment, Envelope, MessageType};

/// What a handler returns: a typed response envelope, or `None` for a
/// synthesized success acknowledgment
pub type HandlerResult = Result<Option<Envelope>, ServiceError>;

/// Per-dispatch context passed to handlers
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext {
    /// The connection the message arrived on
    pub client_id: ClientId,
}

/// A registered message handler
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Process one message
    ///
    /// Must be idempotent per message id; the dispatcher's replay cache
    /// protects against re-invocation for recently seen ids, but handlers
    /// should not rely on it for correctness of persistent state.
    async fn handle(&self, ctx: HandlerContext, envelope: &Envelope) -> HandlerResult;
}

/// Outcome of dispatching one message
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// The response to send back
    pub response: Envelope,
    /// Whether the handler succeeded
    pub success: bool,
}

/// Number of recent message ids remembered for replay idempotency
const REPLAY_CACHE_CAPACITY: usize = 1_024;

struct ReplayCache {
    order: VecDeque<Uuid>,
    entries: HashMap<Uuid, DispatchOutcome>,
}

impl ReplayCache {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(REPLAY_CACHE_CAPACITY),
            entries: HashMap::with_capacity(REPLAY_CACHE_CAPACITY),
        }
    }

    fn get(&self, id: &Uuid) -> Option<DispatchOutcome> {
        self.entries.get(id).cloned()
    }

    fn insert(&mut self, id: Uuid, outcome: DispatchOutcome) {
        if self.entries.len() >= REPLAY_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        if self.entries.insert(id, outcome).is_none() {
            self.order.push_back(id);
        }
    }
}

/// Routes messages to handlers and synthesizes acknowledgments
pub struct Dispatcher {
    handlers: HashMap<MessageType, Box<dyn Handler>>,
    timeout: Duration,
    replay: Mutex<ReplayCache>,
}

impl Dispatcher {
    /// Create a dispatcher with the given per-call timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
            replay: Mutex::new(ReplayCache::new()),
        }
    }

    /// Register the handler for a message type
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for `message_type`; two
    /// handlers for one type is a programming error.
    pub fn register(&mut self, message_type: MessageType, handler: Box<dyn Handler>) {
        if self.handlers.insert(message_type, handler).is_some() {
            panic!("duplicate handler registered for {message_type}");
        }
    }

    /// Whether a handler is registered for `message_type`
    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Dispatch one message and produce the response to send back
    pub async fn dispatch(&self, client_id: ClientId, envelope: &Envelope) -> DispatchOutcome {
        // Replayed ids get the recorded response, with no second mutation.
        if let Some(cached) = self.replay.lock().unwrap().get(&envelope.id) {
            debug!(message_id = %envelope.id, "Replayed message; returning cached response");
            return cached;
        }

        let outcome = self.dispatch_fresh(client_id, envelope).await;
        self.replay
            .lock()
            .unwrap()
            .insert(envelope.id, outcome.clone());
        outcome
    }

    async fn dispatch_fresh(&self, client_id: ClientId, envelope: &Envelope) -> DispatchOutcome {
        let now = Utc::now();
        let Some(handler) = self.handlers.get(&envelope.message_type) else {
            warn!(message_type = %envelope.message_type, "No handler registered");
            return self.failure(envelope, "PROTOCOL: no handler for message type");
        };

        let ctx = HandlerContext { client_id };
        match tokio::time::timeout(self.timeout, handler.handle(ctx, envelope)).await {
            Ok(Ok(Some(response))) => DispatchOutcome {
                response,
                success: true,
            },
            Ok(Ok(None)) => {
                let ack = Acknowledgment::success(envelope.id, now);
                DispatchOutcome {
                    response: Envelope::new(&ack, now).expect("ack serializes"),
                    success: true,
                }
            }
            Ok(Err(error)) => {
                debug!(
                    message_type = %envelope.message_type,
                    code = error.code(),
                    error = %error,
                    "Handler failed"
                );
                self.failure(
                    envelope,
                    format!("{}: {}", error.code(), error.user_message()),
                )
            }
            Err(_) => {
                warn!(
                    message_type = %envelope.message_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Handler timed out"
                );
                self.failure(envelope, "TIMEOUT: handler exceeded its deadline")
            }
        }
    }

    fn failure(&self, envelope: &Envelope, error: impl Into<String>) -> DispatchOutcome {
        let now = Utc::now();
        let ack = Acknowledgment::failure(envelope.id, error, now);
        DispatchOutcome {
            response: Envelope::new(&ack, now).expect("ack serializes"),
            success: false,
        }
    }
}
