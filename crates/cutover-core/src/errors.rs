//! Service-wide error taxonomy
//!
//! Every error that crosses a component boundary is classified into one of
//! the kinds below. Errors that cross the IPC boundary carry only the stable
//! code and a human-readable string; internals (paths, SQL, stack traces)
//! never leave the process.

use thiserror::Error;

/// The service-wide error taxonomy
///
/// Each variant carries a human-readable message. The variant itself is the
/// classification; [`ServiceError::code`] yields the stable string used on
/// the wire and in logs.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failure in the state store
    #[error("Store error: {0}")]
    Store(String),

    /// I/O failure on the local message channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unknown message type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An external capability (profile detector, cloud connector, ...) failed
    #[error("Capability '{capability}' failed: {message}")]
    Capability {
        /// Which capability failed
        capability: String,
        /// What went wrong
        message: String,
    },

    /// Rule-engine or policy misconfiguration
    #[error("Policy error: {0}")]
    Policy(String),

    /// Uniqueness violation; callers may treat this as an idempotent no-op
    #[error("Conflict: {0}")]
    Conflict(String),

    /// An operation exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by shutdown or caller
    #[error("Cancelled")]
    Cancelled,

    /// Unrecoverable fault; triggers process-level shutdown
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Stable error code for logs and the IPC boundary
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Config(_) => "CONFIG",
            ServiceError::Store(_) => "STORE",
            ServiceError::Transport(_) => "TRANSPORT",
            ServiceError::Protocol(_) => "PROTOCOL",
            ServiceError::Capability { .. } => "CAPABILITY",
            ServiceError::Policy(_) => "POLICY",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Timeout(_) => "TIMEOUT",
            ServiceError::Cancelled => "CANCELLED",
            ServiceError::Fatal(_) => "FATAL",
        }
    }

    /// Message safe to surface across the IPC boundary
    ///
    /// Uses the display form, which by construction contains no internals.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Whether this error must trigger process-level shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServiceError::Fatal(_))
    }

    /// Convenience constructor for capability failures
    pub fn capability(capability: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Capability {
            capability: capability.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by domain-entity validation and state transitions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Identifier failed validation
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Unknown enum text encountered (typically on store reads)
    #[error("Unknown {kind} value: {value}")]
    UnknownEnumValue {
        /// Which enum was being parsed
        kind: &'static str,
        /// The offending text
        value: String,
    },

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl From<DomainError> for ServiceError {
    fn from(err: DomainError) -> Self {
        ServiceError::Policy(err.to_string())
    }
}
