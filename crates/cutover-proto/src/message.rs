//! Message envelope and typed payloads
//!
//! Every frame carries an [`Envelope`]; its `payload` shape is determined by
//! the message type. Payload structs serialize camelCase and implement
//! [`Payload`] so handlers get typed access via
//! [`Envelope::decode_payload`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::ProtoError;

// ============================================================================
// Message types
// ============================================================================

/// The closed set of wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// S→A: ask an agent to begin backing up
    #[serde(rename = "BACKUP_REQUEST")]
    BackupRequest,
    /// S→A broadcast: aggregate migration status
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate,
    /// S→A: an escalation was raised for this user
    #[serde(rename = "ESCALATION_NOTICE")]
    EscalationNotice,
    /// S→A: configuration changed
    #[serde(rename = "CONFIGURATION_UPDATE")]
    ConfigurationUpdate,
    /// S→A: the service is shutting down
    #[serde(rename = "SHUTDOWN_REQUEST")]
    ShutdownRequest,
    /// A→S: agent announces itself and binds its user
    #[serde(rename = "AGENT_STARTED")]
    AgentStarted,
    /// A→S: backup began
    #[serde(rename = "BACKUP_STARTED")]
    BackupStarted,
    /// A→S: per-category progress report
    #[serde(rename = "BACKUP_PROGRESS")]
    BackupProgress,
    /// A→S: backup finished
    #[serde(rename = "BACKUP_COMPLETED")]
    BackupCompleted,
    /// A→S: user asks to postpone
    #[serde(rename = "DELAY_REQUEST")]
    DelayRequest,
    /// A→S: user interacted with the agent UI
    #[serde(rename = "USER_ACTION")]
    UserAction,
    /// A→S: agent-side error report
    #[serde(rename = "ERROR_REPORT")]
    ErrorReport,
    /// Both directions: liveness probe
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    /// Both directions: response to a prior message
    #[serde(rename = "ACKNOWLEDGMENT")]
    Acknowledgment,
}

impl MessageType {
    /// The wire name of this type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::BackupRequest => "BACKUP_REQUEST",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::EscalationNotice => "ESCALATION_NOTICE",
            MessageType::ConfigurationUpdate => "CONFIGURATION_UPDATE",
            MessageType::ShutdownRequest => "SHUTDOWN_REQUEST",
            MessageType::AgentStarted => "AGENT_STARTED",
            MessageType::BackupStarted => "BACKUP_STARTED",
            MessageType::BackupProgress => "BACKUP_PROGRESS",
            MessageType::BackupCompleted => "BACKUP_COMPLETED",
            MessageType::DelayRequest => "DELAY_REQUEST",
            MessageType::UserAction => "USER_ACTION",
            MessageType::ErrorReport => "ERROR_REPORT",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Acknowledgment => "ACKNOWLEDGMENT",
        }
    }

    /// Parse a wire name; unknown names are a protocol error
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        match s {
            "BACKUP_REQUEST" => Ok(MessageType::BackupRequest),
            "STATUS_UPDATE" => Ok(MessageType::StatusUpdate),
            "ESCALATION_NOTICE" => Ok(MessageType::EscalationNotice),
            "CONFIGURATION_UPDATE" => Ok(MessageType::ConfigurationUpdate),
            "SHUTDOWN_REQUEST" => Ok(MessageType::ShutdownRequest),
            "AGENT_STARTED" => Ok(MessageType::AgentStarted),
            "BACKUP_STARTED" => Ok(MessageType::BackupStarted),
            "BACKUP_PROGRESS" => Ok(MessageType::BackupProgress),
            "BACKUP_COMPLETED" => Ok(MessageType::BackupCompleted),
            "DELAY_REQUEST" => Ok(MessageType::DelayRequest),
            "USER_ACTION" => Ok(MessageType::UserAction),
            "ERROR_REPORT" => Ok(MessageType::ErrorReport),
            "HEARTBEAT" => Ok(MessageType::Heartbeat),
            "ACKNOWLEDGMENT" => Ok(MessageType::Acknowledgment),
            other => Err(ProtoError::UnknownType(other.to_string())),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// One wire message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id; replays of the same id are idempotent
    pub id: Uuid,
    /// Message type determining the payload shape
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Send time, ISO-8601 UTC
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload object
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed payload into an envelope with a fresh id
    pub fn new<P: Payload>(payload: &P, now: DateTime<Utc>) -> Result<Self, ProtoError> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type: P::TYPE,
            timestamp: now,
            payload: serde_json::to_value(payload)
                .map_err(|e| ProtoError::Malformed(format!("payload serialization: {e}")))?,
        })
    }

    /// Decode the payload as type `P`, checking the envelope's type tag
    pub fn decode_payload<P: Payload>(&self) -> Result<P, ProtoError> {
        if self.message_type != P::TYPE {
            return Err(ProtoError::PayloadMismatch {
                expected: P::TYPE,
                actual: self.message_type,
            });
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtoError::Malformed(format!("{} payload: {e}", self.message_type)))
    }
}

/// A typed payload tied to its message type
pub trait Payload: Serialize + DeserializeOwned {
    /// The envelope type this payload travels under
    const TYPE: MessageType;
}

// ============================================================================
// Service → Agent payloads
// ============================================================================

/// Backup urgency communicated to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Normal,
    High,
    Urgent,
}

/// `BACKUP_REQUEST`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    pub user_id: String,
    pub priority: RequestPriority,
    pub deadline: DateTime<Utc>,
    pub categories: Vec<String>,
}

impl Payload for BackupRequest {
    const TYPE: MessageType = MessageType::BackupRequest;
}

/// `STATUS_UPDATE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub overall_status: String,
    pub blocking_users: Vec<String>,
    pub ready_users: Vec<String>,
    pub total_users: u32,
}

impl Payload for StatusUpdate {
    const TYPE: MessageType = MessageType::StatusUpdate;
}

/// `ESCALATION_NOTICE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationNotice {
    pub reason: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_number: Option<String>,
}

impl Payload for EscalationNotice {
    const TYPE: MessageType = MessageType::EscalationNotice;
}

/// `CONFIGURATION_UPDATE` - free-form settings object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationUpdate(pub serde_json::Value);

impl Payload for ConfigurationUpdate {
    const TYPE: MessageType = MessageType::ConfigurationUpdate;
}

/// `SHUTDOWN_REQUEST`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Payload for ShutdownRequest {
    const TYPE: MessageType = MessageType::ShutdownRequest;
}

// ============================================================================
// Agent → Service payloads
// ============================================================================

/// `AGENT_STARTED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStarted {
    pub user_id: String,
    pub agent_version: String,
    pub session_id: String,
}

impl Payload for AgentStarted {
    const TYPE: MessageType = MessageType::AgentStarted;
}

/// `BACKUP_STARTED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStarted {
    pub user_id: String,
    pub categories: Vec<String>,
    pub estimated_size_mb: u64,
}

impl Payload for BackupStarted {
    const TYPE: MessageType = MessageType::BackupStarted;
}

/// `BACKUP_PROGRESS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub user_id: String,
    pub category: String,
    pub progress: u8,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

impl Payload for BackupProgress {
    const TYPE: MessageType = MessageType::BackupProgress;
}

/// Per-category outcome inside `BACKUP_COMPLETED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `BACKUP_COMPLETED`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCompleted {
    pub user_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<String>,
    pub categories: std::collections::BTreeMap<String, CategoryResult>,
}

impl Payload for BackupCompleted {
    const TYPE: MessageType = MessageType::BackupCompleted;
}

/// `DELAY_REQUEST`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRequest {
    pub user_id: String,
    pub reason: String,
    pub requested_delay_seconds: u64,
    pub delays_used: u32,
}

impl Payload for DelayRequest {
    const TYPE: MessageType = MessageType::DelayRequest;
}

/// `USER_ACTION`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAction {
    pub user_id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Payload for UserAction {
    const TYPE: MessageType = MessageType::UserAction;
}

/// `ERROR_REPORT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub user_id: String,
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorReport {
    /// Whether the agent marked this error as unrecoverable
    pub fn is_fatal(&self) -> bool {
        self.error_code.eq_ignore_ascii_case("FATAL")
            || self
                .context
                .as_ref()
                .and_then(|c| c.get("fatal"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}

impl Payload for ErrorReport {
    const TYPE: MessageType = MessageType::ErrorReport;
}

// ============================================================================
// Bidirectional payloads
// ============================================================================

/// `HEARTBEAT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub sender_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl Payload for Heartbeat {
    const TYPE: MessageType = MessageType::Heartbeat;
}

/// `ACKNOWLEDGMENT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub original_message_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Acknowledgment {
    /// Successful acknowledgment of `original`
    pub fn success(original: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            original_message_id: original,
            success: true,
            error: None,
            timestamp: now,
        }
    }

    /// Failure acknowledgment carrying a stable code and message
    pub fn failure(original: Uuid, error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            original_message_id: original,
            success: false,
            error: Some(error.into()),
            timestamp: now,
        }
    }
}

impl Payload for Acknowledgment {
    const TYPE: MessageType = MessageType::Acknowledgment;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_type_names_round_trip() {
        for ty in [
            MessageType::BackupRequest,
            MessageType::StatusUpdate,
            MessageType::EscalationNotice,
            MessageType::ConfigurationUpdate,
            MessageType::ShutdownRequest,
            MessageType::AgentStarted,
            MessageType::BackupStarted,
            MessageType::BackupProgress,
            MessageType::BackupCompleted,
            MessageType::DelayRequest,
            MessageType::UserAction,
            MessageType::ErrorReport,
            MessageType::Heartbeat,
            MessageType::Acknowledgment,
        ] {
            assert_eq!(MessageType::parse(ty.as_str()).unwrap(), ty);
        }
        assert!(MessageType::parse("RESET_NOW").is_err());
    }

    #[test]
    fn test_wire_fields_are_camel_case() {
        let progress = BackupProgress {
            user_id: "S-1-5-21-1".to_string(),
            category: "files".to_string(),
            progress: 40,
            bytes_transferred: 1024,
            bytes_total: 4096,
            current_file: Some("report.docx".to_string()),
        };
        let envelope = Envelope::new(&progress, now()).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();

        assert!(json.get("type").is_some());
        assert_eq!(json["type"], "BACKUP_PROGRESS");
        assert!(json["payload"].get("userId").is_some());
        assert!(json["payload"].get("bytesTransferred").is_some());
        assert!(json["payload"].get("currentFile").is_some());
        assert!(json["payload"].get("bytes_transferred").is_none());
    }

    #[test]
    fn test_decode_payload_checks_type_tag() {
        let heartbeat = Heartbeat {
            sender_id: "agent-1".to_string(),
            sequence_number: 7,
            timestamp: now(),
        };
        let envelope = Envelope::new(&heartbeat, now()).unwrap();

        let decoded: Heartbeat = envelope.decode_payload().unwrap();
        assert_eq!(decoded, heartbeat);

        let err = envelope.decode_payload::<BackupProgress>().unwrap_err();
        assert!(matches!(err, ProtoError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let ack = Acknowledgment::success(Uuid::new_v4(), now());
        let json = serde_json::to_value(&ack).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("originalMessageId").is_some());

        let failure = Acknowledgment::failure(Uuid::new_v4(), "STORE: write failed", now());
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "STORE: write failed");
    }

    #[test]
    fn test_backup_completed_category_map() {
        let raw = serde_json::json!({
            "userId": "S-1-5-21-1",
            "success": true,
            "manifestPath": "C:\\backup\\manifest.json",
            "categories": {
                "files": {"success": true, "itemCount": 1234},
                "email": {"success": false, "error": "pst locked"}
            }
        });
        let completed: BackupCompleted = serde_json::from_value(raw).unwrap();
        assert!(completed.categories["files"].success);
        assert_eq!(completed.categories["files"].item_count, Some(1234));
        assert_eq!(
            completed.categories["email"].error.as_deref(),
            Some("pst locked")
        );
    }

    #[test]
    fn test_error_report_fatal_detection() {
        let report = ErrorReport {
            user_id: "S-1-5-21-1".to_string(),
            error_code: "fatal".to_string(),
            message: "agent crashed".to_string(),
            stack_trace: None,
            context: None,
        };
        assert!(report.is_fatal());

        let report = ErrorReport {
            error_code: "E_DISK".to_string(),
            context: Some(serde_json::json!({"fatal": true})),
            ..report
        };
        assert!(report.is_fatal());

        let report = ErrorReport {
            user_id: "S-1-5-21-1".to_string(),
            error_code: "E_DISK".to_string(),
            message: "retryable".to_string(),
            stack_trace: None,
            context: None,
        };
        assert!(!report.is_fatal());
    }
}
