//! Cutover Logging - buffered activity-record pipeline
//!
//! Structured service activity (backup milestones, escalations, gate
//! changes) flows through this pipeline to one or more sinks: a rotated
//! file, the console, or anything implementing [`Sink`]. Each sink gets its
//! own writer task with a bounded queue, batching, an overflow policy, and a
//! back-pressure signal.
//!
//! This is deliberately separate from `tracing`, which carries developer
//! diagnostics; the activity pipeline is a product feature with durability
//! and rotation requirements of its own.

pub mod sinks;
pub mod writer;

pub use sinks::{ConsoleSink, FileSink, MemorySink, Sink};
pub use writer::{OverflowPolicy, SinkWriter, WriterConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ============================================================================
// Records and events
// ============================================================================

/// Severity of an activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// When the activity happened
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: ActivityLevel,
    /// Emitting subsystem (e.g. `orchestrator`, `quota`)
    pub source: String,
    /// Human-readable event description
    pub message: String,
    /// User the record concerns, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Structured context fields
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

impl ActivityRecord {
    /// Build a record with the given severity
    pub fn new(
        level: ActivityLevel,
        source: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: now,
            level,
            source: source.into(),
            message: message.into(),
            user_id: None,
            fields: serde_json::Value::Null,
        }
    }

    /// Attach the user the record concerns
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach structured context
    pub fn with_fields(mut self, fields: serde_json::Value) -> Self {
        self.fields = fields;
        self
    }

    /// Render as one JSON line for file and console sinks
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"timestamp\":\"{}\",\"message\":\"unserializable record\"}}",
                self.timestamp.to_rfc3339()
            )
        })
    }
}

/// Events emitted by the pipeline itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A writer's queue crossed its high-watermark (raised once per crossing)
    QueuePressure {
        /// Name of the affected sink
        sink: String,
        /// Queue depth at the moment of crossing
        depth: usize,
    },
}

// ============================================================================
// Pipeline
// ============================================================================

/// Fan-out pipeline over a set of sink writers
pub struct LogPipeline {
    writers: Vec<SinkWriter>,
    events_tx: broadcast::Sender<PipelineEvent>,
}

impl LogPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            writers: Vec::new(),
            events_tx,
        }
    }

    /// Attach a sink with its own writer configuration
    pub fn attach(&mut self, name: impl Into<String>, sink: Box<dyn Sink>, config: WriterConfig) {
        self.writers
            .push(SinkWriter::spawn(name.into(), sink, config, self.events_tx.clone()));
    }

    /// Subscribe to pipeline events
    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    /// Enqueue a record on every writer
    ///
    /// Non-blocking unless a writer uses [`OverflowPolicy::Block`] and its
    /// queue is full.
    pub async fn log(&self, record: ActivityRecord) {
        for writer in &self.writers {
            writer.enqueue(record.clone()).await;
        }
    }

    /// Drain every queue and flush every sink
    pub async fn flush(&self) {
        for writer in &self.writers {
            writer.flush().await;
        }
    }

    /// Flush everything, then stop all writer tasks
    pub async fn shutdown(self) {
        for writer in self.writers {
            writer.shutdown().await;
        }
    }

    /// Total sink errors swallowed so far, per writer
    pub fn error_counts(&self) -> Vec<(String, u64)> {
        self.writers
            .iter()
            .map(|w| (w.name().to_string(), w.error_count()))
            .collect()
    }
}

impl Default for LogPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_record_json_line_shape() {
        let record = ActivityRecord::new(ActivityLevel::Info, "orchestrator", "gate opened", now())
            .with_user("S-1-5-21-1")
            .with_fields(serde_json::json!({"readyUsers": 3}));
        let line = record.to_json_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["source"], "orchestrator");
        assert_eq!(value["user_id"], "S-1-5-21-1");
        assert_eq!(value["fields"]["readyUsers"], 3);
    }

    #[test]
    fn test_record_omits_empty_optionals() {
        let record = ActivityRecord::new(ActivityLevel::Warn, "quota", "usage high", now());
        let value: serde_json::Value = serde_json::from_str(&record.to_json_line()).unwrap();
        assert!(value.get("user_id").is_none());
        assert!(value.get("fields").is_none());
    }

    #[tokio::test]
    async fn test_pipeline_fans_out_to_all_sinks() {
        let sink_a = MemorySink::new();
        let sink_b = MemorySink::new();

        let mut pipeline = LogPipeline::new();
        pipeline.attach("a", Box::new(sink_a.clone()), WriterConfig::default());
        pipeline.attach("b", Box::new(sink_b.clone()), WriterConfig::default());

        pipeline
            .log(ActivityRecord::new(
                ActivityLevel::Info,
                "test",
                "hello",
                now(),
            ))
            .await;
        pipeline.flush().await;

        assert_eq!(sink_a.records().len(), 1);
        assert_eq!(sink_b.records().len(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_records() {
        let sink = MemorySink::new();
        let mut pipeline = LogPipeline::new();
        pipeline.attach("mem", Box::new(sink.clone()), WriterConfig::default());

        for i in 0..10 {
            pipeline
                .log(ActivityRecord::new(
                    ActivityLevel::Debug,
                    "test",
                    format!("record {i}"),
                    now(),
                ))
                .await;
        }
        pipeline.shutdown().await;

        assert_eq!(sink.records().len(), 10);
    }
}
