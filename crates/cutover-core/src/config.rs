//! Configuration module for the cutover service.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! file, with loading, validation and defaults. Every duration knob is
//! expressed in the unit its name carries; accessors convert to
//! `chrono::Duration` / `std::time::Duration` where callers need them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::backup::BackupCategory;

/// Top-level configuration for the migration service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub store: StoreSection,
    pub bus: BusSection,
    pub backup: BackupSection,
    pub delays: DelaySection,
    pub quota: QuotaSection,
    pub cloud: CloudSection,
    pub logging: LoggingSection,
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Root directory for service state (database, socket, logs).
    pub state_dir: PathBuf,
    /// Machine identifier override; autodetected when `None`.
    pub machine_id: Option<String>,
    /// Seconds allowed for draining in-flight work at shutdown.
    pub shutdown_drain_secs: u64,
}

/// Embedded database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Database file name, resolved under the state directory.
    pub db_file: String,
}

/// Local message bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Endpoint name prefix; the machine identifier is appended.
    pub endpoint_prefix: String,
    /// Seconds a dispatched handler may run before a failure ack.
    pub dispatch_timeout_secs: u64,
    /// Seconds between client heartbeats.
    pub heartbeat_secs: u64,
    /// Initial client reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Maximum client reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
}

/// Backup orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// Categories every user is expected to back up.
    pub categories: Vec<BackupCategory>,
    /// Hours from enqueue to the per-user deadline.
    pub deadline_hours: u64,
    /// Seconds between orchestrator re-evaluation passes.
    pub poll_interval_secs: u64,
}

/// Delay policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySection {
    /// Delay budget per user.
    pub max_delays: u32,
    /// Longest single delay a user may request, in seconds.
    pub max_delay_secs: u64,
}

/// Quota evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    /// Usage percentage that triggers a warning.
    pub warning_pct: f64,
    /// Usage percentage that triggers critical health.
    pub critical_pct: f64,
    /// Safety floor of free space to preserve, in MB.
    pub min_free_mb: u64,
    /// Hours within which same-type warnings collapse.
    pub warning_cooldown_hours: u64,
    /// Hours within which same-kind escalations collapse.
    pub escalation_cooldown_hours: u64,
    /// Days of history examined for repeated warnings.
    pub repeated_warning_horizon_days: u64,
    /// Resolved same-type warnings within the horizon that trigger escalation.
    pub repeated_warning_threshold: u32,
}

/// Cloud readiness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSection {
    /// Seconds a cached status snapshot stays fresh.
    pub status_ttl_secs: u64,
    /// Seconds without upload progress before a sync stalls out.
    pub stall_window_secs: u64,
    /// Seconds between cloud polling passes.
    pub poll_interval_secs: u64,
    /// Unresolved sync errors on one operation before IT escalation.
    pub error_escalation_threshold: u32,
}

/// Activity-log pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Diagnostic level for the tracing subscriber: `trace` .. `error`.
    pub level: String,
    /// Activity log file name, resolved under the state directory.
    pub file: String,
    /// Maximum size of one activity log file (MiB) before rotation.
    pub max_size_mb: u64,
    /// Bounded queue capacity per sink writer.
    pub queue_capacity: usize,
    /// Queue depth that raises the pressure signal (must be < capacity).
    pub high_watermark: usize,
    /// Entries forwarded to the sink per batch.
    pub batch_size: usize,
    /// Milliseconds a writer waits for a batch to fill.
    pub flush_interval_ms: u64,
    /// Overflow policy: `drop_oldest`, `drop_newest`, or `block`.
    pub overflow: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/cutover"),
            machine_id: None,
            shutdown_drain_secs: 30,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_file: "cutover.db".to_string(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            endpoint_prefix: "MigrationService".to_string(),
            dispatch_timeout_secs: 30,
            heartbeat_secs: 30,
            reconnect_initial_ms: 1_000,
            max_reconnect_attempts: 20,
        }
    }
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            categories: BackupCategory::all().to_vec(),
            deadline_hours: 7 * 24,
            poll_interval_secs: 60,
        }
    }
}

impl Default for DelaySection {
    fn default() -> Self {
        Self {
            max_delays: 3,
            max_delay_secs: 24 * 60 * 60,
        }
    }
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            warning_pct: 80.0,
            critical_pct: 95.0,
            min_free_mb: 500,
            warning_cooldown_hours: 24,
            escalation_cooldown_hours: 72,
            repeated_warning_horizon_days: 14,
            repeated_warning_threshold: 3,
        }
    }
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            status_ttl_secs: 5 * 60,
            stall_window_secs: 5 * 60,
            poll_interval_secs: 60,
            error_escalation_threshold: 3,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "activity.log".to_string(),
            max_size_mb: 50,
            queue_capacity: 4_096,
            high_watermark: 3_072,
            batch_size: 64,
            flush_interval_ms: 1_000,
            overflow: "drop_oldest".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and derived values
// ---------------------------------------------------------------------------

impl ServiceConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServiceConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Default path of the configuration file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/cutover/config.yaml")
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.service.state_dir.join(&self.store.db_file)
    }

    /// Full path of the activity log file.
    pub fn activity_log_path(&self) -> PathBuf {
        self.service.state_dir.join(&self.logging.file)
    }

    /// Full path of the listening socket for this machine.
    pub fn socket_path(&self, machine: &str) -> PathBuf {
        self.service
            .state_dir
            .join(format!("{}_{}.sock", self.bus.endpoint_prefix, machine))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.bus.dispatch_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.bus.heartbeat_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_drain_secs)
    }

    pub fn status_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cloud.status_ttl_secs as i64)
    }

    pub fn stall_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cloud.stall_window_secs as i64)
    }

    pub fn deadline_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.backup.deadline_hours as i64)
    }

    pub fn max_single_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delays.max_delay_secs as i64)
    }

    pub fn warning_cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.quota.warning_cooldown_hours as i64)
    }

    pub fn escalation_cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.quota.escalation_cooldown_hours as i64)
    }

    pub fn repeated_warning_horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.quota.repeated_warning_horizon_days as i64)
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.backup.categories.is_empty() {
            issues.push(ConfigIssue::new(
                "backup.categories",
                "at least one backup category is required",
            ));
        }
        if self.delays.max_delay_secs == 0 {
            issues.push(ConfigIssue::new(
                "delays.max_delay_secs",
                "maximum delay must be positive",
            ));
        }
        if !(0.0..=100.0).contains(&self.quota.warning_pct) {
            issues.push(ConfigIssue::new(
                "quota.warning_pct",
                "must be between 0 and 100",
            ));
        }
        if !(0.0..=100.0).contains(&self.quota.critical_pct) {
            issues.push(ConfigIssue::new(
                "quota.critical_pct",
                "must be between 0 and 100",
            ));
        }
        if self.quota.critical_pct < self.quota.warning_pct {
            issues.push(ConfigIssue::new(
                "quota.critical_pct",
                "critical threshold must not be below the warning threshold",
            ));
        }
        if self.logging.high_watermark >= self.logging.queue_capacity {
            issues.push(ConfigIssue::new(
                "logging.high_watermark",
                "high watermark must be below the queue capacity",
            ));
        }
        if self.logging.batch_size == 0 {
            issues.push(ConfigIssue::new(
                "logging.batch_size",
                "batch size must be positive",
            ));
        }
        if !matches!(
            self.logging.overflow.as_str(),
            "drop_oldest" | "drop_newest" | "block"
        ) {
            issues.push(ConfigIssue::new(
                "logging.overflow",
                "must be one of drop_oldest, drop_newest, block",
            ));
        }
        if self.bus.dispatch_timeout_secs == 0 {
            issues.push(ConfigIssue::new(
                "bus.dispatch_timeout_secs",
                "dispatch timeout must be positive",
            ));
        }

        issues
    }
}

/// A single validation problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub problem: String,
}

impl ConfigIssue {
    fn new(field: &str, problem: &str) -> Self {
        Self {
            field: field.to_string(),
            problem: problem.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}
