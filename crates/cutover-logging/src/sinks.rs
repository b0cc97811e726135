//! Sinks - destinations for activity records
//!
//! A sink receives batches of records from its writer task. Implementations
//! here: a rotating file sink, a console sink for foreground runs, and an
//! in-memory sink for tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::ActivityRecord;

/// A destination for activity records
#[async_trait::async_trait]
pub trait Sink: Send + 'static {
    /// Write a batch of records
    async fn write_batch(&mut self, batch: &[ActivityRecord]) -> anyhow::Result<()>;

    /// Flush any buffered output to durable storage
    async fn flush(&mut self) -> anyhow::Result<()>;
}

// ============================================================================
// FileSink
// ============================================================================

/// File sink with size- and day-based rotation
///
/// A file is rotated when it reaches `max_size_bytes` or when the calendar
/// day (UTC) differs from the day it was opened under. Files are named
/// `{stem}-{YYYYMMDD}.{seq}.log`; `seq` increments within a day to keep
/// names unique and resets when the day changes. Each file opens with a
/// header line carrying the creation timestamp, machine identifier and
/// process id.
pub struct FileSink {
    dir: PathBuf,
    stem: String,
    max_size_bytes: u64,
    machine: String,
    file: Option<File>,
    day_key: String,
    sequence: u32,
    written: u64,
}

impl FileSink {
    /// Create a sink writing under `dir` with the given file stem
    pub fn new(dir: PathBuf, stem: impl Into<String>, max_size_mb: u64, machine: impl Into<String>) -> Self {
        Self {
            dir,
            stem: stem.into(),
            max_size_bytes: max_size_mb.max(1) * 1024 * 1024,
            machine: machine.into(),
            file: None,
            day_key: String::new(),
            sequence: 0,
            written: 0,
        }
    }

    fn day_key_for(now: DateTime<Utc>) -> String {
        format!("{:04}{:02}{:02}", now.year(), now.month(), now.day())
    }

    /// Path of the currently open file, if any
    pub fn current_path(&self) -> Option<PathBuf> {
        if self.day_key.is_empty() {
            None
        } else {
            Some(
                self.dir
                    .join(format!("{}-{}.{}.log", self.stem, self.day_key, self.sequence)),
            )
        }
    }

    async fn rotate_if_needed(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let key = Self::day_key_for(now);
        let needs_rotation = match &self.file {
            None => true,
            Some(_) => self.written >= self.max_size_bytes || key != self.day_key,
        };
        if !needs_rotation {
            return Ok(());
        }

        if let Some(mut old) = self.file.take() {
            old.flush().await?;
            // File closes on drop.
        }

        if key == self.day_key {
            self.sequence += 1;
        } else {
            self.day_key = key;
            self.sequence = 0;
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        // Walk forward past any file left by a previous run of this key.
        let mut path = self.current_path().expect("day key was just assigned");
        while tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.sequence += 1;
            path = self.current_path().expect("day key assigned");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let header = serde_json::json!({
            "created_at": now.to_rfc3339(),
            "machine": self.machine,
            "pid": std::process::id(),
        });
        let header_line = format!("{header}\n");
        file.write_all(header_line.as_bytes()).await?;

        self.written = header_line.len() as u64;
        self.file = Some(file);
        tracing::debug!(path = %path.display(), "Opened activity log file");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    async fn write_batch(&mut self, batch: &[ActivityRecord]) -> anyhow::Result<()> {
        for record in batch {
            self.rotate_if_needed(Utc::now()).await?;
            let line = format!("{}\n", record.to_json_line());
            let file = self.file.as_mut().expect("rotate_if_needed opened a file");
            file.write_all(line.as_bytes()).await?;
            self.written += line.len() as u64;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

// ============================================================================
// ConsoleSink
// ============================================================================

/// Console sink for foreground runs
pub struct ConsoleSink;

#[async_trait::async_trait]
impl Sink for ConsoleSink {
    async fn write_batch(&mut self, batch: &[ActivityRecord]) -> anyhow::Result<()> {
        let mut stdout = tokio::io::stdout();
        for record in batch {
            let line = format!("{}\n", record.to_json_line());
            stdout.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        tokio::io::stdout().flush().await?;
        Ok(())
    }
}

// ============================================================================
// MemorySink (tests)
// ============================================================================

/// In-memory sink that records everything it receives
///
/// Cloning shares the underlying storage, so tests keep a handle while the
/// pipeline owns the boxed sink. `fail_next_writes` makes the next N batch
/// writes fail, for exercising the pipeline's error swallowing.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ActivityRecord>>>,
    flushes: Arc<Mutex<u32>>,
    failures_remaining: Arc<AtomicU32>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn records(&self) -> Vec<ActivityRecord> {
        self.records.lock().unwrap().clone()
    }

    /// How many times `flush` was called
    pub fn flush_count(&self) -> u32 {
        *self.flushes.lock().unwrap()
    }

    /// Make the next `n` batch writes fail
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Sink for MemorySink {
    async fn write_batch(&mut self, batch: &[ActivityRecord]) -> anyhow::Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected sink failure");
        }
        self.records.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}
