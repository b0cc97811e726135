//! Reconnecting client - the agent-side counterpart of the hub
//!
//! Sends while disconnected land in a FIFO queue; a background task
//! reconnects with exponential backoff plus jitter and drains the queue in
//! order before any new message goes out. A heartbeat is emitted on a fixed
//! interval; three consecutive heartbeat failures force a reconnect.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cutover_proto::codec::{read_frame, write_frame};
use cutover_proto::message::{Envelope, Heartbeat};

/// Heartbeat send failures tolerated before forcing a reconnect
const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

/// Client tuning knobs
#[derive(Debug, Clone)]
pub struct ReconClientConfig {
    /// Socket path of the service
    pub socket_path: PathBuf,
    /// Identifier placed in heartbeats (the agent's user id)
    pub sender_id: String,
    /// First reconnect delay; doubles per failed attempt
    pub initial_reconnect_delay: Duration,
    /// Backoff ceiling
    pub max_reconnect_delay: Duration,
    /// Consecutive failed connect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
}

impl ReconClientConfig {
    /// Defaults matching the service's policy constants
    pub fn new(socket_path: PathBuf, sender_id: impl Into<String>) -> Self {
        Self {
            socket_path,
            sender_id: sender_id.into(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(300),
            max_reconnect_attempts: 20,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

struct Inner {
    config: ReconClientConfig,
    /// Messages waiting for a live connection, FIFO
    pending: tokio::sync::Mutex<VecDeque<Envelope>>,
    /// Write half of the live connection, if connected
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    heartbeat_seq: AtomicU64,
    incoming_tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
}

/// Agent-side bus client with queuing, reconnect and heartbeats
pub struct ReconClient {
    inner: Arc<Inner>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconClient {
    /// Start the client
    ///
    /// Returns the handle and the stream of messages received from the
    /// service (status updates, backup requests, acknowledgments).
    pub fn start(config: ReconClientConfig) -> (Self, mpsc::Receiver<Envelope>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let inner = Arc::new(Inner {
            config,
            pending: tokio::sync::Mutex::new(VecDeque::new()),
            writer: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            heartbeat_seq: AtomicU64::new(0),
            incoming_tx,
            shutdown: CancellationToken::new(),
        });

        let task = tokio::spawn(run_client(inner.clone()));

        (Self { inner, task }, incoming_rx)
    }

    /// Whether a connection is currently live
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Messages currently queued for delivery
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Send a message, queuing it if the service is unreachable
    ///
    /// Queued messages are delivered in order before any later send once
    /// the connection is re-established.
    pub async fn send(&self, envelope: Envelope) {
        let mut writer = self.inner.writer.lock().await;
        // Anything queued must go first; don't jump the line.
        let queue_empty = self.inner.pending.lock().await.is_empty();
        if let (Some(w), true) = (writer.as_mut(), queue_empty) {
            match write_frame(w, &envelope).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(error = %e, "Send failed; queuing message");
                    *writer = None;
                    self.inner.connected.store(false, Ordering::Release);
                }
            }
        }
        drop(writer);
        self.inner.pending.lock().await.push_back(envelope);
    }

    /// Stop the client and its background task
    pub async fn shutdown(self) {
        self.inner.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn run_client(inner: Arc<Inner>) {
    let mut attempts: u32 = 0;
    let mut delay = inner.config.initial_reconnect_delay;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        match UnixStream::connect(&inner.config.socket_path).await {
            Ok(stream) => {
                attempts = 0;
                delay = inner.config.initial_reconnect_delay;
                info!(path = %inner.config.socket_path.display(), "Connected to service");

                let (read_half, write_half) = stream.into_split();
                if !install_and_drain(&inner, write_half).await {
                    // Draining failed; reconnect with fresh backoff.
                    continue;
                }
                inner.connected.store(true, Ordering::Release);

                run_session(&inner, read_half).await;

                inner.connected.store(false, Ordering::Release);
                *inner.writer.lock().await = None;
                if inner.shutdown.is_cancelled() {
                    break;
                }
                debug!("Session ended; reconnecting");
            }
            Err(e) => {
                attempts += 1;
                if attempts >= inner.config.max_reconnect_attempts {
                    warn!(
                        attempts,
                        error = %e,
                        "Reconnect attempts exhausted; giving up"
                    );
                    break;
                }

                let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                let wait =
                    (delay + Duration::from_millis(jitter_ms)).min(inner.config.max_reconnect_delay);
                debug!(
                    attempt = attempts,
                    wait_ms = wait.as_millis() as u64,
                    "Connect failed; backing off"
                );

                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                delay = (delay * 2).min(inner.config.max_reconnect_delay);
            }
        }
    }
}

/// Install the write half and deliver every queued message in order
///
/// Holds the writer lock for the whole drain so no concurrent `send` can
/// slip a newer message ahead of the queue.
async fn install_and_drain(inner: &Arc<Inner>, write_half: OwnedWriteHalf) -> bool {
    let mut writer = inner.writer.lock().await;
    *writer = Some(write_half);

    let mut pending = inner.pending.lock().await;
    while let Some(envelope) = pending.front() {
        let w = writer.as_mut().expect("writer installed above");
        match write_frame(w, envelope).await {
            Ok(()) => {
                pending.pop_front();
            }
            Err(e) => {
                warn!(error = %e, "Drain failed; will reconnect");
                *writer = None;
                return false;
            }
        }
    }
    true
}

/// Read frames and emit heartbeats until the connection dies
async fn run_session(inner: &Arc<Inner>, mut reader: OwnedReadHalf) {
    let mut heartbeat_timer = tokio::time::interval(inner.config.heartbeat_interval);
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so heartbeats start one
    // interval after connect.
    heartbeat_timer.tick().await;

    let mut heartbeat_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,

            frame = read_frame(&mut reader) => match frame {
                Ok(Some(envelope)) => {
                    if inner.incoming_tx.send(envelope).await.is_err() {
                        // Receiver dropped; nobody is listening anymore.
                        return;
                    }
                }
                Ok(None) => {
                    debug!("Service closed the connection");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Read failed");
                    return;
                }
            },

            _ = heartbeat_timer.tick() => {
                let heartbeat = Heartbeat {
                    sender_id: inner.config.sender_id.clone(),
                    sequence_number: inner.heartbeat_seq.fetch_add(1, Ordering::Relaxed),
                    timestamp: Utc::now(),
                };
                let envelope = match Envelope::new(&heartbeat, Utc::now()) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(error = %e, "Heartbeat did not serialize");
                        continue;
                    }
                };

                let sent = {
                    let mut writer = inner.writer.lock().await;
                    match writer.as_mut() {
                        Some(w) => write_frame(w, &envelope).await.is_ok(),
                        None => false,
                    }
                };

                if sent {
                    heartbeat_failures = 0;
                } else {
                    heartbeat_failures += 1;
                    warn!(failures = heartbeat_failures, "Heartbeat send failed");
                    if heartbeat_failures >= HEARTBEAT_FAILURE_LIMIT {
                        info!("Heartbeat failures exceeded limit; forcing reconnect");
                        return;
                    }
                }
            }
        }
    }
}
