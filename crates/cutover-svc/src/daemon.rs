//! Daemon bootstrap and shutdown
//!
//! Startup order: store (open + migrate), activity log pipeline, services,
//! dispatcher with handlers, hub bind, evaluation loop. Shutdown reverses
//! it: stop accepting, notify agents, drain in-flight work against a
//! deadline, flush the pipeline, close the store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cutover_bus::{ConnHub, Dispatcher};
use cutover_cloud::quota::QuotaPolicy;
use cutover_cloud::{CloudStatusService, EscalationEngine, QuotaService};
use cutover_core::config::ServiceConfig;
use cutover_core::ports::SystemClock;
use cutover_logging::{ConsoleSink, FileSink, LogPipeline, OverflowPolicy, WriterConfig};
use cutover_orchestrator::{handlers, Orchestrator, OrchestratorConfig};
use cutover_profile::{BackupPolicy, ProfileService};
use cutover_proto::message::{Envelope, ShutdownRequest};
use cutover_store::{DatabasePool, StateStore};

use crate::adapters::{
    LogEscalationSink, NullActivitySource, NullProfileDetector, OfflineCloudConnector,
};
use crate::setup::{machine_ident, CommandError};

/// Run the service in the foreground until SIGINT/SIGTERM
pub async fn run(config: ServiceConfig) -> Result<(), CommandError> {
    let machine = machine_ident(&config);
    info!(machine = %machine, "Starting cutover service");

    // --- Store ---
    let pool = DatabasePool::open(&config.db_path())
        .await
        .map_err(|e| CommandError::Failed(anyhow::anyhow!(e)))?;
    let store = Arc::new(StateStore::new(pool.pool().clone()));

    // --- Activity log pipeline ---
    let writer_config = WriterConfig {
        queue_capacity: config.logging.queue_capacity,
        high_watermark: config.logging.high_watermark,
        batch_size: config.logging.batch_size,
        flush_interval: Duration::from_millis(config.logging.flush_interval_ms),
        overflow: OverflowPolicy::parse(&config.logging.overflow)
            .unwrap_or(OverflowPolicy::DropOldest),
    };
    let mut pipeline = LogPipeline::new();
    pipeline.attach(
        "file",
        Box::new(FileSink::new(
            config.service.state_dir.clone(),
            "activity",
            config.logging.max_size_mb,
            machine.clone(),
        )),
        writer_config.clone(),
    );
    pipeline.attach("console", Box::new(ConsoleSink), writer_config);
    let pipeline = Arc::new(pipeline);

    let mut pressure_events = pipeline.events();
    tokio::spawn(async move {
        while let Ok(event) = pressure_events.recv().await {
            warn!(?event, "Log pipeline back-pressure");
        }
    });

    // --- Capabilities and services ---
    let clock = Arc::new(SystemClock);
    let cloud_status = Arc::new(CloudStatusService::new(
        Arc::new(OfflineCloudConnector),
        store.clone(),
        clock.clone(),
        config.status_ttl(),
    ));
    let escalations = Arc::new(EscalationEngine::new(
        store.clone(),
        Arc::new(LogEscalationSink),
        clock.clone(),
    ));
    let quota = Arc::new(QuotaService::new(
        cloud_status.clone(),
        store.clone(),
        escalations.clone(),
        clock.clone(),
        QuotaPolicy {
            warning_pct: config.quota.warning_pct,
            critical_pct: config.quota.critical_pct,
            min_free_mb: config.quota.min_free_mb,
            warning_cooldown: config.warning_cooldown(),
            repeated_warning_horizon: config.repeated_warning_horizon(),
            repeated_warning_threshold: config.quota.repeated_warning_threshold,
        },
    ));
    let profiles = Arc::new(ProfileService::new(
        store.clone(),
        Arc::new(NullProfileDetector),
        Arc::new(NullActivitySource),
        clock.clone(),
        BackupPolicy::default(),
    ));

    let orchestrator = Orchestrator::new(
        store,
        cloud_status,
        quota,
        profiles,
        escalations,
        pipeline.clone(),
        clock,
        OrchestratorConfig {
            categories: config.backup.categories.clone(),
            deadline_window: config.deadline_window(),
            max_delays: config.delays.max_delays,
            max_single_delay: config.max_single_delay(),
        },
    );

    // --- Bus ---
    let shutdown = CancellationToken::new();
    let mut dispatcher = Dispatcher::new(config.dispatch_timeout());
    handlers::register_all(&mut dispatcher, orchestrator.clone());
    let hub = ConnHub::new(dispatcher, shutdown.clone());
    orchestrator.attach_hub(hub.clone());

    let socket_path = config.socket_path(&machine);
    let listener = ConnHub::bind(&socket_path)
        .map_err(|e| CommandError::Failed(anyhow::anyhow!("binding {}: {e}", socket_path.display())))?;

    let serve_hub = hub.clone();
    let serve_task = tokio::spawn(async move { serve_hub.serve(listener).await });

    let poll_interval = Duration::from_secs(config.backup.poll_interval_secs);
    let orch_task = tokio::spawn(
        orchestrator
            .clone()
            .run(poll_interval, shutdown.clone()),
    );

    info!(socket = %socket_path.display(), "Service ready");

    // --- Wait for a stop signal ---
    wait_for_signal(&shutdown).await;
    info!("Shutdown requested");

    // Tell every agent we are going away, then stop accepting and close.
    let notice = ShutdownRequest {
        reason: Some("Server shutdown".to_string()),
    };
    match Envelope::new(&notice, chrono::Utc::now()) {
        Ok(envelope) => hub.broadcast(&envelope).await,
        Err(e) => warn!(error = %e, "Shutdown notice did not serialize"),
    }
    shutdown.cancel();

    // Drain in-flight work against the configured deadline.
    let drain = config.shutdown_drain();
    let drained = tokio::time::timeout(drain, async {
        let _ = serve_task.await;
        let _ = orch_task.await;
    })
    .await;
    if drained.is_err() {
        error!(deadline_secs = drain.as_secs(), "Drain deadline exceeded; forcing exit");
    }

    // Flush the activity pipeline last so shutdown itself is recorded.
    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(shared) => shared.flush().await,
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    info!("Service stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: &CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            shutdown.cancelled().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        // A fatal error inside the evaluation loop cancels the token.
        _ = shutdown.cancelled() => {}
    }
}
