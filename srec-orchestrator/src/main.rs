use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use srec_orchestrator::api::{ApiServer, AppState};
use srec_orchestrator::config::OrchestratorConfig;
use srec_orchestrator::domain::LivenessSignal;
use srec_orchestrator::logging::init_logging;
use srec_orchestrator::orphan::OrphanRecoveryService;
use srec_orchestrator::process::ProcessSupervisor;
use srec_orchestrator::proxy::{HttpProxyProber, ProxyHealthRegistry};
use srec_orchestrator::recording::RecordingLifecycleManager;
use srec_orchestrator::remux::{FfprobeProber, RemuxPipeline};
use srec_orchestrator::utils::http_client::install_rustls_provider;

/// Extra time granted to remux work on shutdown, on top of the capture stop
/// window.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = OrchestratorConfig::load().context("loading configuration")?;
    let (logging, _log_guard) =
        init_logging(&config.log_dir, config.log_json).context("initializing logging")?;
    if let Some(filter) = &config.log_filter
        && let Err(e) = logging.set_filter(filter)
    {
        warn!(error = %e, "Ignoring configured log filter");
    }
    install_rustls_provider();

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let prober = Arc::new(HttpProxyProber::new(
        config.proxy.probe_url.clone(),
        Duration::from_secs(config.proxy.probe_timeout_secs),
    ));
    let registry = Arc::new(ProxyHealthRegistry::new(&config.proxy, prober));
    if !config.proxy.proxies.is_empty() {
        let snapshot = registry.run_health_check_cycle().await;
        let usable = snapshot.iter().filter(|p| p.health.is_usable()).count();
        info!(total = snapshot.len(), usable, "Initial proxy health check complete");
    }
    let health_loop = registry.spawn_health_loop(
        Duration::from_secs(config.proxy.health_check_interval_secs),
        shutdown.child_token(),
    );

    let supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone()));
    let remux = Arc::new(RemuxPipeline::new(
        config.remux.clone(),
        config.tools.ffmpeg.clone(),
        supervisor.clone(),
        Arc::new(FfprobeProber::new(config.tools.ffprobe.clone())),
    ));

    let manager = RecordingLifecycleManager::new(
        config.recording_config(),
        registry.clone(),
        supervisor.clone(),
        remux.clone(),
    );
    for source in &config.sources {
        manager.upsert_source(source.clone());
    }

    let orphans = Arc::new(OrphanRecoveryService::new(
        config.orphan.clone(),
        config.output_dir.clone(),
        config.capture.raw_extension.clone(),
        config.capture.final_extension.clone(),
        config.log_dir.clone(),
        remux,
        Arc::new(manager.clone()),
    ));
    let sweep_loop = orphans.spawn_sweep_loop(shutdown.child_token());

    if config.api.enabled {
        let server = ApiServer::new(config.api.clone(), AppState::new(Arc::new(manager.clone())))
            .with_parent_token(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    tokio::spawn(read_signals(manager.clone(), shutdown.child_token()));

    info!(
        sources = config.sources.len(),
        proxies = config.proxy.proxies.len(),
        output_dir = %config.output_dir.display(),
        "srec-orchestrator started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for the shutdown signal")?;
    info!("Shutdown requested");

    let window = Duration::from_secs(config.supervisor.graceful_stop_secs) + SHUTDOWN_GRACE;
    manager.shutdown(window).await;
    shutdown.cancel();

    let _ = health_loop.await;
    if let Some(sweep_loop) = sweep_loop {
        let _ = sweep_loop.await;
    }
    info!("srec-orchestrator stopped");
    Ok(())
}

/// Liveness signals from stdin, one per line: `online <id>`, `offline <id>`,
/// `stop <id>` or `status`.
async fn read_signals(manager: RecordingLifecycleManager, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read from stdin");
                return;
            }
        };

        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("online"), Some(id)) => {
                match manager.on_liveness(id, LivenessSignal::Online).await {
                    Ok(Some(session_id)) => {
                        info!(source_id = id, session_id = %session_id, "Recording started")
                    }
                    Ok(None) => info!(source_id = id, "Already recording"),
                    Err(e) => error!(
                        source_id = id,
                        reason = %e.failure_reason(),
                        error = %e,
                        "Start failed"
                    ),
                }
            }
            (Some("offline"), Some(id)) => {
                let _ = manager.on_liveness(id, LivenessSignal::Offline).await;
            }
            (Some("stop"), Some(id)) => {
                let outcome = manager.stop_recording(id);
                info!(source_id = id, outcome = ?outcome, "Stop handled");
            }
            (Some("status"), None) => {
                let status = manager.status();
                info!(
                    active = status.active_count,
                    safe_to_update = status.safe_to_update,
                    "{}",
                    status.message
                );
            }
            (None, _) => {}
            _ => warn!(line = %line, "Unrecognized command"),
        }
    }
}
