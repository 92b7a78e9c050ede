//! # Telemetry Relay Server
//!
//! Serves live sim-racing telemetry to dashboards and tools.
//!
//! - **Upstream**: a JSON-lines feed on the ingest port, or a recorded session
//!   replayed from disk, advanced by a fixed-rate tick scheduler.
//! - **Downstream**: HTTP pull (`POST /api/snapshot`), on-demand WebSocket
//!   (`/ws`) and continuous WebSocket (`/stream`). Every client gets only the
//!   values that changed since its previous read.
//! - **Workers**: per-tick callbacks (source watch, optional recorder) fed
//!   through bounded mailboxes so a slow worker never holds up the scheduler.
//! - **Shutdown**: `tokio-graceful` waits up to ten seconds for every task.

use std::time::Duration;

use anyhow::Result;
use tokio_graceful::Shutdown;
use tracing::{error, info, warn};

use lib_relay::loggers::{prune_old_logs, setup_logging};

mod relay_logic;
use relay_logic::{config, downstream, monitor, plugins, state, upstream};

const APP_NAME: &str = "server_relay";
const KEEP_LOG_FILES: usize = 14;
const WORKER_JOIN_LIMIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = config::load_config();
    let log_dir = config.log_dir();
    let _log_guard = setup_logging(&log_dir, APP_NAME, config.log_level())?;
    match prune_old_logs(&log_dir, APP_NAME, KEEP_LOG_FILES) {
        Ok(0) => {}
        Ok(removed) => info!("Removed {} old log file(s)", removed),
        Err(e) => error!("Failed to prune old logs: {}", e),
    }

    let app_state = state::AppState::new(
        lib_relay::SharedSource::new(),
        config.session_idle(),
        config.stream_cadence(),
    )
    .with_min_stream_cadence(config.tick_interval());
    let publisher = upstream::install_source(&config, &app_state)?;
    plugins::register_plugins(&config, &app_state.dispatcher)?;

    // Stop on SIGINT/SIGTERM, or when a component gives up and cancels.
    let failed = app_state.cancel.clone();
    let shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = tokio_graceful::default_signal() => {}
            _ = failed.cancelled() => {}
        }
    });

    // Bridge the shutdown signal onto the token every component listens to.
    let cancel = app_state.cancel.clone();
    shutdown.spawn_task_fn(move |guard| async move {
        guard.cancelled().await;
        info!("Shutdown signal received, stopping components.");
        cancel.cancel();
    });

    let (cfg, st) = (config.clone(), app_state.clone());
    shutdown.spawn_task_fn(move |_guard| upstream::run_scheduler(cfg, st));

    if let Some(publisher) = publisher {
        let (cfg, cancel) = (config.clone(), app_state.cancel.clone());
        shutdown.spawn_task_fn(move |_guard| async move {
            if let Err(e) = upstream::run_ingest(cfg, publisher, cancel.clone()).await {
                error!("Ingest feed stopped: {:#}", e);
                cancel.cancel();
            }
        });
    }

    let (st, sweep) = (app_state.clone(), config.sweep_interval());
    shutdown.spawn_task_fn(move |_guard| monitor::run(st, sweep));

    let (cfg, st) = (config.clone(), app_state.clone());
    shutdown.spawn_task_fn(move |_guard| async move {
        let cancel = st.cancel.clone();
        if let Err(e) = downstream::run(cfg, st).await {
            error!("Downstream server stopped: {:#}", e);
            cancel.cancel();
        }
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    if !app_state.stop_and_join(WORKER_JOIN_LIMIT).await {
        warn!("Some workers did not stop in time; their last output may be lost");
    }
    info!("Bye!");
    Ok(())
}
