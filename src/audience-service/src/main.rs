//! Audience service: segment membership API with a background expiry
//! worker.
//!
//! Main entry point that wires the stores, services and worker and serves
//! HTTP until a shutdown signal arrives.

mod shutdown;

use audience_api::{ApiServer, AppState};
use audience_core::config::AppConfig;
use audience_core::Stores;
use audience_segmentation::{ExpiryWorker, MembershipService, SegmentService};
use audience_store::{MemoryStore, SystemClock};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "audience-service")]
#[command(about = "User segment membership service with timed memberships")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "AUDIENCE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "AUDIENCE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Seconds between expiry worker cycles (overrides config)
    #[arg(long, env = "AUDIENCE__WORKER__POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Serve the API without running the expiry worker
    #[arg(long, default_value_t = false)]
    no_worker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "audience_service=info,audience_segmentation=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Audience service starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.poll_interval_secs {
        config.worker.poll_interval_secs = secs;
    }
    if cli.no_worker {
        config.worker.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        worker_enabled = config.worker.enabled,
        poll_interval_secs = config.worker.poll_interval().as_secs(),
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        users: store.clone(),
        segments: store.clone(),
        audit: store.clone(),
        tasks: store,
        clock: Arc::new(SystemClock),
    };

    let membership = MembershipService::new(&stores, config.limits.clone());
    let segments = SegmentService::new(&stores, membership.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let mut state = AppState::new(
        membership.clone(),
        segments,
        config.node_id.clone(),
        shutdown_rx.clone(),
    );

    let worker_handle = if config.worker.enabled {
        let worker = ExpiryWorker::new(&stores, &config.worker, &membership);
        state = state.with_worker(worker.subscribe());
        Some(worker.start(shutdown_rx))
    } else {
        info!("Expiry worker disabled");
        None
    };

    let api_server = ApiServer::new(config.clone(), state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Audience service is ready to serve traffic");

    let signal_tx = shutdown_tx.clone();
    let served = api_server
        .start_http(async move {
            shutdown::shutdown_signal().await;
            signal_tx.send_replace(true);
        })
        .await;

    // The server may also have stopped on its own error.
    shutdown_tx.send_replace(true);

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Expiry worker task failed");
        }
    }

    info!("Audience service stopped");
    served
}
