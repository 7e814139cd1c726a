//! Tidestore Ingest
//!
//! Main entry point of the durable write path: consumes datapoint messages
//! from the log, writes them to the store and commits log offsets once the
//! writes are durable.
//!
//! ## Configuration
//! A TOML file given with `--config` (see `tidestore_storage::IngestConfig`),
//! overridden by `TIDESTORE_*` environment variables. The metrics endpoint
//! binds to `--metrics-addr` / `TIDESTORE_METRICS_ADDR` (default: 0.0.0.0:9100).
//!
//! ## Collaborators
//! The binary wires the pipeline to the in-memory log and store and drives
//! it with synthetic traffic (`--tick-ms`, `--points-per-message`), which
//! makes it a self-contained soak test of the ingest path. Configured keys
//! apply to the synthetic traffic as well.
//!
//! ## Logging
//! Logging is controlled via the `RUST_LOG` environment variable:
//! ```bash
//! RUST_LOG=debug tidestore-ingest --config ingest.toml
//! RUST_LOG=tidestore_storage=debug,info tidestore-ingest
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tidestore_core::CryptoEnvelope;
use tidestore_observability::exporter::create_metrics_router;
use tidestore_server::{settings, TrafficConfig, TrafficGenerator};
use tidestore_storage::memory::{InMemoryLog, InMemoryStore};
use tidestore_storage::{CommitCoordinator, IngestContext};

#[derive(Parser)]
#[command(name = "tidestore-ingest")]
#[command(about = "Tidestore durable write path", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TIDESTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the Prometheus metrics endpoint
    #[arg(long, env = "TIDESTORE_METRICS_ADDR", default_value = "0.0.0.0:9100")]
    metrics_addr: SocketAddr,

    /// Interval between synthetic traffic ticks
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Datapoints per synthetic store message
    #[arg(long, default_value_t = 16)]
    points_per_message: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = settings::load(cli.config.as_deref())?;
    tidestore_observability::init_metrics();

    // Collaborators
    let log = InMemoryLog::new();
    log.create_topic(&config.log.topic, config.log.partitions);
    let store = InMemoryStore::new();

    let keys = config.keys.provider()?;
    let envelope = Arc::new(CryptoEnvelope::from_keys(&keys)?);
    let traffic = TrafficGenerator::new(
        log.clone(),
        envelope,
        TrafficConfig {
            topic: config.log.topic.clone(),
            partitions: config.log.partitions,
            tick: Duration::from_millis(cli.tick_ms.max(1)),
            points_per_message: cli.points_per_message,
            ..TrafficConfig::default()
        },
    );

    let group_id = config.log.group_id.clone();
    let table = config.store.table.clone();
    let ctx = IngestContext::build(config, Arc::new(log.client(&group_id)), store.connector())
        .await
        .context("Failed to initialize ingest pipeline")?;
    let coordinator = CommitCoordinator::spawn(ctx);

    let (traffic_tx, traffic_rx) = tokio::sync::oneshot::channel::<()>();
    let traffic_handle = traffic.start(traffic_rx);

    // Metrics endpoint
    let listener = tokio::net::TcpListener::bind(cli.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint {}", cli.metrics_addr))?;
    tracing::info!(addr = %cli.metrics_addr, "Metrics endpoint listening");
    let (metrics_tx, metrics_rx) = tokio::sync::oneshot::channel::<()>();
    let metrics_handle = tokio::spawn(async move {
        let served = axum::serve(listener, create_metrics_router())
            .with_graceful_shutdown(async {
                metrics_rx.await.ok();
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "Metrics endpoint failed");
        }
    });

    shutdown_signal().await;

    tracing::info!("Stopping traffic generator");
    let _ = traffic_tx.send(());
    match traffic_handle.await {
        Ok(stats) => tracing::info!(
            store_messages = stats.store_messages,
            delete_messages = stats.delete_messages,
            datapoints = stats.datapoints,
            "Traffic generator stopped"
        ),
        Err(e) => tracing::error!(error = %e, "Traffic generator task failed"),
    }

    tracing::info!("Draining ingest pipeline");
    coordinator.shutdown().await;

    let _ = metrics_tx.send(());
    let _ = metrics_handle.await;

    tracing::info!(
        cells = store.cell_count(&table),
        "Tidestore ingest shut down gracefully"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
