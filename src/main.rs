use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use wakegate::config::ActivatorConfig;
use wakegate::discovery::file::FileSource;
use wakegate::discovery::store::RevisionStore;
use wakegate::discovery::watcher::EndpointWatcher;
use wakegate::handler::HealthState;
use wakegate::observability::ActivatorMetrics;
use wakegate::proxy::Transport;
use wakegate::reporter::{self, ConcurrencyReporter};
use wakegate::server::{self, AdminHandler};
use wakegate::sink::DurableSink;
use wakegate::Throttler;

/// wakegate: request-path activator for serverless revisions
#[derive(Parser)]
#[command(name = "wakegate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wakegate.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("wakegate v{}", env!("CARGO_PKG_VERSION"));

    // Identity of this replica: the name goes on every stat message,
    // the IP decides which slice of each revision's capacity is ours.
    let pod_name = std::env::var("POD_NAME").context("POD_NAME must be set")?;
    let pod_ip = std::env::var("POD_IP").context("POD_IP must be set")?;

    let config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        ActivatorConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        ActivatorConfig::default()
    };

    let topology = config
        .topology_file
        .clone()
        .context("No topology source configured: set topology_file")?;

    // One transport for the whole process, shared by every path that
    // dials pods, so warmed keep-alive connections get reused.
    let transport = Arc::new(Transport::new(&config)?);

    tracing::info!(url = config.autoscaler_url(), "Connecting stat sink");
    let sink = DurableSink::new(config.autoscaler_url(), config.stat_buffer);

    let (stat_tx, stat_rx) = mpsc::channel(config.stat_buffer);
    let reporter = ConcurrencyReporter::new(pod_name.clone(), config.reporting_period(), stat_tx);
    let reporter_task = tokio::spawn(reporter.clone().run());
    let pump_task = tokio::spawn(reporter::report_stats(sink.clone(), stat_rx));

    let store = Arc::new(RevisionStore::new());
    let throttler = Arc::new(Throttler::from_config(&config, pod_ip.clone()));
    let (update_tx, update_rx) = mpsc::channel(64);
    let throttler_task = tokio::spawn(throttler.clone().run(update_rx));

    let (event_tx, event_rx) = mpsc::channel(64);
    let watcher_task = tokio::spawn(EndpointWatcher::new(store.clone(), update_tx).run(event_rx));
    let source_task = tokio::spawn(wakegate::discovery::run_source(
        FileSource::new(&topology),
        event_tx,
    ));

    let metrics = Arc::new(ActivatorMetrics::new());
    let health = HealthState::new(sink.clone());
    let chain = wakegate::build_chain(
        store,
        throttler.clone(),
        transport,
        reporter,
        metrics.clone(),
        health.clone(),
        &config,
    );
    let admin = AdminHandler::new(metrics, health.clone());

    let servers = server::start(&config, chain, admin).await?;
    tracing::info!(pod = pod_name, ip = pod_ip, "Activator running");

    wait_for_drain_signal().await;

    // Fail readiness first and let the load balancer notice before any
    // socket closes; traffic keeps flowing during the propagation gap.
    health.start_draining();
    tracing::info!(
        secs = config.cluster_drain_timeout_secs,
        "Sleeping to allow propagation of the non-ready state"
    );
    tokio::time::sleep(config.drain_timeout()).await;

    tracing::info!("Done waiting, shutting down servers");
    throttler.drain_all();
    servers.shutdown().await;
    sink.shutdown(Duration::from_secs(5)).await;

    for task in [
        reporter_task,
        pump_task,
        throttler_task,
        watcher_task,
        source_task,
    ] {
        task.abort();
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_drain_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("Received interrupt"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
