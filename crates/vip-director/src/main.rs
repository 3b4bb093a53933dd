use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vip_director::config::{ColocationMode, DirectorConfig};
use vip_director::director::{Director, DirectorSettings};
use vip_director::health::{run_health_server, HealthState};
use vip_director::metrics::{self, MetricsRecorder};
use vip_director::system::{LinuxIp, LinuxIptables, LinuxIpvs};
use vip_director::watcher::{self, ClusterWatcher};

#[derive(Parser)]
#[command(name = "vip-director")]
#[command(about = "Node-local IPVS director for cluster VIPs", long_about = None)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local node name; overrides the config file and NODE_NAME.
    #[arg(long)]
    node_name: Option<String>,

    /// Interface VIPs are bound to; overrides the config file.
    #[arg(long)]
    interface: Option<String>,

    /// Colocation mode: disabled, iptables, or ipvs.
    #[arg(long)]
    colocation_mode: Option<ColocationMode>,

    /// Tear kernel state down on shutdown.
    #[arg(long)]
    cleanup_on_stop: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vip_director=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DirectorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let mut config = DirectorConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }
    if let Some(interface) = cli.interface {
        config.interface = interface;
    }
    if let Some(mode) = cli.colocation_mode {
        config.colocation_mode = mode;
    }
    if cli.cleanup_on_stop {
        config.cleanup_on_stop = true;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        node = %config.node_name,
        interface = %config.interface,
        colocation = %config.colocation_mode,
        "vip-director starting"
    );

    if let Some(addr) = config.metrics.listen_address {
        metrics::install_exporter(addr).context("Failed to install Prometheus exporter")?;
    }

    let parent = CancellationToken::new();
    let cluster = Arc::new(ClusterWatcher::new());

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    tokio::spawn(watcher::run_sync(
        kube_client,
        cluster.clone(),
        config.sync_settings(),
        parent.child_token(),
    ));

    let director = Director::new(
        DirectorSettings::from(&config),
        parent.clone(),
        cluster.clone(),
        Arc::new(LinuxIp::new(&config.interface)),
        Arc::new(LinuxIpvs::new()),
        Arc::new(LinuxIptables::new()),
        Arc::new(MetricsRecorder::new(config.config_key.clone())),
    );

    director.start().await.context("Failed to start director")?;

    let health_state = Arc::new(HealthState::new(cluster.clone()));
    health_state.mark_started();
    if config.health.port != 0 {
        let state = health_state.clone();
        let port = config.health.port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state, port).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
    }

    let stop_result = director.stop().await;
    parent.cancel();
    stop_result.context("Shutdown cleanup failed")?;

    info!("Shutdown complete");
    Ok(())
}
