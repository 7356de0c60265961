mod config;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use socialmesh_discovery::{
    Coordinator, DiscoveryConfig, EtcdCoordinator, GrpcTransport, MemoryCoordinator, ServiceNode,
};

use crate::config::{Config, Overrides};

#[derive(Parser, Debug)]
#[command(name = "socialmesh")]
#[command(about = "SocialMesh service discovery node", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, env = "SOCIALMESH_CONFIG_PATH")]
    config: Option<String>,

    /// Service to route to, relative to the directory prefix (repeatable)
    #[arg(long = "follow")]
    follow: Vec<String>,

    /// Service this instance serves
    #[arg(long)]
    service: Option<String>,

    /// Instance name (generated from hostname if not provided)
    #[arg(long)]
    instance: Option<String>,

    /// Address announced for this instance
    #[arg(long)]
    address: Option<String>,

    /// Use an in-process directory instead of etcd
    #[arg(long)]
    local: bool,

    /// Seconds between routing summaries, 0 disables them
    #[arg(long, default_value = "30")]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_overrides(Overrides {
        follow: args.follow,
        service: args.service,
        instance: args.instance,
        address: args.address,
    });

    logging::init_logging(&config.logging)?;

    let problems = config.discovery.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Config validation error: {problem}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            problems.len()
        );
    }

    info!("SocialMesh node starting...");
    let report_interval = Duration::from_secs(args.report_interval_secs);

    if args.local {
        info!("Using in-process directory");
        run(config.discovery, Arc::new(MemoryCoordinator::new()), report_interval).await
    } else {
        info!(endpoints = ?config.discovery.endpoints, "Connecting to etcd");
        let coordinator = EtcdCoordinator::connect(
            &config.discovery.endpoints,
            &config.discovery.etcd_connect_options(),
        )
        .await
        .context("Failed to connect to etcd")?;
        run(config.discovery, Arc::new(coordinator), report_interval).await
    }
}

async fn run<C: Coordinator>(
    config: DiscoveryConfig,
    coordinator: Arc<C>,
    report_interval: Duration,
) -> Result<()> {
    let node = ServiceNode::start(config, coordinator, GrpcTransport)
        .await
        .context("Failed to start service node")?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    if report_interval.is_zero() {
        shutdown.await;
    } else {
        let mut ticker = tokio::time::interval(report_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => report_routing(&node),
            }
        }
    }

    info!("Shutting down...");
    node.shutdown().await;
    info!("SocialMesh node stopped");
    Ok(())
}

fn report_routing<C: Coordinator>(node: &ServiceNode<C, GrpcTransport>) {
    for service in node.routing().services() {
        let backends = node.routing().pool(&service).map_or(0, |pool| pool.len());
        info!(service = %service, backends, "Routing summary");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
