//! podssh gateway daemon
//!
//! Listens for SSH connections and runs each session as a remote process
//! inside the pod named by the login.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use podssh_core::config::{self, GatewayConfig};
use podssh_gateway::bridge::build_transport;
use podssh_gateway::directory::KubeDirectory;
use podssh_gateway::ratelimit::run_sweeper;
use podssh_gateway::server::{load_or_generate_host_key, SshServer};
use podssh_gateway::GatewayState;

#[derive(Parser)]
#[command(name = "podssh-gateway")]
#[command(about = "SSH gateway into Kubernetes pods")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("podssh gateway starting...");

    let config = load_gateway_config(args.config.as_deref())?;
    config.validate().context("Invalid configuration")?;
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    let fingerprint = host_key
        .clone_public_key()
        .context("Host key has no public half")?
        .fingerprint();
    tracing::info!(%fingerprint, "Host key ready");

    // In-cluster credentials first, then the local kubeconfig
    let cluster = kube::Config::infer()
        .await
        .context("Failed to infer cluster configuration")?;
    let client = kube::Client::try_from(cluster.clone())
        .context("Failed to build cluster client")?;
    tracing::info!(cluster_url = %cluster.cluster_url, "Cluster client ready");

    let transport = build_transport(&config.transport, &cluster)
        .context("Failed to set up exec transport")?;
    tracing::info!(
        transport = %config.transport.preferred,
        fallback = config.transport.fallback,
        "Exec transport ready"
    );

    let sweep_interval = config.rate_limit.sweep_interval;
    let state = Arc::new(GatewayState::new(
        config,
        Arc::new(KubeDirectory::new(client)),
        transport,
    ));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&state.limiter),
        sweep_interval,
        cancel.clone(),
    ));

    let server = SshServer::new(host_key, Arc::clone(&state), cancel.clone());

    tracing::info!(%bind_addr, "Starting SSH server");
    let result = server.run(&bind_addr).await;

    cancel.cancel();
    let _ = sweeper.await;

    result?;
    tracing::info!("Gateway shutdown complete");
    Ok(())
}

/// Load the configuration file, falling back to defaults when none exists
fn load_gateway_config(path: Option<&std::path::Path>) -> Result<GatewayConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            GatewayConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(GatewayConfig::default())
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = terminate.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });

    Ok(())
}
