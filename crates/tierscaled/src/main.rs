//! tierscaled — the tierscale daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Metrics collector
//! - Service directory
//! - Lifecycle manager (stateless tier)
//! - Identity allocators (stateful tier)
//! - Tier controllers
//! - REST API
//!
//! # Usage
//!
//! ```text
//! tierscaled scaffold > tierscale.toml
//! tierscaled run --config tierscale.toml --data-dir /var/lib/tierscale
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use tierscale_state::{StateStore, TierscaleConfig};
use tierscaled::{ControlPlane, SimulatedProvisioner, SimulatedStorage};

#[derive(Parser)]
#[command(name = "tierscaled", about = "tierscale autoscaling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane with simulated compute and storage.
    Run {
        /// Path to tierscale.toml.
        #[arg(long, default_value = "tierscale.toml")]
        config: PathBuf,

        /// Port to listen on (overrides the config).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides the config).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Report instances Ready as soon as they are running.
        #[arg(long)]
        auto_ready: bool,

        /// Simulated provisioning latency in milliseconds.
        #[arg(long, default_value = "0")]
        provision_latency_ms: u64,
    },
    /// Validate a configuration file and exit.
    CheckConfig {
        #[arg(long, default_value = "tierscale.toml")]
        config: PathBuf,
    },
    /// Print a starter configuration.
    Scaffold,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tierscaled=debug,tierscale=debug".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            auto_ready,
            provision_latency_ms,
        } => {
            let mut config = TierscaleConfig::from_file(&config)?;
            if let Some(port) = port {
                config.controller.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.controller.data_dir = data_dir;
            }
            run_standalone(config, auto_ready, Duration::from_millis(provision_latency_ms)).await
        }
        Command::CheckConfig { config } => {
            let parsed = TierscaleConfig::from_file(&config)?;
            println!(
                "{}: ok ({} services)",
                config.display(),
                parsed.services.len()
            );
            Ok(())
        }
        Command::Scaffold => {
            print!("{}", TierscaleConfig::scaffold().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run_standalone(
    config: TierscaleConfig,
    auto_ready: bool,
    provision_latency: Duration,
) -> anyhow::Result<()> {
    info!("tierscale daemon starting");

    std::fs::create_dir_all(&config.controller.data_dir)?;
    let db_path = config.controller.data_dir.join("tierscale.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let port = config.controller.port;
    let provisioner = Arc::new(SimulatedProvisioner::new(&config, provision_latency));
    let storage = Arc::new(SimulatedStorage::default());
    let plane = ControlPlane::assemble(config, store, provisioner, storage).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.start(shutdown_rx, auto_ready).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, plane.router()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for CTRL+C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("tierscale daemon stopped");
    Ok(())
}
