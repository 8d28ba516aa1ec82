//! cellfs server binary
//!
//! Serves one cell of the cell table over TCP.
//!
//! ## Usage
//!
//! ```bash
//! # Serve cell "aa" from the default cell table
//! cellfs-server --cell aa
//!
//! # Explicit table and bind address
//! cellfs-server --config /etc/cellfs/cells.json --cell aa --bind 127.0.0.1:7001
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cellfs_client::TcpTransport;
use cellfs_kernel::constants::{DEFAULT_DIR_MODE, ENV_CELL, ENV_CONFIG};
use cellfs_kernel::{CellConfig, CellRegistry, FileStore, StaticRegistry};
use cellfs_server::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use cellfs_server::{CellServer, Maintenance, log_settings, serve};

#[derive(Debug, Parser)]
#[command(name = "cellfs-server", version, about = "Serve one cellfs cell over TCP")]
struct Args {
    /// Cell table (JSON). Defaults to cellfs/cells.json in the config directory.
    #[arg(long, env = ENV_CONFIG)]
    config: Option<PathBuf>,

    /// Name of the cell to serve.
    #[arg(long, env = ENV_CELL)]
    cell: String,

    /// Listen address, overriding 0.0.0.0:<fs_port>.
    #[arg(long)]
    bind: Option<String>,

    /// Seconds between lock, TTL and log sweeps.
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval_secs: u64,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (registry, config) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("cellfs-server: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match cellfs_telemetry::init_logging(&log_settings(&config)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cellfs-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_thread_count > 0 {
        builder.worker_threads(config.worker_thread_count);
    }
    let runtime = match builder.enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args, registry, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(args: &Args) -> anyhow::Result<(StaticRegistry, CellConfig)> {
    let registry = cellfs_client::load_registry(args.config.as_deref())?;
    let config = registry
        .lookup(&args.cell)
        .with_context(|| format!("cell {}", args.cell))?;
    if config.disabled {
        anyhow::bail!("cell {} is disabled", args.cell);
    }
    Ok((registry, config))
}

async fn run(args: Args, registry: StaticRegistry, config: CellConfig) -> anyhow::Result<()> {
    let store = FileStore::new(&config.physical_root);
    store
        .create_dir_if_not_exist(&config.physical_root, DEFAULT_DIR_MODE)
        .await
        .context("preparing cell root")?;

    let maintenance = Maintenance::new(&config, store);
    maintenance.sweep_locks().await.context("startup lock sweep")?;

    let bind = match args.bind {
        Some(addr) => addr,
        None => config.listen_address()?,
    };
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(
        maintenance.run_periodically(Duration::from_secs(args.sweep_interval_secs), shutdown.clone()),
    );
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
            }
        }
    });

    let server = Arc::new(CellServer::new(
        config,
        Arc::new(registry),
        Arc::new(TcpTransport::new()),
    ));
    serve(listener, server, shutdown).await?;
    Ok(())
}
