//! Weave node - runs an in-process mesh of canvas peers
//!
//! Spawns N peer workers, connects them pairwise over tokio channels, lets
//! each one issue random concurrent edits and reports whether every replica
//! ended up with the same node map.

mod error;
mod mesh;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use libweave_core::{load_config, Strategy, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use error::NodeError;
use mesh::{run_mesh, MeshOptions};

#[derive(Parser)]
#[command(name = "weave-node", about = "Weave canvas sync mesh", version)]
struct Cli {
    /// Number of peers in the mesh
    #[arg(long, default_value_t = 3)]
    peers: usize,

    /// Edits issued by each peer
    #[arg(long, default_value_t = 20)]
    edits: usize,

    /// Size of the shared node pool
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    /// Conflict strategy (lww, ot); overrides the config file
    #[arg(long)]
    strategy: Option<String>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed for the edit stream
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Give up waiting for convergence after this long
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Snapshot polling interval while waiting
    #[arg(long, default_value_t = 25)]
    poll_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn sync_config(&self) -> Result<SyncConfig, NodeError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?.ok_or_else(|| {
                NodeError::InvalidArgs(format!("config file not found: {}", path.display()))
            })?,
            None => SyncConfig::default(),
        };

        if let Some(name) = &self.strategy {
            config.strategy = Strategy::parse(name)
                .ok_or_else(|| NodeError::InvalidArgs(format!("unknown strategy: {}", name)))?;
        }
        config.validate()?;
        Ok(config)
    }

    fn mesh_options(&self) -> MeshOptions {
        MeshOptions {
            peers: self.peers,
            edits: self.edits,
            nodes: self.nodes,
            seed: self.seed,
            timeout: Duration::from_millis(self.timeout_ms),
            poll: Duration::from_millis(self.poll_ms.max(1)),
        }
    }
}

async fn run(cli: &Cli) -> Result<bool, NodeError> {
    let config = cli.sync_config()?;
    let summary = run_mesh(&config, &cli.mesh_options()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.converged)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!(peers = cli.peers, edits = cli.edits, "weave-node starting");

    tokio::select! {
        result = run(&cli) => match result {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(1),
            Err(e) => {
                error!("Mesh error: {}", e);
                ExitCode::from(2)
            }
        },
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            ExitCode::from(130)
        }
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
