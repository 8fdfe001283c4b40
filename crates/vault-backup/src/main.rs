//! `vault-backup`: backup and restore of a raft-backed secrets server
//! together with its unseal keys and root token.
//!
//! Startup sequence:
//! 1. Parse the subcommand (`backup` or `restore`).
//! 2. Load and validate [`Config`] from environment variables.
//! 3. Initialise tracing.
//! 4. Connect to the Kubernetes API.
//! 5. Run the selected operation.
//! 6. Write `output.json` when `OUTPUT_DIR` is set.

mod archive;
mod backup;
mod binding;
mod cluster;
mod config;
mod keys;
mod output;
mod prepare;
mod priority;
mod restore;
mod session;
mod store;
mod telemetry;
mod vault;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use cluster::KubeCluster;
use config::Config;
use prepare::Deps;
use session::ShellRunner;
use vault::HttpConnector;

#[derive(Debug, Parser)]
#[command(name = "vault-backup", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Take a raft snapshot and archive it with the unseal key set.
    Backup,
    /// Restore an archived snapshot and, with FORCE, migrate the key set.
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Command line
    // -----------------------------------------------------------------------
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 3. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?cli.command,
        binding = %cfg.appbinding,
        "vault-backup starting"
    );

    // -----------------------------------------------------------------------
    // 4. Kubernetes
    // -----------------------------------------------------------------------
    let cluster = KubeCluster::connect()
        .await
        .context("failed to connect to the Kubernetes API")?;
    let deps = Deps {
        cluster: Arc::new(cluster),
        runner: Arc::new(ShellRunner),
        connector: Arc::new(HttpConnector),
    };

    // -----------------------------------------------------------------------
    // 5-6. Operation and output record
    // -----------------------------------------------------------------------
    match cli.command {
        Command::Backup => {
            let out = backup::run(&cfg, &deps).await?;
            if let Some(dir) = &cfg.output_dir {
                output::write_output(dir, &out)?;
            }
        }
        Command::Restore => {
            let out = restore::run(&cfg, &deps).await?;
            if let Some(dir) = &cfg.output_dir {
                output::write_output(dir, &out)?;
            }
        }
    }

    Ok(())
}
