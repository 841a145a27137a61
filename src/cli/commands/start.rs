//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::Args;
use std::path::Path;

/// Start the replication node.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the snapshot directory.
    #[arg(long)]
    pub snapshot_dir: Option<String>,

    /// Override the peer listener bind address.
    #[arg(long)]
    pub peer_bind: Option<String>,

    /// Override the control listener bind address.
    #[arg(long)]
    pub ctrl_bind: Option<String>,
}

/// Initialize the tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_log_level: &str) {}

/// Run the start command.
pub async fn run_start(
    config_path: &Path,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = Config::from_file(config_path)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        snapshot_dir: args.snapshot_dir,
        peer_bind: args.peer_bind,
        ctrl_bind: args.ctrl_bind,
    });
    config.validate()?;
    init_tracing(&config.telemetry.log_level);

    let runtime = Runtime::new(config)?;
    runtime.run().await
}
