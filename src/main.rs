//! FloodKV - unified CLI entrypoint.
//!
//! Usage:
//!   floodkv start --config config/floodkv.toml
//!   floodkv config validate --config config/floodkv.toml
//!   floodkv status [--endpoint ADDR]
//!
//! Exit codes: 0 clean, 1 invalid configuration, 2 fatal runtime error.

use clap::Parser;
use floodkv::cli::{commands, Cli, Commands};
use floodkv::core::error::KvError;
use std::path::PathBuf;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/floodkv.toml"));

    let result = match cli.command {
        Commands::Start(args) => commands::run_start(&config_path, cli.log_level, args).await,
        Commands::Config(args) => commands::run_config(&config_path, args),
        Commands::Status(args) => commands::run_status(args).await,
    };

    match result {
        Ok(()) => {}
        Err(error) => {
            eprintln!("floodkv: {error:#}");
            let code = error
                .downcast_ref::<KvError>()
                .map(KvError::exit_code)
                .unwrap_or(2);
            std::process::exit(code);
        }
    }
}
