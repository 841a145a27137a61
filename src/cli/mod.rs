//! Command-line interface.
//!
//! Unified CLI for FloodKV operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// FloodKV - eventually-consistent key-value replication node.
#[derive(Parser, Debug)]
#[command(name = "floodkv")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the replication node.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Show node status over the control endpoint.
    Status(commands::StatusArgs),
}
