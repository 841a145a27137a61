//! Configuration commands.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Parse and gate-check the configuration file.
    Validate,
    /// Print the effective configuration after defaults.
    Show,
}

/// Run a configuration command.
pub fn run_config(config_path: &Path, args: ConfigArgs) -> Result<()> {
    let config = Config::from_file(config_path)?;
    match args.action {
        ConfigAction::Validate => {
            println!("config OK: {}", config_path.display());
        }
        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&config)?;
            println!("{rendered}");
        }
    }
    Ok(())
}
