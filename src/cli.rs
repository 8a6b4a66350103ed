//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::loader::load_config;
use crate::gateway::Gateway;

#[derive(Parser, Debug)]
#[command(name = "omnigate", version, about = "Personal AI assistant gateway")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (default: ~/.omnigate/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway daemon (the default)
    Gateway,
    /// Validate the config file and print the effective settings
    CheckConfig,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".omnigate").join("config.json"))
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .or_else(default_config_path)
        .context("could not determine config path")?;
    let config = load_config(&config_path)?;

    match cli.command.unwrap_or(Command::Gateway) {
        Command::Gateway => {
            let gateway = Arc::new(Gateway::new(config).await?);
            gateway.run().await
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommands_present() {
        let cmd = Cli::command();
        let names: Vec<_> = cmd.get_subcommands().map(|c| c.get_name()).collect();
        assert!(names.contains(&"gateway"));
        assert!(names.contains(&"check-config"));
    }

    #[test]
    fn test_config_flag() {
        let cli = Cli::parse_from(["omnigate", "--config", "/tmp/c.json", "gateway"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/c.json")));
    }
}
