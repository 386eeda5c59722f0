//! Configuration view and validation commands: `evolver config`.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use evolver::config::EvolverConfig;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}, using defaults", config_path.display());
            }
            let config = EvolverConfig::load_layered(config_path)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let config = EvolverConfig::load_layered(config_path)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                if config.genesis_asset.is_none() {
                    println!("Note: genesis_asset is not set; a fresh store cannot start.");
                }
            } else {
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            EvolverConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
