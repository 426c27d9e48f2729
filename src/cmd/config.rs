//! Configuration view and validation commands (`foreman config`).

use anyhow::{Context, Result};
use std::path::Path;

use foreman::config::Config;
use foreman::errors::exit_codes;
use foreman::foreman_config::ENV_OVERRIDES;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, verbose: bool, command: Option<ConfigCommands>) -> Result<u8> {
    let config = Config::new(project_dir, verbose)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config.config_file.exists() {
                println!("Config file: {}", config.config_file.display());
            } else {
                println!("No foreman.toml found at {}", config.config_file.display());
                println!("Using default configuration.");
            }

            let overrides: Vec<&str> = ENV_OVERRIDES
                .iter()
                .copied()
                .filter(|key| std::env::var(key).is_ok())
                .collect();
            if !overrides.is_empty() {
                println!("Environment overrides: {}", overrides.join(", "));
            }
            println!();
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(exit_codes::SUCCESS)
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
                Ok(exit_codes::SUCCESS)
            } else {
                println!("Configuration problems:");
                for problem in problems {
                    println!("  - {}", problem);
                }
                Ok(exit_codes::FAILURE)
            }
        }
    }
}
