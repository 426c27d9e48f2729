//! Project initialization (`foreman init`).

use anyhow::{Context, Result};
use std::path::Path;

use foreman::config::Config;
use foreman::errors::exit_codes;
use foreman::foreman_config::ForemanToml;

pub fn cmd_init(project_dir: &Path, name: Option<&str>, force: bool) -> Result<u8> {
    let project_dir = project_dir
        .canonicalize()
        .context("Failed to resolve project directory")?;
    let default_name = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let toml = ForemanToml::starter(name.unwrap_or(&default_name));
    let config = Config::with_toml(&project_dir, toml, false);

    let existed = config.config_file.exists();
    config.ensure_directories()?;
    if existed && !force {
        println!(
            "Foreman project already initialized at {}",
            config.foreman_dir.display()
        );
        println!("Directory structure verified. Use --force to rewrite foreman.toml.");
        return Ok(exit_codes::SUCCESS);
    }
    config.toml.save(&config.config_file)?;

    println!("Initialized foreman project at {}", config.foreman_dir.display());
    println!();
    println!("  .foreman/");
    println!("  ├── foreman.toml   # Phases, policies, budgets, agents");
    println!("  ├── checkpoints/   # Versioned workflow snapshots");
    println!("  ├── escalations/   # Requests waiting on a decision");
    println!("  ├── phases/        # Plans, feedback and results per attempt");
    println!("  └── logs/");
    println!();
    println!("Next steps:");
    println!("  1. Point each [agents.<id>] entry at a real command");
    println!("  2. Run `foreman config validate`");
    println!("  3. Run `foreman run`");
    Ok(exit_codes::SUCCESS)
}
