//! Checkpoint rollback (`foreman rollback --phase <name|n>`).

use anyhow::Result;
use std::path::Path;

use foreman::errors::exit_codes;
use foreman::phase::Phase;
use foreman::workflow::Engine;

use super::load_config;

pub fn cmd_rollback(project_dir: &Path, verbose: bool, phase: &str) -> Result<u8> {
    let phase: Phase = phase.parse()?;
    let config = load_config(project_dir, verbose)?;
    let engine = Engine::from_config(&config)?;
    let state = engine.rollback(phase)?;

    println!(
        "Rolled back to {} (attempt {}). Run `foreman run` to continue.",
        state.current_phase,
        state.current().iteration + 1
    );
    Ok(exit_codes::SUCCESS)
}
