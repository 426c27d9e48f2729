//! Workflow inspection commands (`foreman status` and `foreman history`).

use anyhow::Result;
use std::path::Path;

use foreman::audit::EventLog;
use foreman::budget::BudgetLedger;
use foreman::checkpoint::CheckpointStore;
use foreman::errors::exit_codes;
use foreman::phase::Phase;

use super::load_config;
use super::run::print_escalation;

pub fn cmd_status(project_dir: &Path, verbose: bool) -> Result<u8> {
    let config = load_config(project_dir, verbose)?;
    let store = CheckpointStore::open(&config.checkpoint_dir)?;
    let Some(checkpoint) = store.load_latest()? else {
        println!("No workflow started. Run `foreman run` to start one.");
        return Ok(exit_codes::SUCCESS);
    };
    let state = checkpoint.state;

    println!();
    println!("Project:    {}", state.project);
    println!("Status:     {}", state.status);
    println!(
        "Phase:      {} ({}/{})",
        state.current_phase,
        state.current_phase.ordinal(),
        Phase::Done.ordinal()
    );
    println!("Checkpoint: {}", checkpoint.sequence);
    println!("Updated:    {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!("{:<14} {:<16} {:<10} Decision", "Phase", "Status", "Attempts");
    println!("{:<14} {:<16} {:<10} --------", "-----", "------", "--------");
    for (phase, record) in &state.phases {
        let decision = match &record.decision {
            Some(d) if d.approved => format!("approved ({:.1})", d.combined_score),
            Some(d) => format!("rejected ({:.1})", d.combined_score),
            None => "-".to_string(),
        };
        println!(
            "{:<14} {:<16} {:<10} {}",
            phase.name(),
            record.status.to_string(),
            record.iteration + 1,
            decision
        );
    }

    if !state.guidance.is_empty() {
        println!();
        println!("Guidance for the next attempt:");
        for line in &state.guidance {
            println!("  - {}", line);
        }
    }

    if let Some(last) = state.errors.last() {
        println!();
        println!(
            "Errors:     {} (last: {} at {}: {})",
            state.errors.len(),
            last.kind,
            last.phase,
            last.message
        );
    }

    let ledger = BudgetLedger::load_or_new(
        &config.budget_file,
        config.toml.budget.project_limit,
        config.toml.budget.task_limit,
        config.toml.budget.invocation_limit,
    )?;
    println!(
        "Budget:     {:.2} of {:.2} spent{}",
        ledger.project.spent,
        ledger.project.limit,
        if ledger.halted { " (halted)" } else { "" }
    );

    if let Some(pending) = &state.pending_escalation {
        println!();
        print_escalation(&pending.request);
    }
    println!();
    Ok(exit_codes::SUCCESS)
}

pub fn cmd_history(
    project_dir: &Path,
    verbose: bool,
    events: bool,
    phase: Option<&str>,
) -> Result<u8> {
    let config = load_config(project_dir, verbose)?;

    if events {
        let log = EventLog::new(&config.events_file, &config.project_name());
        let records = match phase {
            Some(p) => log.for_phase(p.parse::<Phase>()?)?,
            None => log.read_all()?,
        };
        if records.is_empty() {
            println!("No events recorded.");
        }
        for record in records {
            println!(
                "{}  {}",
                record.at.format("%Y-%m-%d %H:%M:%S"),
                serde_json::to_string(&record.event)?
            );
        }
        return Ok(exit_codes::SUCCESS);
    }

    let store = CheckpointStore::open(&config.checkpoint_dir)?;
    let history = store.history()?;
    if history.is_empty() {
        println!("No checkpoints recorded.");
        return Ok(exit_codes::SUCCESS);
    }

    println!(
        "{:<6} {:<8} {:<14} {:<11} {:<9} Committed",
        "Seq", "Parent", "Phase", "Status", "Attempt"
    );
    for entry in history {
        println!(
            "{:<6} {:<8} {:<14} {:<11} {:<9} {}{}",
            entry.sequence,
            entry.parent.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            entry.phase.name(),
            entry.status.to_string(),
            entry.iteration,
            entry.committed_at.format("%Y-%m-%d %H:%M:%S"),
            if entry.is_latest { "  <- latest" } else { "" }
        );
    }
    Ok(exit_codes::SUCCESS)
}
