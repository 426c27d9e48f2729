//! Budget inspection and limit changes (`foreman budget`).

use anyhow::Result;
use std::path::Path;

use foreman::budget::{BudgetGovernor, BudgetLedger, BudgetScope};
use foreman::errors::exit_codes;

use super::super::BudgetCommands;
use super::load_config;

pub fn cmd_budget(project_dir: &Path, verbose: bool, command: Option<BudgetCommands>) -> Result<u8> {
    let config = load_config(project_dir, verbose)?;
    let ledger = BudgetLedger::load_or_new(
        &config.budget_file,
        config.toml.budget.project_limit,
        config.toml.budget.task_limit,
        config.toml.budget.invocation_limit,
    )?;
    let governor = BudgetGovernor::persistent(&config.budget_file, ledger);

    match command {
        None | Some(BudgetCommands::Show) => {
            let snapshot = governor.snapshot()?;
            println!();
            println!(
                "Project:    {:.2} of {:.2} spent{}",
                snapshot.project.spent,
                snapshot.project.limit,
                if snapshot.halted { " (halted)" } else { "" }
            );
            println!("Invocation: {:.2} ceiling", snapshot.invocation_limit);
            if !snapshot.tasks.is_empty() {
                println!();
                println!("{:<16} {:>10} {:>10}", "Task", "Spent", "Limit");
                for (task, balance) in &snapshot.tasks {
                    println!("{:<16} {:>10.2} {:>10.2}", task, balance.spent, balance.limit);
                }
            }
            println!();
        }
        Some(BudgetCommands::Raise { scope, limit }) => {
            let scope: BudgetScope = scope.parse()?;
            governor.raise_limit(&scope, limit)?;
            println!("Raised {} limit to {:.2}.", scope, limit);
        }
    }
    Ok(exit_codes::SUCCESS)
}
