use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use foreman::config::FOREMAN_DIR;
use foreman::errors::exit_code_for_error;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Phase-gated workflow orchestration for AI collaborators")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .foreman/ with a starter foreman.toml
    Init {
        /// Project name recorded in foreman.toml
        #[arg(long)]
        name: Option<String>,
        /// Overwrite an existing foreman.toml
        #[arg(long)]
        force: bool,
    },
    /// Start a workflow, or continue it from the latest checkpoint
    Run {
        /// Wait in-process for escalation decisions instead of exiting
        #[arg(long)]
        wait: bool,
    },
    /// Show the current workflow state
    Status,
    /// List checkpoints, or the event log with --events
    History {
        #[arg(long)]
        events: bool,
        /// Only events of this phase (name or number)
        #[arg(long, requires = "events")]
        phase: Option<String>,
    },
    /// Answer the pending escalation and continue the workflow
    Resume {
        /// Clarification answer (repeatable)
        #[arg(long = "answer", value_name = "TEXT")]
        answers: Vec<String>,
        /// Instruction that overrides the blocking outcome
        #[arg(long = "override", value_name = "TEXT", conflicts_with = "answers")]
        override_instruction: Option<String>,
        /// Abort the workflow with a reason
        #[arg(long, value_name = "REASON", conflicts_with_all = ["answers", "override_instruction"])]
        abort: Option<String>,
        /// Record the decision without running the next phases
        #[arg(long)]
        no_run: bool,
    },
    /// Roll back to the most recent checkpoint of a phase
    Rollback {
        /// Phase name or number
        #[arg(long)]
        phase: String,
    },
    /// Inspect or raise budget limits
    Budget {
        #[command(subcommand)]
        command: Option<BudgetCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum BudgetCommands {
    /// Show limits, spend and reservations
    Show,
    /// Raise a limit; clears a project hard stop
    Raise {
        /// `project` or `task:<id>`
        #[arg(long)]
        scope: String,
        #[arg(long)]
        limit: f64,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    dotenvy::from_path(project_dir.join(".env")).ok();
    let log_dir = project_dir.join(FOREMAN_DIR).join("logs");
    let _guard = foreman::logging::init_logging(Some(&log_dir), cli.verbose)?;

    match cli.command {
        Commands::Init { name, force } => cmd::cmd_init(&project_dir, name.as_deref(), force),
        Commands::Run { wait } => cmd::cmd_run(&project_dir, cli.verbose, wait).await,
        Commands::Status => cmd::cmd_status(&project_dir, cli.verbose),
        Commands::History { events, phase } => {
            cmd::cmd_history(&project_dir, cli.verbose, events, phase.as_deref())
        }
        Commands::Resume {
            answers,
            override_instruction,
            abort,
            no_run,
        } => {
            let action = cmd::resume_action(answers, override_instruction, abort)?;
            cmd::cmd_resume(&project_dir, cli.verbose, action, no_run).await
        }
        Commands::Rollback { phase } => cmd::cmd_rollback(&project_dir, cli.verbose, &phase),
        Commands::Budget { command } => cmd::cmd_budget(&project_dir, cli.verbose, command),
        Commands::Config { command } => cmd::cmd_config(&project_dir, cli.verbose, command),
    }
}
