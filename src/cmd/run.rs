//! Workflow execution commands (`foreman run` and `foreman resume`).

use anyhow::{Result, bail};
use std::path::Path;
use tracing::warn;

use foreman::errors::{WorkflowError, exit_codes};
use foreman::escalation::{EscalationRequest, ResumeAction, ResumeDecision};
use foreman::workflow::{Engine, EngineOptions, RunOutcome};

use super::load_config;

fn build_engine(project_dir: &Path, verbose: bool, wait: bool) -> Result<Engine> {
    let config = load_config(project_dir, verbose)?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    let options = EngineOptions::from_config(&config.toml).with_wait_for_decisions(wait);
    Ok(Engine::from_config(&config)?.with_options(options))
}

/// Cancel the engine on Ctrl-C. The current step finishes its bookkeeping
/// and the run stops at the next commit point.
fn cancel_on_interrupt(engine: &Engine) {
    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the workflow");
            cancel.cancel();
        }
    });
}

pub async fn cmd_run(project_dir: &Path, verbose: bool, wait: bool) -> Result<u8> {
    let engine = build_engine(project_dir, verbose, wait)?;
    cancel_on_interrupt(&engine);
    let outcome = engine.run().await?;
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

/// Build the resume action from the mutually exclusive CLI flags.
pub fn resume_action(
    answers: Vec<String>,
    override_instruction: Option<String>,
    abort: Option<String>,
) -> Result<ResumeAction> {
    match (answers.is_empty(), override_instruction, abort) {
        (false, None, None) => Ok(ResumeAction::Answers { answers }),
        (true, Some(instruction), None) => Ok(ResumeAction::Override { instruction }),
        (true, None, Some(reason)) => Ok(ResumeAction::Abort { reason }),
        _ => bail!("Provide exactly one of --answer, --override or --abort"),
    }
}

pub async fn cmd_resume(
    project_dir: &Path,
    verbose: bool,
    action: ResumeAction,
    no_run: bool,
) -> Result<u8> {
    let engine = build_engine(project_dir, verbose, false)?;
    let state = engine.status()?.ok_or(WorkflowError::NotStarted)?;
    let request = state
        .pending_escalation
        .as_ref()
        .map(|p| p.request.clone())
        .ok_or(WorkflowError::NotEscalated)?;
    let aborting = matches!(action, ResumeAction::Abort { .. });
    let decision = ResumeDecision::new(request.id, action);

    if no_run {
        engine.submit_decision(&decision)?;
        println!("Decision recorded for escalation {}.", request.id);
        println!("Run `foreman run` to apply it.");
        return Ok(exit_codes::SUCCESS);
    }

    cancel_on_interrupt(&engine);
    let outcome = engine.resume(decision).await?;
    print_outcome(&outcome);
    if aborting && outcome == RunOutcome::Aborted {
        return Ok(exit_codes::SUCCESS);
    }
    Ok(outcome.exit_code())
}

fn print_outcome(outcome: &RunOutcome) {
    println!();
    match outcome {
        RunOutcome::Completed => println!("Workflow completed."),
        RunOutcome::Aborted => println!("Workflow aborted."),
        RunOutcome::Escalated(request) => print_escalation(request),
    }
}

pub(crate) fn print_escalation(request: &EscalationRequest) {
    println!(
        "Workflow escalated at {} ({}, severity {})",
        request.phase, request.reason, request.severity
    );
    println!("  Request:  {}", request.id);
    println!("  Reason:   {}", request.details.message);
    for issue in &request.details.blocking_issues {
        println!("  Blocking: {}", issue);
    }
    for question in &request.details.questions {
        println!("  Question: {}", question);
    }
    if let Some(drift) = &request.details.drift {
        println!("  Drift:    {}", drift);
    }
    if let Some(ledger) = &request.details.ledger {
        println!(
            "  Budget:   {:.2} of {:.2} spent",
            ledger.project.spent, ledger.project.limit
        );
    }
    let options: Vec<String> = request.options.iter().map(|o| o.to_string()).collect();
    println!("  Options:  {} (recommended: {})", options.join(", "), request.recommended);
    println!();
    println!("Answer with `foreman resume --answer <text>`, `--override <text>` or `--abort <reason>`.");
}
