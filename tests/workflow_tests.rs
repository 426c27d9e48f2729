//! End-to-end workflow tests with scripted in-process collaborators.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use foreman::agent::{
    Collaborator, CollaboratorRegistry, InvocationError, InvocationRequest, RawOutput, Role,
};
use foreman::audit::WorkflowEvent;
use foreman::budget::{BudgetLedger, BudgetScope};
use foreman::config::Config;
use foreman::drift::DriftPolicy;
use foreman::errors::{WorkflowError, exit_codes};
use foreman::escalation::{EscalationReason, ResumeAction, ResumeDecision};
use foreman::foreman_config::ForemanToml;
use foreman::phase::Phase;
use foreman::workflow::{Engine, RetryCause, RunOutcome, WorkflowStatus};

// =============================================================================
// Scripted collaborators
// =============================================================================

enum Reply {
    Json(String),
    Hang,
}

type Respond = dyn Fn(&InvocationRequest, usize) -> Reply + Send + Sync;

/// A collaborator that answers from a closure and records every request.
/// The closure receives the request and how many times this collaborator was
/// already called in the same phase.
struct Scripted {
    id: String,
    calls: Mutex<Vec<InvocationRequest>>,
    respond: Box<Respond>,
}

impl Scripted {
    fn new<F>(id: &str, respond: F) -> Arc<Self>
    where
        F: Fn(&InvocationRequest, usize) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn calls(&self) -> Vec<InvocationRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_in(&self, phase: Phase) -> Vec<InvocationRequest> {
        self.calls().into_iter().filter(|r| r.phase == phase).collect()
    }
}

#[async_trait]
impl Collaborator for Scripted {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<RawOutput, InvocationError> {
        let prior = {
            let mut calls = self.calls.lock().unwrap();
            let prior = calls.iter().filter(|r| r.phase == request.phase).count();
            calls.push(request.clone());
            prior
        };
        match (self.respond)(request, prior) {
            Reply::Json(json) => Ok(RawOutput::new(json)),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(InvocationError::Failed("woke up".to_string()))
            }
        }
    }
}

fn plan_json() -> Reply {
    Reply::Json(r#"{"status":"completed","plan":{"steps":["add endpoint","add tests"]}}"#.to_string())
}

fn implementation_json() -> Reply {
    Reply::Json(
        r#"{"status":"completed","files_touched":["src/lib.rs"],"tests_passed":3,"tests_failed":0}"#
            .to_string(),
    )
}

fn approve() -> Reply {
    Reply::Json(r#"{"approved":true,"score":9}"#.to_string())
}

fn reject(issue: &str) -> Reply {
    Reply::Json(format!(
        r#"{{"approved":false,"score":3,"blocking_issues":["{}"]}}"#,
        issue
    ))
}

struct Team {
    planner: Arc<Scripted>,
    implementer: Arc<Scripted>,
    security: Arc<Scripted>,
    architecture: Arc<Scripted>,
}

impl Team {
    fn cooperative() -> Self {
        Self {
            planner: Scripted::new("planner", |_, _| plan_json()),
            implementer: Scripted::new("implementer", |_, _| implementation_json()),
            security: Scripted::new("security", |_, _| approve()),
            architecture: Scripted::new("architecture", |_, _| approve()),
        }
    }

    fn with_security(mut self, security: Arc<Scripted>) -> Self {
        self.security = security;
        self
    }

    fn with_architecture(mut self, architecture: Arc<Scripted>) -> Self {
        self.architecture = architecture;
        self
    }

    fn with_planner(mut self, planner: Arc<Scripted>) -> Self {
        self.planner = planner;
        self
    }

    fn registry(&self) -> CollaboratorRegistry {
        CollaboratorRegistry::new()
            .register(self.planner.clone())
            .register(self.implementer.clone())
            .register(self.security.clone())
            .register(self.architecture.clone())
    }
}

fn base_toml() -> ForemanToml {
    let mut toml = ForemanToml::default();
    toml.project.name = Some("shop".to_string());
    toml.rate_limit.capacity = 100;
    toml.rate_limit.refill_per_sec = 100.0;
    toml
}

fn engine(dir: &Path, toml: ForemanToml, team: &Team) -> Engine {
    let config = Config::with_toml(dir, toml, false);
    Engine::new(&config, team.registry()).unwrap()
}

fn events(engine: &Engine) -> Vec<WorkflowEvent> {
    engine
        .events()
        .read_all()
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect()
}

fn escalated(outcome: RunOutcome) -> foreman::escalation::EscalationRequest {
    match outcome {
        RunOutcome::Escalated(request) => request,
        other => panic!("expected an escalation, got {:?}", other),
    }
}

// =============================================================================
// Happy path
// =============================================================================

mod happy_path {
    use super::*;

    #[tokio::test]
    async fn test_workflow_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);

        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(outcome.exit_code(), exit_codes::SUCCESS);

        let state = engine.status().unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.current_phase, Phase::Done);

        let phases = dir.path().join(".foreman/phases");
        assert!(phases.join("planning/attempt-0/plan.json").exists());
        assert!(phases.join("implementing/attempt-0/result.json").exists());
        assert!(phases.join("verifying/attempt-0/decision.json").exists());
        assert!(phases.join("completing/attempt-0/COMPLETION.md").exists());
        assert!(dir.path().join(".foreman/state.json").exists());

        assert_eq!(team.planner.calls().len(), 1);
        assert_eq!(team.implementer.calls().len(), 1);
        assert_eq!(team.security.calls().len(), 2);
        assert!(
            events(&engine)
                .iter()
                .any(|e| matches!(e, WorkflowEvent::Completed { .. }))
        );
    }

    #[tokio::test]
    async fn test_implementer_brief_carries_plan_artifact() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);
        engine.run().await.unwrap();

        let request = &team.implementer.calls()[0];
        assert_eq!(request.role, Role::Implementer);
        assert!(
            request
                .brief
                .artifacts
                .iter()
                .any(|p| p.ends_with("planning/attempt-0/plan.json"))
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);
        engine.start().unwrap();

        let err = engine.start().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::AlreadyStarted { .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);
        engine.run().await.unwrap();

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(team.planner.calls().len(), 1);
    }

    #[test]
    fn test_unregistered_participant_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_toml(dir.path(), base_toml(), false);
        let registry = CollaboratorRegistry::new()
            .register(Scripted::new("planner", |_, _| plan_json()));

        let err = Engine::new(&config, registry).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::UnknownParticipant(_))
        ));
    }
}

// =============================================================================
// Review retries and escalation
// =============================================================================

mod review_retries {
    use super::*;

    #[tokio::test]
    async fn test_rejected_verification_reruns_implementer_with_guidance() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_security(Scripted::new("security", |req, prior| {
            if req.phase == Phase::Verifying && prior == 0 {
                reject("sql injection in query builder")
            } else {
                approve()
            }
        }));
        let engine = engine(dir.path(), base_toml(), &team);

        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let implementer = team.implementer.calls();
        assert_eq!(implementer.len(), 2);
        assert_eq!(implementer[1].phase, Phase::Verifying);
        assert!(
            implementer[1]
                .brief
                .guidance
                .iter()
                .any(|g| g.contains("sql injection"))
        );

        // Approving feedback is carried into the retry.
        assert_eq!(team.architecture.calls_in(Phase::Verifying).len(), 1);
        assert_eq!(team.security.calls_in(Phase::Verifying).len(), 2);

        assert!(events(&engine).iter().any(|e| matches!(
            e,
            WorkflowEvent::Retry {
                phase: Phase::Verifying,
                cause: RetryCause::Rejected,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_security(Scripted::new("security", |req, _| {
            if req.phase == Phase::Validating {
                reject("plan stores passwords in plain text")
            } else {
                approve()
            }
        }));
        let mut toml = base_toml();
        toml.workflow.max_retries = 1;
        let engine = engine(dir.path(), toml, &team);

        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome.exit_code(), exit_codes::FAILURE);
        let request = escalated(outcome);
        assert_eq!(request.reason, EscalationReason::RetriesExhausted);
        assert_eq!(request.phase, Phase::Validating);
        assert!(
            request
                .details
                .blocking_issues
                .iter()
                .any(|i| i.contains("plain text"))
        );

        // One initial attempt plus one retry.
        assert_eq!(team.planner.calls().len(), 2);
        assert_eq!(team.security.calls_in(Phase::Validating).len(), 2);
        assert!(team.implementer.calls().is_empty());

        let state = engine.status().unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Escalated);
        assert_eq!(engine.escalations().pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_escalated_run_returns_same_request_until_answered() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_security(Scripted::new("security", |_, _| {
            reject("missing authentication")
        }));
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);

        let first = escalated(engine.run().await.unwrap());
        let second = escalated(engine.run().await.unwrap());
        assert_eq!(first.id, second.id);
        assert_eq!(team.planner.calls().len(), 1);
    }
}

// =============================================================================
// Malformed reviewer output
// =============================================================================

mod malformed_output {
    use super::*;

    fn garbled_architecture() -> Arc<Scripted> {
        Scripted::new("architecture", |_, _| Reply::Json("not json".to_string()))
    }

    fn feedback_artifact(dir: &Path, phase: &str, attempt: u32) -> serde_json::Value {
        let path = dir.join(format!(
            ".foreman/phases/{}/attempt-{}/feedback-architecture.json",
            phase, attempt
        ));
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_garbled_review_becomes_error_feedback_and_escalates() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_architecture(garbled_architecture());
        let mut toml = base_toml();
        toml.workflow.max_retries = 1;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        assert_eq!(request.reason, EscalationReason::RetriesExhausted);
        assert_eq!(request.phase, Phase::Validating);

        let state = engine.status().unwrap().unwrap();
        assert_eq!(state.current_phase, Phase::Validating);
        assert_eq!(state.status, WorkflowStatus::Escalated);
        assert!(team.implementer.calls().is_empty());

        let feedback = feedback_artifact(dir.path(), "validating", 0);
        assert_eq!(feedback["approved"], serde_json::json!(false));
        assert_eq!(feedback["score"].as_f64(), Some(0.0));
        let reason = feedback["error"].as_str().unwrap();
        assert!(reason.starts_with("parse error"), "{}", reason);
        assert!(reason.contains("no JSON object"), "{}", reason);

        // The ERROR feedback is concerned, so the reviewer runs again on retry.
        assert_eq!(team.architecture.calls_in(Phase::Validating).len(), 2);
        assert_eq!(team.planner.calls().len(), 2);

        let events = events(&engine);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::ParticipantFailed {
                phase: Phase::Validating,
                participant,
                ..
            } if participant == "architecture"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::Retry {
                phase: Phase::Validating,
                cause: RetryCause::Rejected,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_garbled_review_falls_back_to_backup_reviewer() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_architecture(garbled_architecture());
        let backup = Scripted::new("architecture-backup", |_, _| approve());
        let registry = team
            .registry()
            .register(backup.clone())
            .with_backup("architecture", "architecture-backup");
        let config = Config::with_toml(dir.path(), base_toml(), false);
        let engine = Engine::new(&config, registry).unwrap();

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(team.architecture.calls().len(), 2);
        assert_eq!(backup.calls().len(), 2);

        let feedback = feedback_artifact(dir.path(), "validating", 0);
        assert_eq!(feedback["approved"], serde_json::json!(true));
        assert!(feedback["error"].is_null());
    }
}

// =============================================================================
// Resume
// =============================================================================

mod resume {
    use super::*;

    fn stubborn_team(fixed: Arc<AtomicBool>) -> Team {
        Team::cooperative().with_security(Scripted::new("security", move |req, _| {
            if req.phase == Phase::Validating && !fixed.load(Ordering::SeqCst) {
                reject("plan skips input validation")
            } else {
                approve()
            }
        }))
    }

    #[tokio::test]
    async fn test_override_resumes_to_completion() {
        let dir = TempDir::new().unwrap();
        let fixed = Arc::new(AtomicBool::new(false));
        let team = stubborn_team(fixed.clone());
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        fixed.store(true, Ordering::SeqCst);

        let decision = ResumeDecision::new(
            request.id,
            ResumeAction::Override {
                instruction: "validate inputs at the boundary".to_string(),
            },
        );
        let outcome = engine.resume(decision.clone()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let planner = team.planner.calls();
        let last = planner.last().unwrap();
        assert!(
            last.brief
                .guidance
                .iter()
                .any(|g| g == "Override: validate inputs at the boundary")
        );

        let state = engine.status().unwrap().unwrap();
        assert!(state.consumed_decisions.contains(&request.id));

        let err = engine.resume(decision).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::DecisionAlreadyConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_answers_are_added_as_clarifications() {
        let dir = TempDir::new().unwrap();
        let fixed = Arc::new(AtomicBool::new(false));
        let team = stubborn_team(fixed.clone());
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        fixed.store(true, Ordering::SeqCst);
        let decision = ResumeDecision::new(
            request.id,
            ResumeAction::Answers {
                answers: vec!["use the shared validator".to_string()],
            },
        );

        assert_eq!(engine.resume(decision).await.unwrap(), RunOutcome::Completed);
        let planner = team.planner.calls();
        assert!(
            planner
                .last()
                .unwrap()
                .brief
                .guidance
                .contains(&"Clarification: use the shared validator".to_string())
        );
    }

    #[tokio::test]
    async fn test_abort_ends_the_workflow() {
        let dir = TempDir::new().unwrap();
        let team = stubborn_team(Arc::new(AtomicBool::new(false)));
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        let decision = ResumeDecision::new(
            request.id,
            ResumeAction::Abort {
                reason: "requirements changed".to_string(),
            },
        );

        assert_eq!(engine.resume(decision).await.unwrap(), RunOutcome::Aborted);
        let state = engine.status().unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Aborted);
        assert!(events(&engine).iter().any(|e| matches!(
            e,
            WorkflowEvent::Aborted { reason, .. } if reason == "requirements changed"
        )));
    }

    #[tokio::test]
    async fn test_decision_for_another_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let team = stubborn_team(Arc::new(AtomicBool::new(false)));
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);
        escalated(engine.run().await.unwrap());

        let stray = ResumeDecision::new(
            uuid::Uuid::new_v4(),
            ResumeAction::Override {
                instruction: "ship it".to_string(),
            },
        );
        let err = engine.submit_decision(&stray).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::DecisionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_submitted_decision_is_applied_by_next_run() {
        let dir = TempDir::new().unwrap();
        let fixed = Arc::new(AtomicBool::new(false));
        let team = stubborn_team(fixed.clone());
        let mut toml = base_toml();
        toml.workflow.max_retries = 0;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        fixed.store(true, Ordering::SeqCst);
        engine
            .submit_decision(&ResumeDecision::new(
                request.id,
                ResumeAction::Override {
                    instruction: "proceed".to_string(),
                },
            ))
            .unwrap();

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        assert!(engine.escalations().is_consumed(request.id));
    }
}

// =============================================================================
// Budget
// =============================================================================

mod budget {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_project_budget_halts_before_invoking() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let mut toml = base_toml();
        toml.budget.project_limit = 10.0;
        toml.budget.task_limit = 5.0;
        toml.budget.invocation_limit = 0.5;

        let config = Config::with_toml(dir.path(), toml, false);
        config.ensure_directories().unwrap();
        let mut ledger = BudgetLedger::new(10.0, 5.0, 0.5);
        ledger.record_spend(&BudgetScope::Project, 9.8).unwrap();
        ledger.save(&config.budget_file).unwrap();
        let engine = Engine::new(&config, team.registry()).unwrap();

        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome.exit_code(), exit_codes::BUDGET_EXCEEDED);
        let request = escalated(outcome);
        assert_eq!(request.reason, EscalationReason::BudgetExceeded);
        assert!(request.details.ledger.is_some());
        assert!(team.planner.calls().is_empty());

        let snapshot = engine.budget().snapshot().unwrap();
        assert!(snapshot.halted);
        assert!((snapshot.project.spent - 9.8).abs() < 1e-9);

        engine
            .budget()
            .raise_limit(&BudgetScope::Project, 20.0)
            .unwrap();
        let decision = ResumeDecision::new(
            request.id,
            ResumeAction::Override {
                instruction: "budget raised".to_string(),
            },
        );
        assert_eq!(engine.resume(decision).await.unwrap(), RunOutcome::Completed);
        assert_eq!(team.planner.calls().len(), 1);
    }
}

// =============================================================================
// Context drift
// =============================================================================

mod drift {
    use super::*;

    fn editing_team(root: &Path) -> Team {
        let agents_md = root.join("AGENTS.md");
        Team::cooperative().with_planner(Scripted::new("planner", move |_, prior| {
            if prior == 0 {
                std::fs::write(&agents_md, "# Agents\n\nNew house rules.\n").unwrap();
            }
            plan_json()
        }))
    }

    #[tokio::test]
    async fn test_block_policy_escalates_on_drift() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "# Agents\n").unwrap();
        let team = editing_team(dir.path());
        let mut toml = base_toml();
        toml.drift.policy = DriftPolicy::Block;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        assert_eq!(request.reason, EscalationReason::ContextDrift);
        assert_eq!(request.phase, Phase::Planning);
        let drift = request.details.drift.clone().unwrap();
        assert_eq!(drift.changed, vec!["AGENTS.md".to_string()]);
        assert!(team.security.calls().is_empty());

        // Accepting the new context re-runs the phase against a fresh baseline.
        let decision = ResumeDecision::new(
            request.id,
            ResumeAction::Override {
                instruction: "new rules accepted".to_string(),
            },
        );
        assert_eq!(engine.resume(decision).await.unwrap(), RunOutcome::Completed);
        assert_eq!(team.planner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_warn_policy_logs_and_continues() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "# Agents\n").unwrap();
        let team = editing_team(dir.path());
        let mut toml = base_toml();
        toml.drift.policy = DriftPolicy::Warn;
        let engine = engine(dir.path(), toml, &team);

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        let drift_events = events(&engine)
            .into_iter()
            .filter(|e| matches!(e, WorkflowEvent::Drift { .. }))
            .count();
        assert_eq!(drift_events, 1);
    }
}

// =============================================================================
// Rollback
// =============================================================================

mod rollback {
    use super::*;

    #[tokio::test]
    async fn test_rollback_reenters_phase_and_runs_again() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);
        engine.run().await.unwrap();

        let state = engine.rollback(Phase::Implementing).unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.current_phase, Phase::Implementing);
        assert_eq!(state.current().iteration, 1);

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);
        assert_eq!(team.implementer.calls().len(), 2);
        assert_eq!(team.implementer.calls()[1].attempt, 1);
        assert!(events(&engine).iter().any(|e| matches!(
            e,
            WorkflowEvent::Rollback {
                phase: Phase::Implementing,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_rollback_to_done_is_rejected() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative();
        let engine = engine(dir.path(), base_toml(), &team);
        engine.run().await.unwrap();

        assert!(engine.rollback(Phase::Done).is_err());
    }
}

// =============================================================================
// Timeouts
// =============================================================================

mod timeouts {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_once_with_extended_limit() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative().with_architecture(Scripted::new(
            "architecture",
            |req, prior| {
                if req.phase == Phase::Validating && prior == 0 {
                    Reply::Hang
                } else {
                    approve()
                }
            },
        ));
        let mut toml = base_toml();
        toml.workflow.timeout_secs = 1;
        let engine = engine(dir.path(), toml, &team);

        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);

        let calls = team.architecture.calls_in(Phase::Validating);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].timeout_secs, 1);
        assert_eq!(calls[1].timeout_secs, 2);
        // The approving reviewer is not asked again.
        assert_eq!(team.security.calls_in(Phase::Validating).len(), 1);

        assert!(events(&engine).iter().any(|e| matches!(
            e,
            WorkflowEvent::Retry {
                phase: Phase::Validating,
                cause: RetryCause::Timeout,
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_timeout_escalates() {
        let dir = TempDir::new().unwrap();
        let team = Team::cooperative()
            .with_architecture(Scripted::new("architecture", |_, _| Reply::Hang));
        let mut toml = base_toml();
        toml.workflow.timeout_secs = 1;
        let engine = engine(dir.path(), toml, &team);

        let request = escalated(engine.run().await.unwrap());
        assert_eq!(request.reason, EscalationReason::Timeout);
        assert_eq!(request.phase, Phase::Validating);
        assert_eq!(team.architecture.calls().len(), 2);
    }
}
