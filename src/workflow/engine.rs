//! The workflow driver.
//!
//! The engine loads the latest checkpoint, runs the current phase, routes
//! the outcome through [`transition`] and commits the resulting state before
//! it performs any side effect that depends on it (raising an escalation,
//! entering the next phase). A crash at any point resumes from the last
//! committed snapshot.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use super::dispatch::{DispatchFailure, Dispatcher};
use super::fanout::{FanOut, UnitOutcome};
use super::state::{RetryCause, WorkflowState, WorkflowStatus};
use super::transition::{self, Route, StepOutcome};
use crate::agent::parse::{parse_feedback, parse_implementation};
use crate::agent::{
    CollaboratorRegistry, CommandCollaborator, InvocationRequest, Role, TaskBrief,
};
use crate::audit::{ArtifactStore, EventLog, WorkflowEvent};
use crate::budget::{BudgetGovernor, BudgetLedger, RateLimiter, Reservation};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::drift::{DriftDetector, DriftPolicy};
use crate::errors::{ErrorKind, WorkflowError, exit_codes};
use crate::escalation::{
    EscalationDetails, EscalationHandler, EscalationReason, EscalationRequest, ResumeAction,
    ResumeDecision,
};
use crate::foreman_config::ForemanToml;
use crate::phase::{Phase, PhaseSpec, WorkflowPlan};
use crate::review::{Feedback, FeedbackOutcome, PolicyEngine};

/// Scheduling knobs that are not part of the phase plan.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub max_parallel: usize,
    /// Deadline for a whole fan-out.
    pub phase_timeout: Option<Duration>,
    pub timeout_extension_factor: u32,
    pub drift_policy: DriftPolicy,
    pub decision_poll: Duration,
    /// Block in-process on escalations instead of returning.
    pub wait_for_decisions: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            phase_timeout: None,
            timeout_extension_factor: 2,
            drift_policy: DriftPolicy::Warn,
            decision_poll: Duration::from_secs(1),
            wait_for_decisions: false,
        }
    }
}

impl EngineOptions {
    pub fn from_config(toml: &ForemanToml) -> Self {
        let workflow = &toml.workflow;
        Self {
            max_parallel: workflow.max_parallel.max(1),
            phase_timeout: (workflow.phase_timeout_secs > 0)
                .then(|| Duration::from_secs(workflow.phase_timeout_secs)),
            timeout_extension_factor: workflow.timeout_extension_factor.max(1),
            drift_policy: toml.drift.policy,
            decision_poll: Duration::from_millis(workflow.decision_poll_ms.max(10)),
            wait_for_decisions: false,
        }
    }

    pub fn with_wait_for_decisions(mut self, wait: bool) -> Self {
        self.wait_for_decisions = wait;
        self
    }
}

/// How a call to [`Engine::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// Suspended; the request is waiting for a decision.
    Escalated(EscalationRequest),
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Completed => exit_codes::SUCCESS,
            RunOutcome::Escalated(request) if request.reason == EscalationReason::BudgetExceeded => {
                exit_codes::BUDGET_EXCEEDED
            }
            RunOutcome::Escalated(_) | RunOutcome::Aborted => exit_codes::FAILURE,
        }
    }
}

pub struct Engine {
    project: String,
    plan: WorkflowPlan,
    policy: PolicyEngine,
    store: CheckpointStore,
    budget: Arc<BudgetGovernor>,
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventLog>,
    artifacts: ArtifactStore,
    escalations: EscalationHandler,
    drift: DriftDetector,
    options: EngineOptions,
    cancel: CancellationToken,
}

impl Engine {
    /// Build an engine for the project described by `config`.
    ///
    /// Every participant named by the phase plan must be registered.
    pub fn new(config: &Config, registry: CollaboratorRegistry) -> Result<Self> {
        config.ensure_directories()?;
        let toml = &config.toml;
        let plan = toml.workflow_plan()?;
        if let Some(missing) = plan
            .participant_ids()
            .into_iter()
            .find(|id| !registry.contains(id))
        {
            return Err(WorkflowError::UnknownParticipant(missing).into());
        }

        let project = config.project_name();
        let ledger = BudgetLedger::load_or_new(
            &config.budget_file,
            toml.budget.project_limit,
            toml.budget.task_limit,
            toml.budget.invocation_limit,
        )?;
        let budget = Arc::new(BudgetGovernor::persistent(&config.budget_file, ledger));
        let events = Arc::new(EventLog::new(&config.events_file, &project));
        let limiter = Arc::new(RateLimiter::new(toml.rate_limit.clone()));
        let dispatcher = Dispatcher::new(registry, limiter, budget.clone(), events.clone())
            .with_transient_retries(toml.workflow.transient_attempts);
        let store = CheckpointStore::open(&config.checkpoint_dir)?.with_state_mirror(&config.state_file);

        Ok(Self {
            policy: PolicyEngine::new(toml.approval.clone(), toml.conflicts.clone()),
            plan,
            store,
            budget,
            dispatcher: Arc::new(dispatcher),
            events,
            artifacts: ArtifactStore::new(&config.phases_dir),
            escalations: EscalationHandler::new(&config.escalation_dir),
            drift: DriftDetector::new(&config.project_dir, toml.drift.tracked.clone()),
            options: EngineOptions::from_config(toml),
            cancel: CancellationToken::new(),
            project,
        })
    }

    /// Build an engine whose participants are the `[agents]` commands.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = CollaboratorRegistry::new();
        for (id, agent) in &config.toml.agents {
            let collaborator = CommandCollaborator::new(id, &agent.command, &config.project_dir)
                .with_args(agent.args.iter().cloned());
            let channel = agent.channel.as_deref().unwrap_or(id);
            registry = registry.register_on(Arc::new(collaborator), channel, agent.backup.as_deref());
        }
        Self::new(config, registry)
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn plan(&self) -> &WorkflowPlan {
        &self.plan
    }

    pub fn budget(&self) -> &BudgetGovernor {
        &self.budget
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn escalations(&self) -> &EscalationHandler {
        &self.escalations
    }

    fn emit(&self, event: WorkflowEvent) -> Result<()> {
        self.events.append(event)
    }

    /// The latest committed state, if a workflow has been started.
    pub fn status(&self) -> Result<Option<WorkflowState>> {
        Ok(self.store.load_latest()?.map(|c| c.state))
    }

    /// Start a workflow: capture the drift baseline and commit the initial state.
    pub fn start(&self) -> Result<WorkflowState> {
        if let Some(latest) = self.store.load_latest()? {
            return Err(WorkflowError::AlreadyStarted {
                sequence: latest.sequence,
            }
            .into());
        }
        let baseline = self.drift.capture()?;
        let tracked_files = baseline.files.len();
        let state = WorkflowState::new(&self.project).with_baseline(baseline);
        let sequence = self.store.commit(&state)?;
        self.emit(WorkflowEvent::WorkflowStarted { tracked_files })?;
        info!(project = %self.project, sequence, tracked_files, "Workflow started");
        Ok(state)
    }

    /// Drive the workflow from the latest checkpoint until it completes,
    /// aborts or suspends on an escalation.
    pub async fn run(&self) -> Result<RunOutcome> {
        let mut state = match self.store.load_latest()? {
            Some(checkpoint) => {
                info!(sequence = checkpoint.sequence, phase = %checkpoint.phase, "Resuming from checkpoint");
                checkpoint.state
            }
            None => self.start()?,
        };

        loop {
            match state.status {
                WorkflowStatus::Completed => return Ok(RunOutcome::Completed),
                WorkflowStatus::Aborted => return Ok(RunOutcome::Aborted),
                WorkflowStatus::Escalated => {
                    let request = state
                        .pending_escalation
                        .as_ref()
                        .map(|p| p.request.clone())
                        .ok_or_else(|| {
                            WorkflowError::InvalidState("escalated without a pending request".to_string())
                        })?;
                    match self.next_decision(&state, &request).await? {
                        Some(decision) => state = self.apply_decision(state, &decision)?,
                        None => return Ok(RunOutcome::Escalated(request)),
                    }
                }
                WorkflowStatus::Running => {
                    if self.cancel.is_cancelled() {
                        bail!("Workflow interrupted");
                    }
                    state = self.step(state).await?;
                }
            }
        }
    }

    /// Submit a decision for the pending escalation and continue the run.
    pub async fn resume(&self, decision: ResumeDecision) -> Result<RunOutcome> {
        self.submit_decision(&decision)?;
        self.run().await
    }

    /// Record a decision for the pending escalation without running.
    ///
    /// The next [`Engine::run`] consumes it.
    pub fn submit_decision(&self, decision: &ResumeDecision) -> Result<()> {
        let state = self.status()?.ok_or(WorkflowError::NotStarted)?;
        if state.consumed_decisions.contains(&decision.request_id) {
            return Err(WorkflowError::DecisionAlreadyConsumed(decision.request_id.to_string()).into());
        }
        let Some(pending) = state.pending_escalation.as_ref() else {
            return Err(WorkflowError::NotEscalated.into());
        };
        if pending.request.id != decision.request_id {
            return Err(WorkflowError::DecisionMismatch {
                expected: pending.request.id.to_string(),
                got: decision.request_id.to_string(),
            }
            .into());
        }
        self.escalations.submit(decision)?;
        info!(id = %decision.request_id, action = decision.action.name(), "Decision recorded");
        Ok(())
    }

    /// Re-point the workflow at the most recent snapshot taken at `phase` and
    /// re-enter that phase.
    pub fn rollback(&self, phase: Phase) -> Result<WorkflowState> {
        if phase.is_terminal() {
            return Err(WorkflowError::InvalidState(format!("cannot roll back to {}", phase)).into());
        }
        let target = self.store.rollback_to_phase(phase)?;
        let mut state = transition::rollback(target.state);
        state.baseline = Some(self.drift.capture()?);
        self.store.commit(&state)?;
        self.emit(WorkflowEvent::Rollback {
            phase,
            sequence: target.sequence,
        })?;
        Ok(state)
    }

    async fn next_decision(
        &self,
        state: &WorkflowState,
        request: &EscalationRequest,
    ) -> Result<Option<ResumeDecision>> {
        let id = request.id;
        if !self.escalations.exists(id) {
            self.escalations.raise(request)?;
        }
        if self.escalations.is_consumed(id) && !state.consumed_decisions.contains(&id) {
            warn!(%id, "Applying a decision consumed before it was committed");
            return self.escalations.load_consumed(id).map(Some);
        }
        if let Some(decision) = self.escalations.take(id)? {
            return Ok(Some(decision));
        }
        if !self.options.wait_for_decisions {
            return Ok(None);
        }

        info!(%id, reason = %request.reason, "Waiting for escalation decision");
        tokio::select! {
            decision = self.escalations.wait(id, self.options.decision_poll) => decision.map(Some),
            _ = self.cancel.cancelled() => bail!("Workflow interrupted while waiting for a decision"),
        }
    }

    fn apply_decision(&self, state: WorkflowState, decision: &ResumeDecision) -> Result<WorkflowState> {
        let phase = state.current_phase;
        let mut next = transition::resume(state, decision)?;
        if next.status == WorkflowStatus::Running {
            next.baseline = Some(self.drift.capture()?);
        }
        self.store.commit(&next)?;
        self.emit(WorkflowEvent::Resumed {
            phase,
            request_id: decision.request_id,
            action: decision.action.name().to_string(),
        })?;
        if let ResumeAction::Abort { reason } = &decision.action {
            self.emit(WorkflowEvent::Aborted {
                phase,
                reason: reason.clone(),
            })?;
            warn!(%phase, reason = %reason, "Workflow aborted");
        } else {
            info!(%phase, action = decision.action.name(), "Workflow resumed");
        }
        Ok(next)
    }

    async fn step(&self, state: WorkflowState) -> Result<WorkflowState> {
        let phase = state.current_phase;
        let Some(spec) = self.plan.get(phase).cloned() else {
            let mut state = state;
            state.status = WorkflowStatus::Completed;
            state.touch();
            self.store.commit(&state)?;
            return Ok(state);
        };

        let state = transition::begin_attempt(state);
        self.store.commit(&state)?;
        let iteration = state.current().iteration;
        self.emit(WorkflowEvent::PhaseStarted { phase, iteration })?;
        info!(%phase, iteration, "Phase started");

        let outcome = self
            .execute(&state, &spec)
            .instrument(info_span!("phase", phase = %phase, iteration))
            .await?;
        if self.cancel.is_cancelled() {
            bail!("Workflow interrupted");
        }

        let route = transition::decide_route(&state.current(), &spec, &outcome);
        let state = transition::record_outcome(state, &outcome);
        match route {
            Route::Continue => self.complete_phase(state),
            Route::Retry { cause, guidance } => {
                let state = transition::retry(state, cause, guidance);
                self.store.commit(&state)?;
                let iteration = state.current().iteration;
                self.emit(WorkflowEvent::Retry {
                    phase,
                    iteration,
                    cause,
                })?;
                info!(%phase, iteration, ?cause, "Retrying phase");
                Ok(state)
            }
            Route::Escalate { reason, message } => {
                let details = self.escalation_details(reason, message, &outcome)?;
                self.suspend(state, reason, details)
            }
        }
    }

    /// Check drift at the phase boundary, then enter the next phase.
    fn complete_phase(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        let phase = state.current_phase;
        if let Some(baseline) = &state.baseline {
            let report = self.drift.check(baseline)?;
            if !report.is_empty() {
                let policy = self.options.drift_policy;
                self.emit(WorkflowEvent::Drift {
                    phase,
                    policy,
                    report: report.clone(),
                })?;
                match policy {
                    DriftPolicy::Block => {
                        let details = EscalationDetails {
                            message: format!("Tracked context changed: {}", report),
                            drift: Some(report),
                            ..Default::default()
                        };
                        return self.suspend(state, EscalationReason::ContextDrift, details);
                    }
                    DriftPolicy::Warn => {
                        warn!(%phase, %report, "Context drift detected");
                        state.baseline = Some(self.drift.capture()?);
                    }
                }
            }
        }

        let state = transition::advance(state);
        let sequence = self.store.commit(&state)?;
        self.emit(WorkflowEvent::Transition {
            from: phase,
            to: state.current_phase,
            sequence,
        })?;
        info!(from = %phase, to = %state.current_phase, "Phase completed");

        if state.status == WorkflowStatus::Completed {
            let total_spent = self.budget.project_spent()?;
            self.emit(WorkflowEvent::Completed { total_spent })?;
            info!(total_spent, "Workflow completed");
        }
        Ok(state)
    }

    fn escalation_details(
        &self,
        reason: EscalationReason,
        message: String,
        outcome: &StepOutcome,
    ) -> Result<EscalationDetails> {
        let mut details = EscalationDetails {
            message,
            ..Default::default()
        };
        match outcome {
            StepOutcome::Reviewed { decision, .. } => {
                details.conflicts = decision.conflicts.clone();
                details.blocking_issues = decision.unresolved_blocking_issues.clone();
            }
            StepOutcome::Implemented { result } => {
                details.questions = result.questions.clone();
            }
            _ => {}
        }
        if reason == EscalationReason::BudgetExceeded {
            details.ledger = Some(self.budget.snapshot()?);
        }
        Ok(details)
    }

    /// Commit the escalated state, then publish the request.
    fn suspend(
        &self,
        state: WorkflowState,
        reason: EscalationReason,
        details: EscalationDetails,
    ) -> Result<WorkflowState> {
        let phase = state.current_phase;
        let request = EscalationRequest::new(&self.project, phase, reason, details)
            .with_attempts(state.attempts_for(phase));
        let state = transition::escalate(state, request.clone());
        self.store.commit(&state)?;
        self.escalations.raise(&request)?;
        self.emit(WorkflowEvent::Escalated {
            phase,
            request_id: request.id,
            reason,
        })?;
        warn!(%phase, id = %request.id, %reason, "Workflow escalated");
        Ok(state)
    }

    async fn execute(&self, state: &WorkflowState, spec: &PhaseSpec) -> Result<StepOutcome> {
        if spec.is_review_phase() {
            return self.review(state, spec).await;
        }
        if let Some(participant) = &spec.implementer {
            let timeout = self.timeout_for(spec, state);
            return self
                .implement(state, participant, Role::for_phase(spec.phase), timeout)
                .await;
        }
        self.write_completion(state)?;
        Ok(StepOutcome::Passed)
    }

    fn timeout_for(&self, spec: &PhaseSpec, state: &WorkflowState) -> Duration {
        if state.current().timeout_extended {
            spec.timeout * self.options.timeout_extension_factor
        } else {
            spec.timeout
        }
    }

    /// Reserve budget for `count` invocations. A refusal is returned as the
    /// failure message; ledger errors propagate.
    fn reserve(&self, phase: Phase, count: usize) -> Result<Result<Vec<Reservation>, String>> {
        match self.budget.reserve_cohort(phase.name(), count) {
            Ok(reservations) => Ok(Ok(reservations)),
            Err(e) if e.is_exceeded() => Ok(Err(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn request(
        &self,
        state: &WorkflowState,
        participant: &str,
        role: Role,
        timeout: Duration,
        ceiling: f64,
    ) -> InvocationRequest {
        InvocationRequest {
            project: self.project.clone(),
            phase: state.current_phase,
            attempt: state.current().iteration,
            role,
            participant: participant.to_string(),
            brief: TaskBrief {
                guidance: state.guidance.clone(),
                artifacts: self.brief_artifacts(state.current_phase),
            },
            timeout_secs: timeout.as_secs().max(1),
            budget_ceiling: ceiling,
        }
    }

    /// Latest plan and result artifacts, looking at `phase` first and then
    /// back through earlier phases.
    fn brief_artifacts(&self, phase: Phase) -> Vec<PathBuf> {
        let mut searched: Vec<Phase> = Phase::ALL.iter().copied().filter(|p| *p < phase).collect();
        searched.push(phase);
        searched.reverse();
        ["plan.json", "result.json"]
            .iter()
            .filter_map(|name| searched.iter().find_map(|p| self.artifacts.latest(*p, name)))
            .collect()
    }

    /// Run a planner or implementer once.
    async fn implement(
        &self,
        state: &WorkflowState,
        participant: &str,
        role: Role,
        timeout: Duration,
    ) -> Result<StepOutcome> {
        let phase = state.current_phase;
        let iteration = state.current().iteration;
        let reservation = match self.reserve(phase, 1)? {
            Ok(reservations) => reservations
                .into_iter()
                .next()
                .context("Budget ledger returned no reservation")?,
            Err(message) => {
                return Ok(StepOutcome::Failed {
                    kind: ErrorKind::BudgetExceeded,
                    message,
                });
            }
        };

        let request = self.request(state, participant, role, timeout, reservation.amount);
        let dispatched = tokio::select! {
            result = self.dispatcher.invoke(request, reservation.clone(), move |raw| {
                parse_implementation(role, &raw.stdout)
            }) => result,
            _ = self.cancel.cancelled() => {
                self.budget.release(&reservation)?;
                bail!("Workflow interrupted");
            }
        };

        match dispatched {
            Ok(dispatched) => {
                let result = dispatched.value;
                self.artifacts.write_json(phase, iteration, "result.json", &result)?;
                if let Some(plan) = &result.plan {
                    self.artifacts.write_json(phase, iteration, "plan.json", plan)?;
                }
                self.emit(WorkflowEvent::ParticipantCompleted {
                    phase,
                    iteration,
                    participant: participant.to_string(),
                    approved: None,
                    score: None,
                })?;
                Ok(StepOutcome::Implemented { result })
            }
            Err(failure) => {
                self.emit(WorkflowEvent::ParticipantFailed {
                    phase,
                    iteration,
                    participant: participant.to_string(),
                    kind: failure.kind(),
                    message: failure.to_string(),
                })?;
                Ok(StepOutcome::Failed {
                    kind: failure.kind(),
                    message: format!("{}: {}", participant, failure),
                })
            }
        }
    }

    /// Fan the reviewers out and evaluate their feedback.
    ///
    /// On a retry the upstream participant repairs its work first, then only
    /// reviewers that were concerned or scored below the policy threshold are
    /// invoked again; the rest of the previous feedback is carried over.
    ///
    /// Malformed reviewer output is handed to the reviewer's backup once,
    /// the same as for the implementer; if the backup fails too the phase
    /// escalates as an agent failure. With no backup the reviewer contributes
    /// ERROR feedback and the policy rejects.
    async fn review(&self, state: &WorkflowState, spec: &PhaseSpec) -> Result<StepOutcome> {
        let phase = spec.phase;
        let record = state.current();
        let iteration = record.iteration;
        let timeout = self.timeout_for(spec, state);

        if matches!(record.retry_cause, Some(RetryCause::Rejected | RetryCause::Resumed))
            && let Some(upstream) = self.plan.upstream_of(phase)
        {
            let role = if phase == Phase::Validating {
                Role::Planner
            } else {
                Role::Implementer
            };
            info!(%phase, participant = upstream, "Re-running upstream participant");
            match self.implement(state, upstream, role, timeout).await? {
                StepOutcome::Implemented { result } if result.is_clean() => {}
                other => return Ok(other),
            }
        }

        let threshold = self.policy.config().threshold_for(spec.policy);
        let mut feedback = Vec::new();
        let mut to_run = Vec::new();
        for reviewer in &spec.reviewers {
            match record.feedback.get(reviewer) {
                Some(previous)
                    if !previous.is_concerned()
                        && threshold.is_none_or(|t| previous.score >= t) =>
                {
                    feedback.push(previous.clone());
                }
                _ => to_run.push(reviewer.clone()),
            }
        }
        if !feedback.is_empty() {
            info!(%phase, carried = feedback.len(), rerun = to_run.len(), "Carrying approving feedback");
        }

        let reservations = if to_run.is_empty() {
            Vec::new()
        } else {
            match self.reserve(phase, to_run.len())? {
                Ok(reservations) => reservations,
                Err(message) => {
                    return Ok(StepOutcome::Failed {
                        kind: ErrorKind::BudgetExceeded,
                        message,
                    });
                }
            }
        };

        let units: Vec<_> = to_run
            .iter()
            .zip(reservations.iter().cloned())
            .map(|(reviewer, reservation)| {
                let dispatcher = self.dispatcher.clone();
                let request = self.request(state, reviewer, Role::Reviewer, timeout, reservation.amount);
                let id = reviewer.clone();
                let has_backup = dispatcher.registry().backup_of(reviewer).is_some();
                let unit = async move {
                    dispatcher
                        .invoke(request, reservation, move |raw| {
                            // Without a backup, garbage becomes ERROR feedback here.
                            match parse_feedback(&id, &raw.stdout) {
                                FeedbackOutcome::ParseError { message, .. } if has_backup => {
                                    Err(message)
                                }
                                outcome => Ok(outcome),
                            }
                        })
                        .await
                };
                (reviewer.clone(), unit)
            })
            .collect();

        let mut fanout = FanOut::new(self.options.max_parallel);
        if let Some(limit) = self.options.phase_timeout {
            fanout = fanout.with_phase_timeout(limit);
        }
        let results = fanout.run(units, &self.cancel).await;

        let mut timed_out = Vec::new();
        let mut failed = Vec::new();
        for ((reviewer, outcome), reservation) in results.into_iter().zip(reservations) {
            let failure = match outcome {
                UnitOutcome::Completed(Ok(dispatched)) => match dispatched.value {
                    FeedbackOutcome::Valid(f) => {
                        self.emit(WorkflowEvent::ParticipantCompleted {
                            phase,
                            iteration,
                            participant: reviewer.clone(),
                            approved: Some(f.approved),
                            score: Some(f.score),
                        })?;
                        feedback.push(f);
                        continue;
                    }
                    invalid @ FeedbackOutcome::ParseError { .. } => {
                        let f = invalid.into_feedback();
                        let message = f.error.clone().unwrap_or_default();
                        feedback.push(f);
                        (ErrorKind::AgentFailure, message)
                    }
                },
                UnitOutcome::Completed(Err(DispatchFailure::Timeout(after))) => {
                    feedback.push(Feedback::error(&reviewer, "timeout"));
                    timed_out.push(reviewer.clone());
                    (ErrorKind::Timeout, format!("timed out after {:?}", after))
                }
                UnitOutcome::Completed(Err(e @ DispatchFailure::AgentFailure(_))) => {
                    feedback.push(Feedback::error(&reviewer, &e.to_string()));
                    failed.push(reviewer.clone());
                    (ErrorKind::AgentFailure, e.to_string())
                }
                UnitOutcome::Cancelled => {
                    self.budget.release(&reservation)?;
                    feedback.push(Feedback::error(&reviewer, "cancelled"));
                    timed_out.push(reviewer.clone());
                    (ErrorKind::Timeout, "cancelled by phase timeout".to_string())
                }
            };
            self.emit(WorkflowEvent::ParticipantFailed {
                phase,
                iteration,
                participant: reviewer,
                kind: failure.0,
                message: failure.1,
            })?;
        }
        feedback.sort_by_key(|f| spec.reviewers.iter().position(|r| *r == f.reviewer));

        let decision = self.policy.evaluate(spec.policy, spec.strategy, &feedback);
        for conflict in &decision.conflicts {
            self.emit(WorkflowEvent::Conflict {
                phase,
                conflict: conflict.clone(),
            })?;
        }
        self.emit(WorkflowEvent::Decision {
            phase,
            iteration,
            approved: decision.approved,
            policy: decision.policy,
            combined_score: decision.combined_score,
            reasoning: decision.reasoning.clone(),
        })?;
        for f in &feedback {
            self.artifacts
                .write_json(phase, iteration, &format!("feedback-{}.json", f.reviewer), f)?;
        }
        self.artifacts.write_json(phase, iteration, "decision.json", &decision)?;
        info!(%phase, approved = decision.approved, score = decision.combined_score, "Review evaluated");

        Ok(StepOutcome::Reviewed {
            decision,
            feedback,
            timed_out,
            failed,
        })
    }

    fn write_completion(&self, state: &WorkflowState) -> Result<()> {
        let mut text = format!("# {} completed\n\n", self.project);
        for (phase, record) in &state.phases {
            text.push_str(&format!(
                "- {}: {} after {} attempt(s)\n",
                phase,
                record.status,
                record.iteration + 1
            ));
        }
        text.push_str(&format!(
            "\nTotal spent: ${:.2}\n",
            self.budget.project_spent()?
        ));
        self.artifacts
            .write_text(state.current_phase, state.current().iteration, "COMPLETION.md", &text)?;
        Ok(())
    }
}
