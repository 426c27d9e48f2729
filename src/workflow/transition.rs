//! Pure state transitions and routing.
//!
//! Every function here takes a [`WorkflowState`] by value and returns the next
//! one. Nothing is persisted; the engine commits the result before any side
//! effect that depends on it.

use chrono::Utc;

use super::state::{PendingEscalation, PhaseRecord, RetryCause, WorkflowState, WorkflowStatus};
use crate::agent::{ImplementationResult, ImplementationStatus};
use crate::errors::{ErrorKind, WorkflowError};
use crate::escalation::{EscalationReason, EscalationRequest, ResumeAction, ResumeDecision};
use crate::phase::{PhaseSpec, PhaseStatus};
use crate::review::{ApprovalDecision, Feedback, Severity};

/// What one attempt of a phase produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A phase with no participants ran to completion.
    Passed,
    /// Reviewers were fanned out and their feedback evaluated.
    Reviewed {
        decision: ApprovalDecision,
        feedback: Vec<Feedback>,
        /// Reviewers that timed out or were cancelled.
        timed_out: Vec<String>,
        /// Reviewers whose collaborator (and backup) failed.
        failed: Vec<String>,
    },
    /// The planner or implementer returned a validated result.
    Implemented { result: ImplementationResult },
    /// The attempt could not produce a result.
    Failed { kind: ErrorKind, message: String },
}

/// Where the workflow goes after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Continue,
    Retry {
        cause: RetryCause,
        guidance: Vec<String>,
    },
    Escalate {
        reason: EscalationReason,
        message: String,
    },
}

/// Decide the route for an attempt of `spec.phase` whose record is `record`.
pub fn decide_route(record: &PhaseRecord, spec: &PhaseSpec, outcome: &StepOutcome) -> Route {
    let escalate = |reason: EscalationReason, message: String| Route::Escalate { reason, message };

    match outcome {
        StepOutcome::Failed { kind, message } => match kind {
            ErrorKind::BudgetExceeded => escalate(EscalationReason::BudgetExceeded, message.clone()),
            ErrorKind::Timeout => timeout_route(record, message.clone()),
            ErrorKind::SpecMismatch => escalate(EscalationReason::SpecMismatch, message.clone()),
            ErrorKind::ContextDrift => escalate(EscalationReason::ContextDrift, message.clone()),
            ErrorKind::ReviewConflict => {
                escalate(EscalationReason::ConflictUnresolved, message.clone())
            }
            ErrorKind::Transient | ErrorKind::AgentFailure => {
                escalate(EscalationReason::AgentFailure, message.clone())
            }
        },
        StepOutcome::Reviewed {
            decision,
            feedback,
            timed_out,
            failed,
        } => {
            if !failed.is_empty() {
                return escalate(
                    EscalationReason::AgentFailure,
                    format!("Reviewer(s) failed: {}", failed.join(", ")),
                );
            }
            if !timed_out.is_empty() {
                return timeout_route(
                    record,
                    format!("Reviewer(s) timed out: {}", timed_out.join(", ")),
                );
            }
            if let Some(conflict) = &decision.escalation {
                let reason = if conflict.security {
                    EscalationReason::SecurityConflict
                } else {
                    EscalationReason::ConflictUnresolved
                };
                return escalate(reason, conflict.summary.clone());
            }
            if decision.approved {
                return Route::Continue;
            }
            retry_or_exhaust(record, spec, review_guidance(decision, feedback), &decision.reasoning)
        }
        StepOutcome::Implemented { result } => match result.status {
            ImplementationStatus::Blocked => escalate(
                EscalationReason::SpecMismatch,
                result
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Implementer reported blocked".to_string()),
            ),
            ImplementationStatus::NeedsClarification => escalate(
                EscalationReason::ClarificationNeeded,
                format!("Clarification needed: {}", result.questions.join("; ")),
            ),
            ImplementationStatus::Completed if result.is_clean() => Route::Continue,
            ImplementationStatus::Completed => retry_or_exhaust(
                record,
                spec,
                implementation_guidance(result),
                &format!("{} test(s) failing", result.tests_failed),
            ),
        },
        StepOutcome::Passed => Route::Continue,
    }
}

fn timeout_route(record: &PhaseRecord, message: String) -> Route {
    if record.timeout_extended {
        Route::Escalate {
            reason: EscalationReason::Timeout,
            message,
        }
    } else {
        Route::Retry {
            cause: RetryCause::Timeout,
            guidance: Vec::new(),
        }
    }
}

fn retry_or_exhaust(
    record: &PhaseRecord,
    spec: &PhaseSpec,
    guidance: Vec<String>,
    reasoning: &str,
) -> Route {
    if record.retries_used() < spec.max_retries {
        Route::Retry {
            cause: RetryCause::Rejected,
            guidance,
        }
    } else {
        Route::Escalate {
            reason: EscalationReason::RetriesExhausted,
            message: format!(
                "{} rejected after {} retries: {}",
                spec.phase,
                record.retries_used(),
                reasoning
            ),
        }
    }
}

/// Guidance for the upstream participant after a rejected review.
pub fn review_guidance(decision: &ApprovalDecision, feedback: &[Feedback]) -> Vec<String> {
    let mut lines: Vec<String> = decision
        .unresolved_blocking_issues
        .iter()
        .map(|issue| format!("Blocking issue: {}", issue))
        .collect();
    for f in feedback.iter().filter(|f| !f.is_error()) {
        for c in f.concerns.iter().filter(|c| c.severity >= Severity::Medium) {
            lines.push(format!(
                "Concern from {} ({}, {}): {}",
                f.reviewer, c.area, c.severity, c.description
            ));
        }
    }
    if lines.is_empty() {
        lines.push(format!("Review rejected: {}", decision.reasoning));
    }
    lines
}

fn implementation_guidance(result: &ImplementationResult) -> Vec<String> {
    let mut lines = vec![format!(
        "Failing tests: {} failed, {} passed",
        result.tests_failed, result.tests_passed
    )];
    if let Some(summary) = &result.summary {
        lines.push(format!("Previous attempt: {}", summary));
    }
    lines
}

/// Mark the current phase as in progress.
pub fn begin_attempt(mut state: WorkflowState) -> WorkflowState {
    let record = state.record_mut(state.current_phase);
    record.status = PhaseStatus::InProgress;
    if record.started_at.is_none() {
        record.started_at = Some(Utc::now());
    }
    state.touch();
    state
}

/// Store what the attempt produced on the current phase record.
pub fn record_outcome(mut state: WorkflowState, outcome: &StepOutcome) -> WorkflowState {
    let summary = match outcome {
        StepOutcome::Passed => "passed".to_string(),
        StepOutcome::Reviewed {
            decision,
            feedback,
            timed_out,
            ..
        } => {
            let record = state.record_mut(state.current_phase);
            for f in feedback {
                record.feedback.insert(f.reviewer.clone(), f.clone());
            }
            record.decision = Some(decision.clone());
            for id in timed_out {
                state.push_error(ErrorKind::Timeout, format!("{} timed out", id));
            }
            if decision.approved {
                format!("approved (score {:.2})", decision.combined_score)
            } else {
                format!("rejected: {}", decision.reasoning)
            }
        }
        StepOutcome::Implemented { result } => {
            state.record_mut(state.current_phase).result = Some(result.clone());
            match result.status {
                ImplementationStatus::Completed => format!(
                    "completed ({} passed, {} failed)",
                    result.tests_passed, result.tests_failed
                ),
                status => status.to_string(),
            }
        }
        StepOutcome::Failed { kind, message } => {
            state.push_error(*kind, message.clone());
            format!("{}: {}", kind, message)
        }
    };
    state.push_attempt(summary);
    state.touch();
    state
}

/// Complete the current phase and enter the next one.
///
/// Leaving `Completing` finishes the workflow.
pub fn advance(mut state: WorkflowState) -> WorkflowState {
    let now = Utc::now();
    let record = state.record_mut(state.current_phase);
    record.status = PhaseStatus::Completed;
    record.completed_at = Some(now);
    state.guidance.clear();

    match state.current_phase.next() {
        Some(next) => {
            state.current_phase = next;
            state.phases.insert(next, PhaseRecord::default());
            if next.is_terminal() {
                let done = state.record_mut(next);
                done.status = PhaseStatus::Completed;
                done.started_at = Some(now);
                done.completed_at = Some(now);
                state.status = WorkflowStatus::Completed;
            }
        }
        None => state.status = WorkflowStatus::Completed,
    }
    state.touch();
    state
}

/// Re-enter the current phase.
///
/// A timeout retry extends the participant timeout once and does not use up
/// a rejection retry.
pub fn retry(mut state: WorkflowState, cause: RetryCause, guidance: Vec<String>) -> WorkflowState {
    let record = state.record_mut(state.current_phase);
    record.iteration += 1;
    record.status = PhaseStatus::NeedsRevision;
    record.retry_cause = Some(cause);
    if cause == RetryCause::Timeout {
        record.timeout_extended = true;
        record.retry_floor += 1;
    }
    for line in guidance {
        if !state.guidance.contains(&line) {
            state.guidance.push(line);
        }
    }
    state.touch();
    state
}

/// Suspend on `request`.
pub fn escalate(mut state: WorkflowState, request: EscalationRequest) -> WorkflowState {
    state.record_mut(state.current_phase).status = PhaseStatus::Blocked;
    state.push_error(request.reason.error_kind(), request.details.message.clone());
    state.status = WorkflowStatus::Escalated;
    state.pending_escalation = Some(PendingEscalation { request });
    state.touch();
    state
}

/// Apply an external decision to an escalated workflow.
///
/// The decision must answer the pending request and must not have been
/// applied before. Answers and overrides re-enter the phase with a fresh
/// retry window; abort ends the workflow.
pub fn resume(
    mut state: WorkflowState,
    decision: &ResumeDecision,
) -> Result<WorkflowState, WorkflowError> {
    if state.consumed_decisions.contains(&decision.request_id) {
        return Err(WorkflowError::DecisionAlreadyConsumed(
            decision.request_id.to_string(),
        ));
    }
    if state.status != WorkflowStatus::Escalated {
        return Err(WorkflowError::NotEscalated);
    }
    let pending = state
        .pending_escalation
        .as_ref()
        .ok_or_else(|| WorkflowError::InvalidState("escalated without a pending request".to_string()))?;
    if pending.request.id != decision.request_id {
        return Err(WorkflowError::DecisionMismatch {
            expected: pending.request.id.to_string(),
            got: decision.request_id.to_string(),
        });
    }

    state.consumed_decisions.push(decision.request_id);
    state.pending_escalation = None;

    match &decision.action {
        ResumeAction::Abort { reason } => return Ok(abort(state, reason)),
        ResumeAction::Answers { answers } => {
            for answer in answers {
                state.guidance.push(format!("Clarification: {}", answer));
            }
        }
        ResumeAction::Override { instruction } => {
            state.guidance.push(format!("Override: {}", instruction));
        }
    }

    let record = state.record_mut(state.current_phase);
    record.iteration += 1;
    record.retry_floor = record.iteration;
    record.timeout_extended = false;
    record.retry_cause = Some(RetryCause::Resumed);
    record.status = PhaseStatus::NeedsRevision;
    state.status = WorkflowStatus::Running;
    state.push_attempt(format!("resumed ({})", decision.action.name()));
    state.touch();
    Ok(state)
}

/// End the workflow.
pub fn abort(mut state: WorkflowState, reason: &str) -> WorkflowState {
    state.record_mut(state.current_phase).status = PhaseStatus::Failed;
    state.pending_escalation = None;
    state.status = WorkflowStatus::Aborted;
    state.push_attempt(format!("aborted: {}", reason));
    state.touch();
    state
}

/// Re-base a rolled-back snapshot so the phase runs again from scratch.
pub fn rollback(mut state: WorkflowState) -> WorkflowState {
    state.status = WorkflowStatus::Running;
    state.pending_escalation = None;
    state.guidance.clear();
    let record = state.record_mut(state.current_phase);
    record.iteration += 1;
    record.retry_floor = record.iteration;
    record.timeout_extended = false;
    record.retry_cause = None;
    record.feedback.clear();
    record.decision = None;
    record.result = None;
    record.status = PhaseStatus::Pending;
    record.completed_at = None;
    state.push_attempt("rolled back");
    state.touch();
    state
}
