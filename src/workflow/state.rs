//! The persisted workflow document.
//!
//! `WorkflowState` is what the checkpoint store snapshots. It is only ever
//! changed through the pure transitions in [`super::transition`] and only
//! made authoritative by a commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::agent::ImplementationResult;
use crate::drift::ContextBaseline;
use crate::errors::ErrorKind;
use crate::escalation::{AttemptRecord, EscalationRequest};
use crate::phase::{Phase, PhaseStatus};
use crate::review::{ApprovalDecision, Feedback};

/// Overall lifecycle of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Escalated,
    Aborted,
    Completed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Escalated => write!(f, "escalated"),
            WorkflowStatus::Aborted => write!(f, "aborted"),
            WorkflowStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A failure observed during the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub iteration: u32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Why the current phase is being re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCause {
    /// The phase outcome was rejected.
    Rejected,
    /// A participant timed out; the timeout is extended once.
    Timeout,
    /// An escalation was answered.
    Resumed,
}

/// Everything recorded about one phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    /// Attempt counter; starts at 0 and only increases.
    pub iteration: u32,
    /// Iteration at which the current retry window started.
    #[serde(default)]
    pub retry_floor: u32,
    #[serde(default)]
    pub timeout_extended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_cause: Option<RetryCause>,
    /// Latest feedback per reviewer.
    #[serde(default)]
    pub feedback: BTreeMap<String, Feedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ImplementationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    /// Retries used in the current window.
    pub fn retries_used(&self) -> u32 {
        self.iteration.saturating_sub(self.retry_floor)
    }
}

/// The escalation the workflow is suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub request: EscalationRequest,
}

/// The whole workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub project: String,
    pub current_phase: Phase,
    pub status: WorkflowStatus,
    pub phases: BTreeMap<Phase, PhaseRecord>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<ContextBaseline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_escalation: Option<PendingEscalation>,
    #[serde(default)]
    pub consumed_decisions: Vec<Uuid>,
    /// Guidance for the next invocation of the current phase.
    #[serde(default)]
    pub guidance: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(project: &str) -> Self {
        let now = Utc::now();
        let mut phases = BTreeMap::new();
        phases.insert(Phase::Planning, PhaseRecord::default());
        Self {
            project: project.to_string(),
            current_phase: Phase::Planning,
            status: WorkflowStatus::Running,
            phases,
            errors: Vec::new(),
            attempts: Vec::new(),
            baseline: None,
            pending_escalation: None,
            consumed_decisions: Vec::new(),
            guidance: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_baseline(mut self, baseline: ContextBaseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Record of the current phase.
    pub fn current(&self) -> PhaseRecord {
        self.record(self.current_phase)
    }

    pub fn record(&self, phase: Phase) -> PhaseRecord {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn record_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        self.phases.entry(phase).or_default()
    }

    pub fn push_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let phase = self.current_phase;
        let iteration = self.record(phase).iteration;
        self.errors.push(ErrorRecord {
            at: Utc::now(),
            phase,
            iteration,
            kind,
            message: message.into(),
        });
    }

    pub fn push_attempt(&mut self, outcome: impl Into<String>) {
        let phase = self.current_phase;
        let iteration = self.record(phase).iteration;
        self.attempts.push(AttemptRecord::new(phase, iteration, outcome));
    }

    pub fn attempts_for(&self, phase: Phase) -> Vec<AttemptRecord> {
        self.attempts
            .iter()
            .filter(|a| a.phase == phase)
            .cloned()
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Aborted
        )
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_planning() {
        let state = WorkflowState::new("demo");
        assert_eq!(state.current_phase, Phase::Planning);
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.current().iteration, 0);
        assert_eq!(state.current().status, PhaseStatus::Pending);
    }

    #[test]
    fn test_state_json_round_trip() {
        let mut state = WorkflowState::new("demo");
        state.record_mut(Phase::Planning).status = PhaseStatus::Completed;
        state.current_phase = Phase::Validating;
        state
            .record_mut(Phase::Validating)
            .feedback
            .insert("security".to_string(), Feedback::new("security", true, 8.0));
        state.push_error(ErrorKind::Timeout, "architecture timed out");
        state.push_attempt("rejected");

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"validating\""));
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_errors_and_attempts_tagged_with_phase() {
        let mut state = WorkflowState::new("demo");
        state.current_phase = Phase::Verifying;
        state.record_mut(Phase::Verifying).iteration = 2;
        state.push_error(ErrorKind::AgentFailure, "crashed");
        state.push_attempt("agent failure");

        assert_eq!(state.errors[0].phase, Phase::Verifying);
        assert_eq!(state.errors[0].iteration, 2);
        assert_eq!(state.attempts_for(Phase::Verifying).len(), 1);
        assert!(state.attempts_for(Phase::Planning).is_empty());
    }

    #[test]
    fn test_retries_used_respects_floor() {
        let record = PhaseRecord {
            iteration: 5,
            retry_floor: 4,
            ..Default::default()
        };
        assert_eq!(record.retries_used(), 1);
    }
}
