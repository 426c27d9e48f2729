//! Escalation requests and resume decisions.
//!
//! When the engine cannot proceed on its own it commits an escalated state
//! and writes an [`EscalationRequest`] to `.foreman/escalations/<id>.json`.
//! An external actor answers with a [`ResumeDecision`] written next to it as
//! `<id>.decision.json`. Taking the decision renames it to
//! `<id>.consumed.json`, so a decision is applied at most once even with
//! several processes watching the same directory.
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::escalation::{EscalationHandler, ResumeAction, ResumeDecision};
//! use std::path::Path;
//!
//! let handler = EscalationHandler::new(Path::new(".foreman/escalations"));
//! for request in handler.pending().unwrap() {
//!     let decision = ResumeDecision::new(
//!         request.id,
//!         ResumeAction::Answers { answers: vec!["Use PostgreSQL".to_string()] },
//!     );
//!     handler.submit(&decision).unwrap();
//! }
//! ```

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::budget::LedgerSnapshot;
use crate::checkpoint::write_atomic;
use crate::drift::DriftReport;
use crate::errors::ErrorKind;
use crate::phase::Phase;
use crate::review::{Conflict, Severity};

/// Why the workflow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    RetriesExhausted,
    ConflictUnresolved,
    SecurityConflict,
    SpecMismatch,
    ClarificationNeeded,
    BudgetExceeded,
    Timeout,
    AgentFailure,
    ContextDrift,
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscalationReason::RetriesExhausted => "retries_exhausted",
            EscalationReason::ConflictUnresolved => "conflict_unresolved",
            EscalationReason::SecurityConflict => "security_conflict",
            EscalationReason::SpecMismatch => "spec_mismatch",
            EscalationReason::ClarificationNeeded => "clarification_needed",
            EscalationReason::BudgetExceeded => "budget_exceeded",
            EscalationReason::Timeout => "timeout",
            EscalationReason::AgentFailure => "agent_failure",
            EscalationReason::ContextDrift => "context_drift",
        };
        write!(f, "{}", s)
    }
}

impl EscalationReason {
    pub fn options(self) -> Vec<EscalationOption> {
        use EscalationOption::*;
        match self {
            EscalationReason::BudgetExceeded => vec![RaiseBudget, Abort],
            _ => vec![ProvideAnswers, Override, Abort],
        }
    }

    pub fn recommended(self) -> EscalationOption {
        match self {
            EscalationReason::BudgetExceeded => EscalationOption::RaiseBudget,
            EscalationReason::ClarificationNeeded
            | EscalationReason::SpecMismatch
            | EscalationReason::SecurityConflict => EscalationOption::ProvideAnswers,
            _ => EscalationOption::Override,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            EscalationReason::SecurityConflict => Severity::Critical,
            EscalationReason::BudgetExceeded
            | EscalationReason::SpecMismatch
            | EscalationReason::RetriesExhausted
            | EscalationReason::AgentFailure => Severity::High,
            EscalationReason::ConflictUnresolved
            | EscalationReason::ClarificationNeeded
            | EscalationReason::Timeout
            | EscalationReason::ContextDrift => Severity::Medium,
        }
    }

    /// The error taxonomy entry this escalation is recorded under.
    pub fn error_kind(self) -> ErrorKind {
        match self {
            EscalationReason::RetriesExhausted
            | EscalationReason::ConflictUnresolved
            | EscalationReason::SecurityConflict => ErrorKind::ReviewConflict,
            EscalationReason::SpecMismatch | EscalationReason::ClarificationNeeded => {
                ErrorKind::SpecMismatch
            }
            EscalationReason::BudgetExceeded => ErrorKind::BudgetExceeded,
            EscalationReason::Timeout => ErrorKind::Timeout,
            EscalationReason::AgentFailure => ErrorKind::AgentFailure,
            EscalationReason::ContextDrift => ErrorKind::ContextDrift,
        }
    }
}

/// What an external actor may do about an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOption {
    ProvideAnswers,
    Override,
    RaiseBudget,
    Abort,
}

impl fmt::Display for EscalationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationOption::ProvideAnswers => write!(f, "provide_answers"),
            EscalationOption::Override => write!(f, "override"),
            EscalationOption::RaiseBudget => write!(f, "raise_budget"),
            EscalationOption::Abort => write!(f, "abort"),
        }
    }
}

/// One attempt at a phase, kept for the escalation's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub phase: Phase,
    pub iteration: u32,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(phase: Phase, iteration: u32, outcome: impl Into<String>) -> Self {
        Self {
            phase,
            iteration,
            outcome: outcome.into(),
            at: Utc::now(),
        }
    }
}

/// Supporting evidence attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationDetails {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: Uuid,
    pub project: String,
    pub phase: Phase,
    pub reason: EscalationReason,
    pub attempts: Vec<AttemptRecord>,
    pub options: Vec<EscalationOption>,
    pub recommended: EscalationOption,
    pub severity: Severity,
    pub details: EscalationDetails,
    pub created_at: DateTime<Utc>,
}

impl EscalationRequest {
    pub fn new(project: &str, phase: Phase, reason: EscalationReason, details: EscalationDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.to_string(),
            phase,
            reason,
            attempts: Vec::new(),
            options: reason.options(),
            recommended: reason.recommended(),
            severity: reason.severity(),
            details,
            created_at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempts: Vec<AttemptRecord>) -> Self {
        self.attempts = attempts;
        self
    }
}

/// The external answer to an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResumeAction {
    /// Clarification answers appended to the next invocation.
    Answers { answers: Vec<String> },
    /// An instruction that overrides the blocking outcome.
    Override { instruction: String },
    Abort { reason: String },
}

impl ResumeAction {
    pub fn name(&self) -> &'static str {
        match self {
            ResumeAction::Answers { .. } => "answers",
            ResumeAction::Override { .. } => "override",
            ResumeAction::Abort { .. } => "abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeDecision {
    pub request_id: Uuid,
    pub action: ResumeAction,
    pub decided_at: DateTime<Utc>,
}

impl ResumeDecision {
    pub fn new(request_id: Uuid, action: ResumeAction) -> Self {
        Self {
            request_id,
            action,
            decided_at: Utc::now(),
        }
    }
}

/// File-backed suspend point for escalations.
#[derive(Debug, Clone)]
pub struct EscalationHandler {
    dir: PathBuf,
}

impl EscalationHandler {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn request_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn decision_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.decision.json", id))
    }

    fn consumed_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.consumed.json", id))
    }

    /// Persist a request. Rewriting an existing request is harmless.
    pub fn raise(&self, request: &EscalationRequest) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.request_path(request.id);
        let json = serde_json::to_vec_pretty(request).context("Failed to serialize escalation")?;
        write_atomic(&path, &json)
            .with_context(|| format!("Failed to write escalation: {}", path.display()))?;
        info!(
            id = %request.id,
            phase = %request.phase,
            reason = %request.reason,
            "Escalation raised"
        );
        Ok(path)
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.request_path(id).exists()
    }

    pub fn load(&self, id: Uuid) -> Result<EscalationRequest> {
        let path = self.request_path(id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read escalation: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse escalation: {}", path.display()))
    }

    pub fn is_consumed(&self, id: Uuid) -> bool {
        self.consumed_path(id).exists()
    }

    /// Requests whose decision has not been consumed, oldest first.
    pub fn pending(&self) -> Result<Vec<EscalationRequest>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut requests = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;
        for entry in entries {
            let path = entry.context("Failed to read escalation entry")?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(stem) else {
                continue;
            };
            if !self.is_consumed(id) {
                requests.push(self.load(id)?);
            }
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }

    /// Record an external decision for a raised request.
    pub fn submit(&self, decision: &ResumeDecision) -> Result<PathBuf> {
        let id = decision.request_id;
        if self.is_consumed(id) {
            bail!("Decision for escalation {} has already been consumed", id);
        }
        if !self.exists(id) {
            bail!("No escalation {} to answer", id);
        }
        let path = self.decision_path(id);
        let json = serde_json::to_vec_pretty(decision).context("Failed to serialize decision")?;
        write_atomic(&path, &json)
            .with_context(|| format!("Failed to write decision: {}", path.display()))?;
        debug!(%id, action = decision.action.name(), "Decision submitted");
        Ok(path)
    }

    /// Consume the decision for `id`, if one has been submitted.
    ///
    /// The rename is the point of consumption: of several concurrent callers
    /// exactly one gets the decision.
    pub fn take(&self, id: Uuid) -> Result<Option<ResumeDecision>> {
        let from = self.decision_path(id);
        let to = self.consumed_path(id);
        match fs::rename(&from, &to) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to consume {}", from.display()));
            }
        }
        let content = fs::read_to_string(&to)
            .with_context(|| format!("Failed to read decision: {}", to.display()))?;
        let decision = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse decision: {}", to.display()))?;
        Ok(Some(decision))
    }

    /// Read back a decision that was already taken.
    ///
    /// Used to finish applying a decision when the process stopped between
    /// consuming it and committing the resumed state.
    pub fn load_consumed(&self, id: Uuid) -> Result<ResumeDecision> {
        let path = self.consumed_path(id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read decision: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse decision: {}", path.display()))
    }

    /// Suspend until a decision for `id` arrives.
    pub async fn wait(&self, id: Uuid, poll: Duration) -> Result<ResumeDecision> {
        loop {
            if let Some(decision) = self.take(id)? {
                return Ok(decision);
            }
            if self.is_consumed(id) {
                bail!("Decision for escalation {} was consumed elsewhere", id);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn request() -> EscalationRequest {
        EscalationRequest::new(
            "demo",
            Phase::Verifying,
            EscalationReason::RetriesExhausted,
            EscalationDetails {
                message: "3 attempts rejected".to_string(),
                blocking_issues: vec!["sql injection".to_string()],
                ..Default::default()
            },
        )
        .with_attempts(vec![AttemptRecord::new(Phase::Verifying, 0, "rejected")])
    }

    #[test]
    fn test_reason_metadata() {
        assert_eq!(
            EscalationReason::BudgetExceeded.recommended(),
            EscalationOption::RaiseBudget
        );
        assert!(EscalationReason::BudgetExceeded
            .options()
            .contains(&EscalationOption::RaiseBudget));
        assert_eq!(EscalationReason::SecurityConflict.severity(), Severity::Critical);
        assert_eq!(EscalationReason::ContextDrift.error_kind(), ErrorKind::ContextDrift);
        for reason in [
            EscalationReason::RetriesExhausted,
            EscalationReason::ClarificationNeeded,
            EscalationReason::Timeout,
        ] {
            assert!(reason.options().contains(&EscalationOption::Abort));
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason));
        }
    }

    #[test]
    fn test_raise_and_load() {
        let dir = tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path());
        let req = request();
        handler.raise(&req).unwrap();

        assert_eq!(handler.load(req.id).unwrap(), req);
        let pending = handler.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, req.id);
    }

    #[test]
    fn test_decision_consumed_exactly_once() {
        let dir = tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path());
        let req = request();
        handler.raise(&req).unwrap();

        assert!(handler.take(req.id).unwrap().is_none());

        let decision = ResumeDecision::new(
            req.id,
            ResumeAction::Override {
                instruction: "accept the risk".to_string(),
            },
        );
        handler.submit(&decision).unwrap();

        assert_eq!(handler.take(req.id).unwrap(), Some(decision.clone()));
        assert!(handler.take(req.id).unwrap().is_none());
        assert!(handler.is_consumed(req.id));
        assert!(handler.pending().unwrap().is_empty());
        assert!(handler.submit(&decision).is_err());
    }

    #[test]
    fn test_submit_requires_request() {
        let dir = tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path());
        let decision = ResumeDecision::new(
            Uuid::new_v4(),
            ResumeAction::Abort {
                reason: "nope".to_string(),
            },
        );
        assert!(handler.submit(&decision).is_err());
    }

    #[test]
    fn test_concurrent_take_has_single_winner() {
        let dir = tempdir().unwrap();
        let handler = Arc::new(EscalationHandler::new(dir.path()));
        let req = request();
        handler.raise(&req).unwrap();
        handler
            .submit(&ResumeDecision::new(
                req.id,
                ResumeAction::Answers {
                    answers: vec!["yes".to_string()],
                },
            ))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&handler);
                let id = req.id;
                std::thread::spawn(move || h.take(id).unwrap().is_some())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_returns_submitted_decision() {
        let dir = tempdir().unwrap();
        let handler = EscalationHandler::new(dir.path());
        let req = request();
        handler.raise(&req).unwrap();

        let submitter = handler.clone();
        let id = req.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            submitter
                .submit(&ResumeDecision::new(
                    id,
                    ResumeAction::Abort {
                        reason: "out of scope".to_string(),
                    },
                ))
                .unwrap();
        });

        let decision = handler.wait(id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(decision.action.name(), "abort");
    }

    #[test]
    fn test_resume_action_wire_format() {
        let action = ResumeAction::Answers {
            answers: vec!["Use PostgreSQL".to_string()],
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "answers");
        assert_eq!(json["answers"][0], "Use PostgreSQL");
    }
}
