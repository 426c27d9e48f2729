//! Phase definitions for the foreman workflow.
//!
//! This module provides:
//! - `Phase`, the ordinal stage enum (`Planning` = 1 through `Done` = 6)
//! - `PhaseStatus`, the per-phase lifecycle status
//! - `PhaseSpec`, the participants, policy, retry ceiling and timeout of one phase
//! - `WorkflowPlan`, the ordered set of specs the engine drives

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::review::conflict::ResolutionStrategy;
use crate::review::policy::ApprovalPolicy;

/// Default retry ceiling for every phase.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-participant timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// A named stage of the workflow. Ordering follows the ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Validating,
    Implementing,
    Verifying,
    Completing,
    Done,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Planning,
        Phase::Validating,
        Phase::Implementing,
        Phase::Verifying,
        Phase::Completing,
        Phase::Done,
    ];

    /// 1-based ordinal.
    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Planning => 1,
            Phase::Validating => 2,
            Phase::Implementing => 3,
            Phase::Verifying => 4,
            Phase::Completing => 5,
            Phase::Done => 6,
        }
    }

    pub fn from_ordinal(n: u8) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|p| p.ordinal() == n)
    }

    /// The phase that follows this one, or `None` for `Done`.
    pub fn next(self) -> Option<Phase> {
        Phase::from_ordinal(self.ordinal() + 1)
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Validating => "validating",
            Phase::Implementing => "implementing",
            Phase::Verifying => "verifying",
            Phase::Completing => "completing",
            Phase::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Phase {
    type Err = ConfigError;

    /// Accepts a phase name (case-insensitive) or its ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<u8>() {
            return Phase::from_ordinal(n).ok_or_else(|| ConfigError::UnknownPhase(s.to_string()));
        }
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ConfigError::UnknownPhase(s.to_string()))
    }
}

/// Lifecycle status of a single phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    NeedsRevision,
    Blocked,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::NeedsRevision => write!(f, "needs_revision"),
            PhaseStatus::Blocked => write!(f, "blocked"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a phase runs and how its outcome is judged.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub phase: Phase,
    /// Reviewer ids fanned out concurrently.
    pub reviewers: Vec<String>,
    /// The single implementer for this phase, if any.
    pub implementer: Option<String>,
    pub policy: ApprovalPolicy,
    pub strategy: ResolutionStrategy,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl PhaseSpec {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            reviewers: Vec::new(),
            implementer: None,
            policy: ApprovalPolicy::default(),
            strategy: ResolutionStrategy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_reviewers<I, S>(mut self, reviewers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reviewers = reviewers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_implementer(mut self, id: &str) -> Self {
        self.implementer = Some(id.to_string());
        self
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether this phase is judged by reviewer feedback.
    pub fn is_review_phase(&self) -> bool {
        !self.reviewers.is_empty()
    }

    /// Every participant id this phase may invoke directly.
    pub fn participants(&self) -> Vec<&str> {
        self.implementer
            .iter()
            .map(String::as_str)
            .chain(self.reviewers.iter().map(String::as_str))
            .collect()
    }
}

/// The ordered phase specs driven by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowPlan {
    specs: Vec<PhaseSpec>,
}

impl WorkflowPlan {
    /// Build a plan from specs. Missing phases get an empty spec.
    pub fn new(specs: Vec<PhaseSpec>) -> Self {
        let mut ordered = Vec::with_capacity(5);
        for phase in Phase::ALL.iter().copied().filter(|p| !p.is_terminal()) {
            let spec = specs
                .iter()
                .find(|s| s.phase == phase)
                .cloned()
                .unwrap_or_else(|| PhaseSpec::new(phase));
            ordered.push(spec);
        }
        Self { specs: ordered }
    }

    /// Planner, two reviewers, implementer, two verifiers, completion.
    pub fn default_plan() -> Self {
        Self::new(vec![
            PhaseSpec::new(Phase::Planning).with_implementer("planner"),
            PhaseSpec::new(Phase::Validating)
                .with_reviewers(["security", "architecture"])
                .with_policy(ApprovalPolicy::NoBlockers),
            PhaseSpec::new(Phase::Implementing).with_implementer("implementer"),
            PhaseSpec::new(Phase::Verifying)
                .with_reviewers(["security", "architecture"])
                .with_policy(ApprovalPolicy::AllMustApprove),
            PhaseSpec::new(Phase::Completing),
        ])
    }

    /// Spec for a phase. `Done` has no spec.
    pub fn get(&self, phase: Phase) -> Option<&PhaseSpec> {
        self.specs.iter().find(|s| s.phase == phase)
    }

    pub fn specs(&self) -> &[PhaseSpec] {
        &self.specs
    }

    /// The participant that repairs upstream work when a review phase retries.
    pub fn upstream_of(&self, phase: Phase) -> Option<&str> {
        let upstream = match phase {
            Phase::Validating => Phase::Planning,
            Phase::Verifying => Phase::Implementing,
            _ => return None,
        };
        self.get(upstream).and_then(|s| s.implementer.as_deref())
    }

    /// All participant ids referenced anywhere in the plan.
    pub fn participant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .specs
            .iter()
            .flat_map(|s| s.participants())
            .map(str::to_string)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl Default for WorkflowPlan {
    fn default() -> Self {
        Self::default_plan()
    }
}
