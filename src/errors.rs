//! Typed error hierarchy for the foreman engine.
//!
//! Four top-level enums cover the subsystems that can fail on their own:
//! - `WorkflowError`: state machine misuse and resume failures
//! - `CheckpointError`: snapshot persistence and corruption
//! - `BudgetError`: admission and ledger failures
//! - `ConfigError`: invalid `foreman.toml` values or environment overrides
//!
//! `ErrorKind` is the failure taxonomy recorded in workflow state and used for
//! routing. `exit_code_for_error` maps any error chain onto the CLI exit codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// CLI exit codes.
pub mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const INVALID_STATE: u8 = 2;
    pub const BUDGET_EXCEEDED: u8 = 3;
}

/// Failure taxonomy. Every recorded error carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or process hiccup; retried with backoff.
    Transient,
    /// Collaborator crashed or returned garbage.
    AgentFailure,
    /// Reviewers disagree and the strategy could not settle it.
    ReviewConflict,
    /// Input contradicts expectations; never reinterpreted automatically.
    SpecMismatch,
    /// A ledger scope refused admission.
    BudgetExceeded,
    /// A participant or the whole phase ran out of time.
    Timeout,
    /// A tracked context file changed mid-workflow.
    ContextDrift,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::AgentFailure => "agent_failure",
            ErrorKind::ReviewConflict => "review_conflict",
            ErrorKind::SpecMismatch => "spec_mismatch",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContextDrift => "context_drift",
        };
        write!(f, "{}", s)
    }
}

/// Errors from the workflow state machine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("No workflow has been started in this project")]
    NotStarted,

    #[error("A workflow is already in progress (checkpoint {sequence})")]
    AlreadyStarted { sequence: u64 },

    #[error("Workflow is not waiting on an escalation")]
    NotEscalated,

    #[error("Decision {got} does not answer pending escalation {expected}")]
    DecisionMismatch { expected: String, got: String },

    #[error("Decision {0} has already been consumed")]
    DecisionAlreadyConsumed(String),

    #[error("Invalid workflow state: {0}")]
    InvalidState(String),

    #[error("Participant '{0}' is not registered")]
    UnknownParticipant(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Checkpoint format version {found} is not supported (expected {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Checkpoint {0} not found")]
    NotFound(u64),

    #[error("No checkpoint recorded for phase {0}")]
    NoSnapshotAtPhase(String),

    #[error("Phase regression from {from} to {to} outside of an explicit rollback")]
    PhaseRegression { from: String, to: String },

    #[error("Checkpoint lock poisoned")]
    LockPoisoned,

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl CheckpointError {
    /// Whether this error means the persisted state cannot be trusted.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            CheckpointError::Corrupt { .. }
                | CheckpointError::UnsupportedVersion { .. }
                | CheckpointError::PhaseRegression { .. }
        )
    }
}

/// Errors from the budget ledger.
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("Budget exceeded for {scope}: requested {requested:.2}, remaining {remaining:.2}")]
    Exceeded {
        scope: String,
        requested: f64,
        remaining: f64,
    },

    #[error("Project budget is halted until the limit is raised")]
    Halted,

    #[error("Invalid amount {0}: amounts must be finite and non-negative")]
    InvalidAmount(f64),

    #[error("New limit {limit:.2} for {scope} is below amount already spent ({spent:.2})")]
    LimitBelowSpent {
        scope: String,
        limit: f64,
        spent: f64,
    },

    #[error("Unknown budget scope '{0}'")]
    UnknownScope(String),

    #[error("Budget ledger lock poisoned")]
    LockPoisoned,

    #[error("Budget ledger persistence failed: {0}")]
    Persist(#[source] anyhow::Error),
}

impl BudgetError {
    /// Whether this is an admission refusal rather than an operational failure.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, BudgetError::Exceeded { .. } | BudgetError::Halted)
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),
}

/// Map an error chain to the CLI exit code.
pub fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<CheckpointError>()
            && e.is_invalid_state()
        {
            return exit_codes::INVALID_STATE;
        }
        if let Some(e) = cause.downcast_ref::<BudgetError>()
            && e.is_exceeded()
        {
            return exit_codes::BUDGET_EXCEEDED;
        }
        if let Some(e) = cause.downcast_ref::<WorkflowError>() {
            match e {
                WorkflowError::InvalidState(_) => return exit_codes::INVALID_STATE,
                WorkflowError::Checkpoint(inner) if inner.is_invalid_state() => {
                    return exit_codes::INVALID_STATE;
                }
                WorkflowError::Budget(inner) if inner.is_exceeded() => {
                    return exit_codes::BUDGET_EXCEEDED;
                }
                _ => {}
            }
        }
    }
    exit_codes::FAILURE
}
