//! External collaborator boundary.
//!
//! A collaborator is anything that turns an [`InvocationRequest`] into raw
//! output: a planner, an implementer or a reviewer. The engine never trusts
//! that output directly; [`parse`] validates it into feedback or an
//! implementation result.
//!
//! - [`command`]: collaborators backed by an external process
//! - [`parse`]: boundary validation of collaborator output

pub mod command;
pub mod parse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::phase::Phase;

pub use command::CommandCollaborator;
pub use parse::{ImplementationResult, ImplementationStatus};

/// What a participant is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Implementer,
    Reviewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Planner => write!(f, "planner"),
            Role::Implementer => write!(f, "implementer"),
            Role::Reviewer => write!(f, "reviewer"),
        }
    }
}

impl Role {
    /// The role a participant plays in a given phase.
    pub fn for_phase(phase: Phase) -> Role {
        match phase {
            Phase::Planning => Role::Planner,
            Phase::Validating | Phase::Verifying => Role::Reviewer,
            _ => Role::Implementer,
        }
    }
}

/// Task-scoped context handed to a collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBrief {
    /// Accumulated guidance: blocking issues from earlier attempts,
    /// clarification answers, override instructions.
    #[serde(default)]
    pub guidance: Vec<String>,
    /// Artifacts produced earlier in the workflow.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

/// A single call to a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub project: String,
    pub phase: Phase,
    pub attempt: u32,
    pub role: Role,
    pub participant: String,
    pub brief: TaskBrief,
    pub timeout_secs: u64,
    /// Maximum cost, in USD, this invocation may incur.
    pub budget_ceiling: f64,
}

impl InvocationRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Unvalidated collaborator output.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub stdout: String,
    pub cost_usd: Option<f64>,
}

impl RawOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            cost_usd: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_usd = Some(cost);
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvocationError {
    /// Worth retrying: network or process hiccup, rate limiting.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The collaborator crashed or exited unsuccessfully.
    #[error("collaborator failed: {0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Something that can perform planning, implementation or review.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn id(&self) -> &str;

    async fn invoke(&self, request: &InvocationRequest) -> Result<RawOutput, InvocationError>;
}

/// A registered collaborator with its rate-limit channel and backup.
#[derive(Clone)]
pub struct Participant {
    pub collaborator: Arc<dyn Collaborator>,
    pub channel: String,
    pub backup: Option<String>,
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.collaborator.id())
            .field("channel", &self.channel)
            .field("backup", &self.backup)
            .finish()
    }
}

/// Collaborators by participant id.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorRegistry {
    participants: BTreeMap<String, Participant>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collaborator on a channel named after its id.
    pub fn register(self, collaborator: Arc<dyn Collaborator>) -> Self {
        let channel = collaborator.id().to_string();
        self.register_on(collaborator, &channel, None)
    }

    pub fn register_on(
        mut self,
        collaborator: Arc<dyn Collaborator>,
        channel: &str,
        backup: Option<&str>,
    ) -> Self {
        let id = collaborator.id().to_string();
        self.participants.insert(
            id,
            Participant {
                collaborator,
                channel: channel.to_string(),
                backup: backup.map(str::to_string),
            },
        );
        self
    }

    /// Name `backup` as the fallback for `id`.
    pub fn with_backup(mut self, id: &str, backup: &str) -> Self {
        if let Some(p) = self.participants.get_mut(id) {
            p.backup = Some(backup.to_string());
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// The backup participant for `id`, when one is configured and registered.
    pub fn backup_of(&self, id: &str) -> Option<&Participant> {
        self.participants
            .get(id)
            .and_then(|p| p.backup.as_deref())
            .filter(|b| *b != id)
            .and_then(|b| self.participants.get(b))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.participants.keys().map(String::as_str).collect()
    }
}
