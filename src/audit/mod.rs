//! Append-only audit trail for a workflow.
//!
//! Every transition, spend, drift record and escalation is appended to
//! `.foreman/events.jsonl` as one JSON object per line. Phase outputs (plans,
//! feedback, results, decisions) are kept under `.foreman/phases/` by
//! [`artifacts::ArtifactStore`].

pub mod artifacts;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::drift::{DriftPolicy, DriftReport};
use crate::errors::ErrorKind;
use crate::escalation::EscalationReason;
use crate::phase::Phase;
use crate::review::{ApprovalPolicy, Conflict};
use crate::workflow::state::RetryCause;

pub use artifacts::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        tracked_files: usize,
    },
    PhaseStarted {
        phase: Phase,
        iteration: u32,
    },
    ParticipantCompleted {
        phase: Phase,
        iteration: u32,
        participant: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approved: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
    },
    ParticipantFailed {
        phase: Phase,
        iteration: u32,
        participant: String,
        kind: ErrorKind,
        message: String,
    },
    Decision {
        phase: Phase,
        iteration: u32,
        approved: bool,
        policy: ApprovalPolicy,
        combined_score: f64,
        reasoning: String,
    },
    Conflict {
        phase: Phase,
        conflict: Conflict,
    },
    Transition {
        from: Phase,
        to: Phase,
        sequence: u64,
    },
    Retry {
        phase: Phase,
        iteration: u32,
        cause: RetryCause,
    },
    Spend {
        phase: Phase,
        participant: String,
        amount: f64,
        project_spent: f64,
    },
    Drift {
        phase: Phase,
        policy: DriftPolicy,
        report: DriftReport,
    },
    Escalated {
        phase: Phase,
        request_id: Uuid,
        reason: EscalationReason,
    },
    Resumed {
        phase: Phase,
        request_id: Uuid,
        action: String,
    },
    Rollback {
        phase: Phase,
        sequence: u64,
    },
    Aborted {
        phase: Phase,
        reason: String,
    },
    Completed {
        total_spent: f64,
    },
}

impl WorkflowEvent {
    /// Whether this event concerns `phase`.
    pub fn involves(&self, phase: Phase) -> bool {
        match self {
            WorkflowEvent::WorkflowStarted { .. } | WorkflowEvent::Completed { .. } => false,
            WorkflowEvent::Transition { from, to, .. } => *from == phase || *to == phase,
            WorkflowEvent::PhaseStarted { phase: p, .. }
            | WorkflowEvent::ParticipantCompleted { phase: p, .. }
            | WorkflowEvent::ParticipantFailed { phase: p, .. }
            | WorkflowEvent::Decision { phase: p, .. }
            | WorkflowEvent::Conflict { phase: p, .. }
            | WorkflowEvent::Retry { phase: p, .. }
            | WorkflowEvent::Spend { phase: p, .. }
            | WorkflowEvent::Drift { phase: p, .. }
            | WorkflowEvent::Escalated { phase: p, .. }
            | WorkflowEvent::Resumed { phase: p, .. }
            | WorkflowEvent::Rollback { phase: p, .. }
            | WorkflowEvent::Aborted { phase: p, .. } => *p == phase,
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub project: String,
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

/// Append-only JSON-lines event log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    project: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: &Path, project: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            project: project.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: WorkflowEvent) -> Result<()> {
        let record = EventRecord {
            at: Utc::now(),
            project: self.project.clone(),
            event,
        };
        let mut line = serde_json::to_string(&record).context("Failed to serialize event")?;
        line.push('\n');

        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Event log lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open event log: {}", self.path.display()))?
            .write_all(line.as_bytes())
            .context("Failed to append event")?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read event log: {}", self.path.display()))?;
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse event log line {}", i + 1))
            })
            .collect()
    }

    pub fn for_phase(&self, phase: Phase) -> Result<Vec<EventRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.event.involves(phase))
            .collect())
    }
}
