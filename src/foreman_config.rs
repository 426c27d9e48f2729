//! `foreman.toml`: the project configuration file.
//!
//! Reads `.foreman/foreman.toml`. Every section has defaults, so a missing or
//! empty file is a valid configuration. Environment overrides are applied on
//! top of the file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "billing-service"
//!
//! [workflow]
//! max_parallel = 4
//! max_retries = 3
//! timeout_secs = 600
//! phase_timeout_secs = 1800
//!
//! [approval]
//! no_blockers_threshold = 6.0
//! all_must_approve_threshold = 7.0
//!
//! [conflicts]
//! strategy = "weighted"
//! score_delta = 3.0
//!
//! [conflicts.expertise.security]
//! security = 2.0
//! architecture = 1.0
//!
//! [phases.verifying]
//! policy = "all_must_approve"
//! max_retries = 2
//!
//! [budget]
//! project_limit = 50.0
//! task_limit = 5.0
//! invocation_limit = 1.0
//!
//! [drift]
//! policy = "block"
//! tracked = ["AGENTS.md", "docs/*.md"]
//!
//! [agents.security]
//! command = "claude-review"
//! args = ["--role", "security"]
//! backup = "security-fallback"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::budget::{BudgetLedger, RateLimitConfig};
use crate::drift::{DEFAULT_TRACKED_PATTERNS, DriftPolicy};
use crate::errors::ConfigError;
use crate::phase::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, Phase, WorkflowPlan};
use crate::review::{ApprovalPolicy, PolicyConfig, ResolutionStrategy, ResolverConfig};

/// Environment variables read by [`ForemanToml::apply_env_overrides`].
pub const ENV_OVERRIDES: &[&str] = &[
    "FOREMAN_PROJECT_BUDGET",
    "FOREMAN_TASK_BUDGET",
    "FOREMAN_INVOCATION_BUDGET",
    "FOREMAN_MAX_RETRIES",
    "FOREMAN_DRIFT_POLICY",
    "FOREMAN_CONFLICT_STRATEGY",
    "FOREMAN_NO_BLOCKERS_THRESHOLD",
    "FOREMAN_ALL_MUST_APPROVE_THRESHOLD",
];

/// Project-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (optional, defaults to directory name)
    #[serde(default)]
    pub name: Option<String>,
}

/// Engine scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Upper bound on concurrent invocations within one fan-out
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-participant timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whole fan-out timeout; pending units are cancelled when it elapses
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Retries after a collaborator reports a transient failure
    #[serde(default = "default_transient_attempts")]
    pub transient_attempts: u32,
    /// Multiplier applied to the timeout on the single timeout retry
    #[serde(default = "default_timeout_extension_factor")]
    pub timeout_extension_factor: u32,
    /// Poll interval while waiting on an escalation decision
    #[serde(default = "default_decision_poll_ms")]
    pub decision_poll_ms: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_transient_attempts() -> u32 {
    2
}

fn default_timeout_extension_factor() -> u32 {
    2
}

fn default_decision_poll_ms() -> u64 {
    1000
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            phase_timeout_secs: default_phase_timeout_secs(),
            transient_attempts: default_transient_attempts(),
            timeout_extension_factor: default_timeout_extension_factor(),
            decision_poll_ms: default_decision_poll_ms(),
        }
    }
}

/// Per-phase overrides, keyed by phase name under `[phases.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ApprovalPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Cost caps in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_project_limit")]
    pub project_limit: f64,
    #[serde(default = "default_task_limit")]
    pub task_limit: f64,
    #[serde(default = "default_invocation_limit")]
    pub invocation_limit: f64,
}

fn default_project_limit() -> f64 {
    50.0
}

fn default_task_limit() -> f64 {
    5.0
}

fn default_invocation_limit() -> f64 {
    1.0
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            project_limit: default_project_limit(),
            task_limit: default_task_limit(),
            invocation_limit: default_invocation_limit(),
        }
    }
}

impl BudgetConfig {
    /// A fresh ledger with these limits.
    pub fn ledger(&self) -> BudgetLedger {
        BudgetLedger::new(self.project_limit, self.task_limit, self.invocation_limit)
    }
}

/// Context drift settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default)]
    pub policy: DriftPolicy,
    /// Glob patterns relative to the project root
    #[serde(default = "default_tracked")]
    pub tracked: Vec<String>,
}

fn default_tracked() -> Vec<String> {
    DEFAULT_TRACKED_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            policy: DriftPolicy::default(),
            tracked: default_tracked(),
        }
    }
}

/// A collaborator backed by an external command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Rate-limit channel; defaults to the agent id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Agent invoked once when this one fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

impl AgentSection {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Root configuration structure for `foreman.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub approval: PolicyConfig,
    #[serde(default)]
    pub conflicts: ResolverConfig,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseOverride>,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentSection>,
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load configuration from `.foreman/foreman.toml`.
    /// Returns default configuration if file doesn't exist.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// The file `foreman init` writes: defaults plus an agent stub for every
    /// participant of the default plan.
    pub fn starter(project_name: &str) -> Self {
        let mut config = Self::default();
        config.project.name = Some(project_name.to_string());
        for id in WorkflowPlan::default_plan().participant_ids() {
            config.agents.insert(
                id.clone(),
                AgentSection::new("claude").with_args(&["--print", "--role", &id]),
            );
        }
        config
    }

    /// Apply `FOREMAN_*` overrides. `lookup` returns the value of a variable.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FOREMAN_PROJECT_BUDGET") {
            self.budget.project_limit = parse_env("FOREMAN_PROJECT_BUDGET", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_TASK_BUDGET") {
            self.budget.task_limit = parse_env("FOREMAN_TASK_BUDGET", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_INVOCATION_BUDGET") {
            self.budget.invocation_limit = parse_env("FOREMAN_INVOCATION_BUDGET", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_MAX_RETRIES") {
            self.workflow.max_retries = parse_env("FOREMAN_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_DRIFT_POLICY") {
            self.drift.policy = parse_env("FOREMAN_DRIFT_POLICY", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_CONFLICT_STRATEGY") {
            self.conflicts.strategy = parse_env("FOREMAN_CONFLICT_STRATEGY", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_NO_BLOCKERS_THRESHOLD") {
            self.approval.no_blockers_threshold = parse_env("FOREMAN_NO_BLOCKERS_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("FOREMAN_ALL_MUST_APPROVE_THRESHOLD") {
            self.approval.all_must_approve_threshold =
                parse_env("FOREMAN_ALL_MUST_APPROVE_THRESHOLD", &v)?;
        }
        Ok(())
    }

    /// Resolve the phase plan: the default plan with `[workflow]` defaults and
    /// `[phases.<name>]` overrides applied.
    pub fn workflow_plan(&self) -> Result<WorkflowPlan, ConfigError> {
        let mut specs: Vec<_> = WorkflowPlan::default_plan().specs().to_vec();
        for spec in &mut specs {
            spec.max_retries = self.workflow.max_retries;
            spec.timeout = Duration::from_secs(self.workflow.timeout_secs);
            spec.strategy = self.conflicts.strategy;
        }

        for (name, o) in &self.phases {
            let phase: Phase = name.parse()?;
            let spec = specs
                .iter_mut()
                .find(|s| s.phase == phase)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: format!("phases.{}", name),
                    message: "the done phase has no participants".to_string(),
                })?;
            if let Some(reviewers) = &o.reviewers {
                spec.reviewers = reviewers.clone();
            }
            if let Some(implementer) = &o.implementer {
                spec.implementer = Some(implementer.clone());
            }
            if let Some(policy) = o.policy {
                spec.policy = policy;
            }
            if let Some(strategy) = o.strategy {
                spec.strategy = strategy;
            }
            if let Some(max_retries) = o.max_retries {
                spec.max_retries = max_retries;
            }
            if let Some(secs) = o.timeout_secs {
                spec.timeout = Duration::from_secs(secs);
            }
        }
        Ok(WorkflowPlan::new(specs))
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (key, value) in [
            ("approval.no_blockers_threshold", self.approval.no_blockers_threshold),
            (
                "approval.all_must_approve_threshold",
                self.approval.all_must_approve_threshold,
            ),
            ("approval.weighted_threshold", self.approval.weighted_threshold),
        ] {
            if !(0.0..=10.0).contains(&value) {
                warnings.push(format!("{} = {} is outside 0..=10", key, value));
            }
        }
        if self.conflicts.score_delta < 0.0 {
            warnings.push(format!(
                "conflicts.score_delta = {} must not be negative",
                self.conflicts.score_delta
            ));
        }

        for (key, value) in [
            ("budget.project_limit", self.budget.project_limit),
            ("budget.task_limit", self.budget.task_limit),
            ("budget.invocation_limit", self.budget.invocation_limit),
        ] {
            if !value.is_finite() || value < 0.0 {
                warnings.push(format!("{} = {} must be a non-negative amount", key, value));
            }
        }

        if self.rate_limit.capacity == 0 {
            warnings.push("rate_limit.capacity must be at least 1".to_string());
        }
        if self.rate_limit.refill_per_sec <= 0.0 {
            warnings.push("rate_limit.refill_per_sec must be positive".to_string());
        }
        if self.workflow.max_parallel == 0 {
            warnings.push("workflow.max_parallel must be at least 1".to_string());
        }

        match self.workflow_plan() {
            Ok(plan) => {
                for id in plan.participant_ids() {
                    if !self.agents.contains_key(&id) {
                        warnings.push(format!("Participant '{}' has no [agents.{}] entry", id, id));
                    }
                }
            }
            Err(e) => warnings.push(e.to_string()),
        }

        for (id, agent) in &self.agents {
            if agent.command.trim().is_empty() {
                warnings.push(format!("agents.{}.command is empty", id));
            }
            if let Some(backup) = &agent.backup
                && !self.agents.contains_key(backup)
            {
                warnings.push(format!(
                    "agents.{}.backup references unknown agent '{}'",
                    id, backup
                ));
            }
        }

        for pattern in &self.drift.tracked {
            if let Err(e) = glob::Pattern::new(pattern) {
                warnings.push(format!("Invalid drift pattern '{}': {}", pattern, e));
            }
        }

        warnings
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}
