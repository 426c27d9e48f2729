//! Reviewer feedback records.
//!
//! A `Feedback` is produced once per reviewer per phase attempt and never
//! mutated afterwards; the conflict resolver works on copies. Output from a
//! collaborator is validated at the boundary into a `FeedbackOutcome`, and a
//! `ParseError` flows through the same ERROR path as a timeout.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest valid reviewer score.
pub const MIN_SCORE: f64 = 1.0;
/// Highest valid reviewer score.
pub const MAX_SCORE: f64 = 10.0;

/// Concern severity. Ordering runs from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical concerns block approval under `NO_BLOCKERS`.
    pub fn is_blocking(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!(
                "invalid severity '{}': expected low, medium, high or critical",
                s
            )),
        }
    }
}

/// A single concern raised by a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concern {
    /// Area tag, e.g. "security" or "performance".
    pub area: String,
    pub severity: Severity,
    pub description: String,
}

impl Concern {
    pub fn new(area: &str, severity: Severity, description: &str) -> Self {
        Self {
            area: area.to_lowercase(),
            severity,
            description: description.to_string(),
        }
    }
}

/// One reviewer's verdict on one phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub reviewer: String,
    pub approved: bool,
    /// 1–10 for real feedback, 0 for synthetic ERROR feedback.
    pub score: f64,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    /// Set only on synthetic ERROR feedback (timeout, cancellation, parse error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Feedback {
    pub fn new(reviewer: &str, approved: bool, score: f64) -> Self {
        Self {
            reviewer: reviewer.to_string(),
            approved,
            score,
            concerns: Vec::new(),
            blocking_issues: Vec::new(),
            error: None,
        }
    }

    /// Synthetic ERROR feedback: not approved, score 0, the reason as sole blocking issue.
    pub fn error(reviewer: &str, reason: &str) -> Self {
        Self {
            reviewer: reviewer.to_string(),
            approved: false,
            score: 0.0,
            concerns: Vec::new(),
            blocking_issues: vec![reason.to_string()],
            error: Some(reason.to_string()),
        }
    }

    pub fn with_concern(mut self, area: &str, severity: Severity, description: &str) -> Self {
        self.concerns.push(Concern::new(area, severity, description));
        self
    }

    pub fn with_blocking_issue(mut self, issue: &str) -> Self {
        self.blocking_issues.push(issue.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether this reviewer needs to be invoked again on a retry.
    pub fn is_concerned(&self) -> bool {
        !self.approved || !self.blocking_issues.is_empty() || self.is_error()
    }

    pub fn has_blocking_severity(&self) -> bool {
        self.concerns.iter().any(|c| c.severity.is_blocking())
    }

    /// Highest severity reported for an area, if any.
    pub fn max_severity_in(&self, area: &str) -> Option<Severity> {
        self.concerns
            .iter()
            .filter(|c| c.area == area)
            .map(|c| c.severity)
            .max()
    }

    /// Area of the most severe concern. Ties go to the alphabetically first area.
    pub fn most_severe_area(&self) -> Option<&str> {
        self.concerns
            .iter()
            .max_by(|a, b| a.severity.cmp(&b.severity).then_with(|| b.area.cmp(&a.area)))
            .map(|c| c.area.as_str())
    }

    /// Check the invariants a collaborator's feedback must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.reviewer.trim().is_empty() {
            return Err("reviewer id is empty".to_string());
        }
        if self.is_error() {
            return Ok(());
        }
        if !self.score.is_finite() || self.score < MIN_SCORE || self.score > MAX_SCORE {
            return Err(format!(
                "score {} outside {}..={}",
                self.score, MIN_SCORE, MAX_SCORE
            ));
        }
        if let Some(c) = self.concerns.iter().find(|c| c.area.trim().is_empty()) {
            return Err(format!("concern '{}' has no area", c.description));
        }
        if self.concerns.iter().any(|c| c.description.trim().is_empty()) {
            return Err("concern has an empty description".to_string());
        }
        Ok(())
    }
}

/// Result of validating collaborator output at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Valid(Feedback),
    ParseError { reviewer: String, message: String },
}

impl FeedbackOutcome {
    /// Collapse into a feedback record; parse errors become ERROR feedback.
    pub fn into_feedback(self) -> Feedback {
        match self {
            FeedbackOutcome::Valid(feedback) => feedback,
            FeedbackOutcome::ParseError { reviewer, message } => {
                Feedback::error(&reviewer, &format!("parse error: {}", message))
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, FeedbackOutcome::Valid(_))
    }
}
