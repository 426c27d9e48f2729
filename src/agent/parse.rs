//! Boundary validation of collaborator output.
//!
//! Collaborators print a JSON object on stdout, optionally inside a
//! ```` ```json ```` fence or surrounded by prose. Anything that does not
//! match the expected shape becomes a parse error; nothing is defaulted.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Role;
use crate::review::{Feedback, FeedbackOutcome, Severity};

/// Completion status reported by a planner or implementer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStatus {
    Completed,
    Blocked,
    NeedsClarification,
}

impl fmt::Display for ImplementationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImplementationStatus::Completed => write!(f, "completed"),
            ImplementationStatus::Blocked => write!(f, "blocked"),
            ImplementationStatus::NeedsClarification => write!(f, "needs_clarification"),
        }
    }
}

/// Validated result of a planner or implementer invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationResult {
    pub status: ImplementationStatus,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub tests_passed: u32,
    #[serde(default)]
    pub tests_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Reason given with a `blocked` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Questions asked with a `needs_clarification` status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<String>,
    /// The plan document, planner only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<serde_json::Value>,
}

impl ImplementationResult {
    pub fn completed() -> Self {
        Self {
            status: ImplementationStatus::Completed,
            files_touched: Vec::new(),
            tests_passed: 0,
            tests_failed: 0,
            summary: None,
            reason: None,
            questions: Vec::new(),
            plan: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.status == ImplementationStatus::Completed && self.tests_failed == 0
    }
}

#[derive(Debug, Deserialize)]
struct WireConcern {
    area: String,
    severity: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct WireFeedback {
    approved: bool,
    score: f64,
    #[serde(default)]
    concerns: Vec<WireConcern>,
    #[serde(default)]
    blocking_issues: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireImplementation {
    status: ImplementationStatus,
    files_touched: Option<Vec<String>>,
    tests_passed: Option<u32>,
    tests_failed: Option<u32>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    plan: Option<serde_json::Value>,
}

/// Extract the JSON object from collaborator output.
///
/// A fenced ```` ```json ```` block wins; otherwise the first balanced
/// `{...}` in the text is used. Braces inside string literals are ignored.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + "```json".len()..];
        if let Some(end) = body.find("```") {
            let fenced = body[..end].trim();
            if fenced.starts_with('{') {
                return Some(fenced);
            }
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_object(stdout: &str) -> Result<serde_json::Value, String> {
    let json = extract_json(stdout).ok_or_else(|| "no JSON object found in output".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))
}

/// Validate reviewer output into feedback for `reviewer`.
pub fn parse_feedback(reviewer: &str, stdout: &str) -> FeedbackOutcome {
    let parse_error = |message: String| FeedbackOutcome::ParseError {
        reviewer: reviewer.to_string(),
        message,
    };

    let value = match parse_object(stdout) {
        Ok(v) => v,
        Err(e) => return parse_error(e),
    };
    let wire: WireFeedback = match serde_json::from_value(value) {
        Ok(w) => w,
        Err(e) => return parse_error(format!("feedback does not match schema: {}", e)),
    };

    let mut feedback = Feedback::new(reviewer, wire.approved, wire.score);
    for concern in wire.concerns {
        let severity = match concern.severity.parse::<Severity>() {
            Ok(s) => s,
            Err(e) => return parse_error(e),
        };
        feedback = feedback.with_concern(&concern.area, severity, &concern.description);
    }
    feedback.blocking_issues = wire
        .blocking_issues
        .into_iter()
        .filter(|issue| !issue.trim().is_empty())
        .collect();

    match feedback.validate() {
        Ok(()) => FeedbackOutcome::Valid(feedback),
        Err(e) => parse_error(e),
    }
}

/// Validate planner or implementer output.
///
/// The planner must return `status` and a `plan` object; the implementer
/// must return `status`, `files_touched`, `tests_passed` and `tests_failed`.
pub fn parse_implementation(role: Role, stdout: &str) -> Result<ImplementationResult, String> {
    let value = parse_object(stdout)?;
    let wire: WireImplementation = serde_json::from_value(value)
        .map_err(|e| format!("result does not match schema: {}", e))?;

    match role {
        Role::Planner => {
            if wire.status == ImplementationStatus::Completed
                && !wire.plan.as_ref().is_some_and(|p| p.is_object())
            {
                return Err("planner result is missing a 'plan' object".to_string());
            }
        }
        Role::Implementer => {
            let mut missing = Vec::new();
            if wire.files_touched.is_none() {
                missing.push("files_touched");
            }
            if wire.tests_passed.is_none() {
                missing.push("tests_passed");
            }
            if wire.tests_failed.is_none() {
                missing.push("tests_failed");
            }
            if !missing.is_empty() {
                return Err(format!(
                    "implementation result is missing {}",
                    missing.join(", ")
                ));
            }
        }
        Role::Reviewer => return Err("reviewers do not return implementation results".to_string()),
    }

    if wire.status == ImplementationStatus::NeedsClarification && wire.questions.is_empty() {
        return Err("needs_clarification without any questions".to_string());
    }

    Ok(ImplementationResult {
        status: wire.status,
        files_touched: wire.files_touched.unwrap_or_default(),
        tests_passed: wire.tests_passed.unwrap_or_default(),
        tests_failed: wire.tests_failed.unwrap_or_default(),
        summary: wire.summary,
        reason: wire.reason,
        questions: wire.questions,
        plan: wire.plan,
    })
}

/// The optional `cost_usd` a collaborator reports alongside its result.
pub fn extract_cost(stdout: &str) -> Option<f64> {
    let value = parse_object(stdout).ok()?;
    value
        .get("cost_usd")
        .and_then(|c| c.as_f64())
        .filter(|c| c.is_finite() && *c >= 0.0)
}
