//! Approval policy engine.
//!
//! `PolicyEngine::evaluate` is a pure function of the feedback set, the policy,
//! the conflict strategy and the engine's configuration. Conflicts are resolved
//! first and the accepted positions replace the raw disagreement before the
//! policy is applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::review::conflict::{
    Conflict, ConflictEscalation, ConflictResolver, ResolutionStrategy, ResolverConfig,
};
use crate::review::feedback::Feedback;

pub const DEFAULT_NO_BLOCKERS_THRESHOLD: f64 = 6.0;
pub const DEFAULT_ALL_MUST_APPROVE_THRESHOLD: f64 = 7.0;
pub const DEFAULT_WEIGHTED_THRESHOLD: f64 = 7.0;

const SCORE_EPSILON: f64 = 1e-9;

/// Rule set that decides pass/fail for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// No blocking issue, no high/critical concern, combined score at or above threshold.
    #[default]
    NoBlockers,
    /// Every reviewer approves with a score at or above threshold and nothing blocks.
    AllMustApprove,
    /// Weighted average at or above threshold; blocking issues still veto.
    WeightedScore,
    /// At least half the reviewers (rounded up) approve.
    Majority,
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalPolicy::NoBlockers => write!(f, "no_blockers"),
            ApprovalPolicy::AllMustApprove => write!(f, "all_must_approve"),
            ApprovalPolicy::WeightedScore => write!(f, "weighted_score"),
            ApprovalPolicy::Majority => write!(f, "majority"),
        }
    }
}

impl std::str::FromStr for ApprovalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "no_blockers" => Ok(ApprovalPolicy::NoBlockers),
            "all_must_approve" => Ok(ApprovalPolicy::AllMustApprove),
            "weighted_score" => Ok(ApprovalPolicy::WeightedScore),
            "majority" => Ok(ApprovalPolicy::Majority),
            _ => Err(format!(
                "invalid approval policy '{}'. Valid values: no_blockers, all_must_approve, weighted_score, majority",
                s
            )),
        }
    }
}

/// Thresholds and weights used by the policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_no_blockers_threshold")]
    pub no_blockers_threshold: f64,
    #[serde(default = "default_all_must_approve_threshold")]
    pub all_must_approve_threshold: f64,
    #[serde(default = "default_weighted_threshold")]
    pub weighted_threshold: f64,
    /// Per-reviewer weights. Missing reviewers weigh 1.0; empty means arithmetic mean.
    #[serde(default)]
    pub reviewer_weights: BTreeMap<String, f64>,
}

fn default_no_blockers_threshold() -> f64 {
    DEFAULT_NO_BLOCKERS_THRESHOLD
}

fn default_all_must_approve_threshold() -> f64 {
    DEFAULT_ALL_MUST_APPROVE_THRESHOLD
}

fn default_weighted_threshold() -> f64 {
    DEFAULT_WEIGHTED_THRESHOLD
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            no_blockers_threshold: default_no_blockers_threshold(),
            all_must_approve_threshold: default_all_must_approve_threshold(),
            weighted_threshold: default_weighted_threshold(),
            reviewer_weights: BTreeMap::new(),
        }
    }
}

impl PolicyConfig {
    pub fn threshold_for(&self, policy: ApprovalPolicy) -> Option<f64> {
        match policy {
            ApprovalPolicy::NoBlockers => Some(self.no_blockers_threshold),
            ApprovalPolicy::AllMustApprove => Some(self.all_must_approve_threshold),
            ApprovalPolicy::WeightedScore => Some(self.weighted_threshold),
            ApprovalPolicy::Majority => None,
        }
    }

    /// Weighted mean when weights are configured, arithmetic mean otherwise.
    pub fn combined_score(&self, feedback: &[Feedback]) -> f64 {
        if feedback.is_empty() {
            return 0.0;
        }
        if self.reviewer_weights.is_empty() {
            return feedback.iter().map(|f| f.score).sum::<f64>() / feedback.len() as f64;
        }
        let (sum, total) = feedback.iter().fold((0.0, 0.0), |(sum, total), f| {
            let w = self.reviewer_weights.get(&f.reviewer).copied().unwrap_or(1.0);
            (sum + f.score * w, total + w)
        });
        if total <= 0.0 { 0.0 } else { sum / total }
    }
}

/// Outcome of evaluating a feedback set. Always recomputed, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub policy: ApprovalPolicy,
    pub combined_score: f64,
    pub reasoning: String,
    pub unresolved_blocking_issues: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Set when conflict resolution could not settle the set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<ConflictEscalation>,
}

impl ApprovalDecision {
    pub fn requires_escalation(&self) -> bool {
        self.escalation.is_some()
    }
}

/// Evaluates feedback sets against approval policies.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
    resolver: ConflictResolver,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig, resolver: ResolverConfig) -> Self {
        Self {
            config,
            resolver: ConflictResolver::new(resolver),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PolicyConfig::default(), ResolverConfig::default())
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn evaluate(
        &self,
        policy: ApprovalPolicy,
        strategy: ResolutionStrategy,
        feedback: &[Feedback],
    ) -> ApprovalDecision {
        if feedback.is_empty() {
            return ApprovalDecision {
                approved: false,
                policy,
                combined_score: 0.0,
                reasoning: "no feedback collected".to_string(),
                unresolved_blocking_issues: Vec::new(),
                conflicts: Vec::new(),
                escalation: None,
            };
        }

        let resolution = self.resolver.resolve(strategy, feedback);
        let evaluated = &resolution.feedback;
        let combined_score = self.config.combined_score(evaluated);

        let mut unresolved: Vec<String> = Vec::new();
        for issue in evaluated.iter().flat_map(|f| &f.blocking_issues) {
            if !unresolved.contains(issue) {
                unresolved.push(issue.clone());
            }
        }

        let mut failures: Vec<String> = Vec::new();
        let errored: Vec<&str> = evaluated
            .iter()
            .filter(|f| f.is_error())
            .map(|f| f.reviewer.as_str())
            .collect();
        if !errored.is_empty() {
            failures.push(format!("errored reviewers: {}", errored.join(", ")));
        }

        let meets = |threshold: f64| combined_score + SCORE_EPSILON >= threshold;

        match policy {
            ApprovalPolicy::NoBlockers => {
                let threshold = self.config.no_blockers_threshold;
                if !unresolved.is_empty() {
                    failures.push(format!("{} blocking issue(s)", unresolved.len()));
                }
                let severe: Vec<&str> = evaluated
                    .iter()
                    .filter(|f| f.has_blocking_severity())
                    .map(|f| f.reviewer.as_str())
                    .collect();
                if !severe.is_empty() {
                    failures.push(format!("high/critical concerns from {}", severe.join(", ")));
                }
                if !meets(threshold) {
                    failures.push(format!(
                        "combined score {:.2} below {:.2}",
                        combined_score, threshold
                    ));
                }
            }
            ApprovalPolicy::AllMustApprove => {
                let threshold = self.config.all_must_approve_threshold;
                let dissent: Vec<&str> = evaluated
                    .iter()
                    .filter(|f| !f.approved)
                    .map(|f| f.reviewer.as_str())
                    .collect();
                if !dissent.is_empty() {
                    failures.push(format!("not approved by {}", dissent.join(", ")));
                }
                let low: Vec<String> = evaluated
                    .iter()
                    .filter(|f| f.score + SCORE_EPSILON < threshold)
                    .map(|f| format!("{} ({:.1})", f.reviewer, f.score))
                    .collect();
                if !low.is_empty() {
                    failures.push(format!("scores below {:.2}: {}", threshold, low.join(", ")));
                }
                if !unresolved.is_empty() {
                    failures.push(format!("{} blocking issue(s)", unresolved.len()));
                }
            }
            ApprovalPolicy::WeightedScore => {
                let threshold = self.config.weighted_threshold;
                if !meets(threshold) {
                    failures.push(format!(
                        "weighted score {:.2} below {:.2}",
                        combined_score, threshold
                    ));
                }
                if !unresolved.is_empty() {
                    failures.push(format!("{} blocking issue(s)", unresolved.len()));
                }
            }
            ApprovalPolicy::Majority => {
                let needed = evaluated.len().div_ceil(2);
                let approvals = evaluated.iter().filter(|f| f.approved).count();
                if approvals < needed {
                    failures.push(format!("{} of {} approved, need {}", approvals, evaluated.len(), needed));
                }
            }
        }

        let approved = failures.is_empty() && resolution.escalation.is_none();

        let mut reasoning = if approved {
            format!("{}: approved with combined score {:.2}", policy, combined_score)
        } else {
            format!("{}: {}", policy, failures.join("; "))
        };
        if let Some(esc) = &resolution.escalation {
            reasoning.push_str(&format!("; unresolved conflict: {}", esc.summary));
        }
        if !resolution.overruled_issues.is_empty() {
            reasoning.push_str(&format!(
                "; overruled by conflict resolution: {}",
                resolution.overruled_issues.join(", ")
            ));
        }

        ApprovalDecision {
            approved,
            policy,
            combined_score,
            reasoning,
            unresolved_blocking_issues: unresolved,
            conflicts: resolution.conflicts,
            escalation: resolution.escalation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::feedback::Severity;
    use proptest::prelude::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::with_defaults()
    }

    fn eval(policy: ApprovalPolicy, feedback: &[Feedback]) -> ApprovalDecision {
        engine().evaluate(policy, ResolutionStrategy::Conservative, feedback)
    }

    #[test]
    fn test_empty_feedback_is_not_approved() {
        let d = eval(ApprovalPolicy::Majority, &[]);
        assert!(!d.approved);
        assert_eq!(d.reasoning, "no feedback collected");
    }

    #[test]
    fn test_no_blockers_threshold_boundary() {
        let pass = eval(
            ApprovalPolicy::NoBlockers,
            &[Feedback::new("a", true, 6.0), Feedback::new("b", true, 6.0)],
        );
        assert!(pass.approved);

        let fail = eval(
            ApprovalPolicy::NoBlockers,
            &[Feedback::new("a", true, 5.9), Feedback::new("b", true, 5.9)],
        );
        assert!(!fail.approved);
        assert!(fail.reasoning.contains("below"));
    }

    #[test]
    fn test_no_blockers_vetoed_by_high_concern() {
        let d = eval(
            ApprovalPolicy::NoBlockers,
            &[Feedback::new("a", true, 9.0).with_concern("perf", Severity::High, "n+1")],
        );
        assert!(!d.approved);
        assert!(d.reasoning.contains("high/critical"));
    }

    #[test]
    fn test_all_must_approve_single_dissent_vetoes() {
        let d = eval(
            ApprovalPolicy::AllMustApprove,
            &[Feedback::new("a", true, 9.0), Feedback::new("b", false, 9.0)],
        );
        assert!(!d.approved);
    }

    #[test]
    fn test_all_must_approve_sql_injection_scenario() {
        let d = eval(
            ApprovalPolicy::AllMustApprove,
            &[
                Feedback::new("security", true, 8.0),
                Feedback::new("architecture", false, 4.0).with_blocking_issue("sql injection"),
            ],
        );
        assert!(!d.approved);
        assert!(!d.requires_escalation());
        assert_eq!(d.unresolved_blocking_issues, vec!["sql injection"]);
    }

    #[test]
    fn test_all_must_approve_score_threshold() {
        let d = eval(
            ApprovalPolicy::AllMustApprove,
            &[Feedback::new("a", true, 9.0), Feedback::new("b", true, 6.5)],
        );
        assert!(!d.approved);
        assert!(d.reasoning.contains("b (6.5)"));
    }

    #[test]
    fn test_weighted_score_uses_reviewer_weights() {
        let mut config = PolicyConfig::default();
        config.reviewer_weights.insert("cursor".to_string(), 0.6);
        config.reviewer_weights.insert("gemini".to_string(), 0.4);
        let engine = PolicyEngine::new(config, ResolverConfig::default());
        let feedback = [Feedback::new("cursor", true, 8.0), Feedback::new("gemini", true, 5.5)];

        let d = engine.evaluate(
            ApprovalPolicy::WeightedScore,
            ResolutionStrategy::Conservative,
            &feedback,
        );
        // 0.6 * 8.0 + 0.4 * 5.5 = 7.0
        assert!((d.combined_score - 7.0).abs() < 1e-9);
        assert!(d.approved);
    }

    #[test]
    fn test_weighted_score_blocking_issue_vetoes() {
        let d = eval(
            ApprovalPolicy::WeightedScore,
            &[Feedback::new("a", true, 9.0).with_blocking_issue("missing migration")],
        );
        assert!(!d.approved);
    }

    #[test]
    fn test_majority_rounds_up() {
        let d = eval(
            ApprovalPolicy::Majority,
            &[
                Feedback::new("a", true, 8.0),
                Feedback::new("b", true, 8.0),
                Feedback::new("c", true, 7.0),
            ],
        );
        assert!(d.approved);

        // A mismatch resolves conservatively before counting.
        let d = eval(
            ApprovalPolicy::Majority,
            &[Feedback::new("a", true, 8.0), Feedback::new("b", false, 8.0)],
        );
        assert!(!d.approved);

        let d = engine().evaluate(
            ApprovalPolicy::Majority,
            ResolutionStrategy::Escalate,
            &[
                Feedback::new("a", true, 8.0),
                Feedback::new("b", true, 8.0),
                Feedback::new("c", false, 8.0),
            ],
        );
        assert!(!d.approved);
        assert!(d.requires_escalation());
    }

    #[test]
    fn test_error_feedback_always_vetoes() {
        let d = engine().evaluate(
            ApprovalPolicy::Majority,
            ResolutionStrategy::Optimistic,
            &[
                Feedback::new("a", true, 9.0),
                Feedback::new("b", true, 9.0),
                Feedback::error("c", "timeout"),
            ],
        );
        assert!(!d.approved);
        assert!(d.reasoning.contains("errored reviewers: c"));
        assert_eq!(d.unresolved_blocking_issues, vec!["timeout"]);
    }

    #[test]
    fn test_overruled_issues_listed_in_reasoning() {
        let d = engine().evaluate(
            ApprovalPolicy::NoBlockers,
            ResolutionStrategy::Optimistic,
            &[
                Feedback::new("a", true, 8.0),
                Feedback::new("b", false, 7.0).with_blocking_issue("rename module"),
            ],
        );
        assert!(d.approved);
        assert!(d.reasoning.contains("overruled by conflict resolution: rename module"));
        assert!(d.unresolved_blocking_issues.is_empty());
    }

    #[test]
    fn test_policy_from_str_round_trip() {
        for policy in [
            ApprovalPolicy::NoBlockers,
            ApprovalPolicy::AllMustApprove,
            ApprovalPolicy::WeightedScore,
            ApprovalPolicy::Majority,
        ] {
            assert_eq!(policy.to_string().parse::<ApprovalPolicy>().unwrap(), policy);
        }
    }

    proptest! {
        #[test]
        fn prop_no_blockers_follows_threshold(scores in proptest::collection::vec(1.0f64..=10.0, 1..6)) {
            let feedback: Vec<Feedback> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| Feedback::new(&format!("r{}", i), true, *s))
                .collect();
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            let d = engine().evaluate(ApprovalPolicy::NoBlockers, ResolutionStrategy::Conservative, &feedback);
            prop_assert_eq!(d.approved, mean + 1e-9 >= DEFAULT_NO_BLOCKERS_THRESHOLD);
        }

        #[test]
        fn prop_evaluation_is_deterministic(
            approvals in proptest::collection::vec(any::<bool>(), 1..5),
            scores in proptest::collection::vec(1.0f64..=10.0, 5),
        ) {
            let feedback: Vec<Feedback> = approvals
                .iter()
                .enumerate()
                .map(|(i, a)| Feedback::new(&format!("r{}", i), *a, scores[i]))
                .collect();
            let first = engine().evaluate(ApprovalPolicy::Majority, ResolutionStrategy::Weighted, &feedback);
            let second = engine().evaluate(ApprovalPolicy::Majority, ResolutionStrategy::Weighted, &feedback);
            prop_assert_eq!(first, second);
        }
    }
}
