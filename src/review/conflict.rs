//! Conflict resolver for disagreeing reviewers.
//!
//! Three conflict kinds are detected across a feedback set:
//!
//! - **Approval mismatch**: one reviewer approves, another rejects
//! - **Severity disagreement**: two reviewers rate the same concern area differently
//! - **Score divergence**: the score spread reaches the configured delta
//!
//! Each detected conflict is settled by a `ResolutionStrategy`. Resolution is a
//! pure function of the two positions, the area, the strategy and the
//! configuration, so the same inputs always name the same winner.
//!
//! Security-classified conflicts are never relaxed automatically: when a
//! strategy would pick the more permissive position, the conflict escalates.
//!
//! ## Usage
//!
//! ```
//! use foreman::review::conflict::{ConflictResolver, ResolutionStrategy, ResolverConfig};
//! use foreman::review::Feedback;
//!
//! let resolver = ConflictResolver::new(ResolverConfig::default());
//! let resolution = resolver.resolve(
//!     ResolutionStrategy::Conservative,
//!     &[
//!         Feedback::new("security", true, 8.0),
//!         Feedback::new("architecture", false, 7.0),
//!     ],
//! );
//! assert_eq!(resolution.conflicts.len(), 1);
//! assert!(resolution.feedback.iter().all(|f| !f.approved));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

use crate::review::feedback::{Feedback, Severity};

/// Default spread between two scores that counts as divergence.
pub const DEFAULT_SCORE_DELTA: f64 = 3.0;

/// Area used when a rejecting reviewer raised no concerns.
pub const GENERAL_AREA: &str = "general";

/// Area used for score divergence.
pub const OVERALL_AREA: &str = "overall";

const WEIGHT_EPSILON: f64 = 1e-9;

/// Phrases that describe a process or documentation gap rather than a
/// vulnerability. Text matching one of these never classifies as security.
const PROCESS_GAP_PHRASES: &[&str] = &[
    "no security requirements",
    "not specified",
    "missing documentation",
    "lacks documentation",
    "should include",
    "should add",
    "no mention of",
    "not defined",
    "unclear requirements",
    "missing requirements",
    "consider adding",
    "recommend adding",
    "suggest adding",
    "would benefit from",
    "needs documentation",
    "should document",
];

/// Kind of disagreement. Ordering is the resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ApprovalMismatch,
    SeverityDisagreement,
    ScoreDivergence,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::ApprovalMismatch => write!(f, "approval_mismatch"),
            ConflictKind::SeverityDisagreement => write!(f, "severity_disagreement"),
            ConflictKind::ScoreDivergence => write!(f, "score_divergence"),
        }
    }
}

/// How a detected conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Higher expertise weight for the area wins; ties go to the stricter position.
    Weighted,
    /// Stricter outcome always wins.
    #[default]
    Conservative,
    /// More permissive outcome always wins.
    Optimistic,
    /// Any disagreement escalates.
    Unanimous,
    /// Every detected conflict escalates.
    Escalate,
    /// The designated lead wins outright.
    DeferToLead,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::Weighted => write!(f, "weighted"),
            ResolutionStrategy::Conservative => write!(f, "conservative"),
            ResolutionStrategy::Optimistic => write!(f, "optimistic"),
            ResolutionStrategy::Unanimous => write!(f, "unanimous"),
            ResolutionStrategy::Escalate => write!(f, "escalate"),
            ResolutionStrategy::DeferToLead => write!(f, "defer_to_lead"),
        }
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "weighted" => Ok(ResolutionStrategy::Weighted),
            "conservative" => Ok(ResolutionStrategy::Conservative),
            "optimistic" => Ok(ResolutionStrategy::Optimistic),
            "unanimous" => Ok(ResolutionStrategy::Unanimous),
            "escalate" => Ok(ResolutionStrategy::Escalate),
            "defer_to_lead" => Ok(ResolutionStrategy::DeferToLead),
            _ => Err(format!(
                "invalid conflict strategy '{}'. Valid values: weighted, conservative, optimistic, unanimous, escalate, defer_to_lead",
                s
            )),
        }
    }
}

/// A reviewer's position in a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Position {
    Approval(bool),
    Severity(Severity),
    Score(f64),
}

impl Position {
    /// Higher rank is stricter: reject over approve, higher severity, lower score.
    fn strictness(&self) -> f64 {
        match self {
            Position::Approval(approved) => {
                if *approved {
                    0.0
                } else {
                    1.0
                }
            }
            Position::Severity(s) => *s as u8 as f64,
            Position::Score(score) => -score,
        }
    }

    pub fn is_stricter_than(&self, other: &Position) -> bool {
        self.strictness() > other.strictness()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Approval(true) => write!(f, "approve"),
            Position::Approval(false) => write!(f, "reject"),
            Position::Severity(s) => write!(f, "{}", s),
            Position::Score(s) => write!(f, "{:.1}", s),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stance {
    pub reviewer: String,
    pub position: Position,
}

impl Stance {
    pub fn new(reviewer: &str, position: Position) -> Self {
        Self {
            reviewer: reviewer.to_string(),
            position,
        }
    }
}

/// A detected and adjudicated disagreement, persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub area: String,
    pub first: Stance,
    pub second: Stance,
    pub strategy: ResolutionStrategy,
    /// Winning reviewer, absent when escalated or audit-only.
    pub winner: Option<String>,
    pub accepted: Option<Position>,
    pub security: bool,
    pub escalated: bool,
    pub reasoning: String,
}

/// Why resolution could not settle the feedback set on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEscalation {
    /// At least one escalated conflict is security-classified.
    pub security: bool,
    pub summary: String,
}

/// Output of resolving a whole feedback set.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Feedback with accepted positions applied. ERROR feedback passes through unchanged.
    pub feedback: Vec<Feedback>,
    pub conflicts: Vec<Conflict>,
    /// Blocking issues dropped because "approve" was accepted.
    pub overruled_issues: Vec<String>,
    pub escalation: Option<ConflictEscalation>,
}

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub strategy: ResolutionStrategy,
    #[serde(default = "default_score_delta")]
    pub score_delta: f64,
    /// Primary participant for `DeferToLead`.
    #[serde(default)]
    pub lead: Option<String>,
    /// Expertise weights keyed by concern area, then reviewer id.
    #[serde(default)]
    pub expertise: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(default = "default_security_keywords")]
    pub security_keywords: Vec<String>,
}

fn default_score_delta() -> f64 {
    DEFAULT_SCORE_DELTA
}

pub fn default_security_keywords() -> Vec<String> {
    [
        "vulnerability",
        "sql injection",
        "command injection",
        "code injection",
        "injection attack",
        "xss",
        "cross-site scripting",
        "csrf",
        "cross-site request forgery",
        "rce",
        "remote code execution",
        "authentication bypass",
        "auth bypass",
        "authorization bypass",
        "privilege escalation",
        "path traversal",
        "directory traversal",
        "insecure deserialization",
        "ssrf",
        "server-side request forgery",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::default(),
            score_delta: default_score_delta(),
            lead: None,
            expertise: BTreeMap::new(),
            security_keywords: default_security_keywords(),
        }
    }
}

impl ResolverConfig {
    pub fn with_lead(mut self, lead: &str) -> Self {
        self.lead = Some(lead.to_string());
        self
    }

    pub fn with_weight(mut self, area: &str, reviewer: &str, weight: f64) -> Self {
        self.expertise
            .entry(area.to_lowercase())
            .or_default()
            .insert(reviewer.to_string(), weight);
        self
    }
}

/// A conflict before a strategy is applied.
struct Detected {
    kind: ConflictKind,
    area: String,
    first: Stance,
    second: Stance,
    security: bool,
}

/// Detects and resolves reviewer conflicts.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    config: ResolverConfig,
    security_patterns: Vec<Regex>,
    process_gap_patterns: Vec<Regex>,
}

fn word_pattern(phrase: &str) -> Option<Regex> {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(phrase.trim()))) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(phrase, error = %e, "Skipping unusable keyword pattern");
            None
        }
    }
}

impl ConflictResolver {
    pub fn new(config: ResolverConfig) -> Self {
        let security_patterns = config
            .security_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .filter_map(|k| word_pattern(k))
            .collect();
        let process_gap_patterns = PROCESS_GAP_PHRASES
            .iter()
            .filter_map(|p| word_pattern(p))
            .collect();
        Self {
            config,
            security_patterns,
            process_gap_patterns,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Whether free text names an actual vulnerability.
    pub fn is_security_text(&self, text: &str) -> bool {
        self.security_patterns.iter().any(|re| re.is_match(text))
            && !self.process_gap_patterns.iter().any(|re| re.is_match(text))
    }

    fn weight(&self, area: &str, reviewer: &str) -> f64 {
        self.config
            .expertise
            .get(area)
            .and_then(|m| m.get(reviewer))
            .copied()
            .unwrap_or(1.0)
    }

    fn mentions_security(&self, feedback: &Feedback, area: Option<&str>) -> bool {
        feedback.blocking_issues.iter().any(|i| self.is_security_text(i))
            || feedback
                .concerns
                .iter()
                .filter(|c| area.is_none_or(|a| c.area == a))
                .any(|c| c.area == "security" || self.is_security_text(&c.description))
    }

    fn detect(&self, feedback: &[Feedback]) -> Vec<Detected> {
        let mut detected = Vec::new();

        // Approval mismatch: one conflict per (approver, rejector) pair.
        for approver in feedback.iter().filter(|f| f.approved) {
            for rejector in feedback.iter().filter(|f| !f.approved) {
                let area = rejector
                    .most_severe_area()
                    .unwrap_or(GENERAL_AREA)
                    .to_string();
                let security = area == "security"
                    || self.mentions_security(approver, None)
                    || self.mentions_security(rejector, None);
                detected.push(Detected {
                    kind: ConflictKind::ApprovalMismatch,
                    area,
                    first: Stance::new(&approver.reviewer, Position::Approval(true)),
                    second: Stance::new(&rejector.reviewer, Position::Approval(false)),
                    security,
                });
            }
        }

        // Severity disagreement: per area, highest against lowest.
        let mut by_area: BTreeMap<&str, Vec<(&str, Severity)>> = BTreeMap::new();
        for fb in feedback {
            let mut areas: Vec<&str> = fb.concerns.iter().map(|c| c.area.as_str()).collect();
            areas.sort();
            areas.dedup();
            for area in areas {
                if let Some(sev) = fb.max_severity_in(area) {
                    by_area.entry(area).or_default().push((fb.reviewer.as_str(), sev));
                }
            }
        }
        for (area, ratings) in by_area {
            if ratings.len() < 2 {
                continue;
            }
            let highest = ratings
                .iter()
                .min_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            let lowest = ratings
                .iter()
                .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
            if let (Some(high), Some(low)) = (highest, lowest)
                && high.1 != low.1
            {
                let security = area == "security"
                    || feedback
                        .iter()
                        .filter(|f| f.reviewer == high.0 || f.reviewer == low.0)
                        .any(|f| self.mentions_security(f, Some(area)));
                detected.push(Detected {
                    kind: ConflictKind::SeverityDisagreement,
                    area: area.to_string(),
                    first: Stance::new(high.0, Position::Severity(high.1)),
                    second: Stance::new(low.0, Position::Severity(low.1)),
                    security,
                });
            }
        }

        // Score divergence: the widest spread only.
        let top = feedback.iter().min_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.reviewer.cmp(&b.reviewer))
        });
        let bottom = feedback.iter().min_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.reviewer.cmp(&b.reviewer))
        });
        if let (Some(top), Some(bottom)) = (top, bottom)
            && top.reviewer != bottom.reviewer
            && top.score - bottom.score + WEIGHT_EPSILON >= self.config.score_delta
        {
            detected.push(Detected {
                kind: ConflictKind::ScoreDivergence,
                area: OVERALL_AREA.to_string(),
                first: Stance::new(&top.reviewer, Position::Score(top.score)),
                second: Stance::new(&bottom.reviewer, Position::Score(bottom.score)),
                security: false,
            });
        }

        detected.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.area.cmp(&b.area))
                .then_with(|| a.first.reviewer.cmp(&b.first.reviewer))
                .then_with(|| a.second.reviewer.cmp(&b.second.reviewer))
        });
        detected
    }

    /// Settle one disagreement between two stances.
    pub fn resolve_pair(
        &self,
        strategy: ResolutionStrategy,
        kind: ConflictKind,
        area: &str,
        a: &Stance,
        b: &Stance,
        security: bool,
    ) -> Conflict {
        let mut conflict = Conflict {
            kind,
            area: area.to_string(),
            first: a.clone(),
            second: b.clone(),
            strategy,
            winner: None,
            accepted: None,
            security,
            escalated: false,
            reasoning: String::new(),
        };

        if kind == ConflictKind::ScoreDivergence {
            let spread = match (a.position, b.position) {
                (Position::Score(x), Position::Score(y)) => (x - y).abs(),
                _ => 0.0,
            };
            if matches!(
                strategy,
                ResolutionStrategy::Unanimous | ResolutionStrategy::Escalate
            ) {
                conflict.escalated = true;
                conflict.reasoning = format!(
                    "{}: score spread {:.1} between {} and {} requires a decision",
                    strategy, spread, a.reviewer, b.reviewer
                );
            } else {
                conflict.reasoning = format!(
                    "score spread {:.1} between {} and {} recorded for audit",
                    spread, a.reviewer, b.reviewer
                );
            }
            return conflict;
        }

        let (stricter, permissive) = if a.position.is_stricter_than(&b.position) {
            (a, b)
        } else {
            (b, a)
        };

        let outcome: Result<(&Stance, String), String> = match strategy {
            ResolutionStrategy::Conservative => {
                Ok((stricter, "conservative: stricter position wins".to_string()))
            }
            ResolutionStrategy::Optimistic => Ok((
                permissive,
                "optimistic: more permissive position wins".to_string(),
            )),
            ResolutionStrategy::Weighted => {
                let wa = self.weight(area, &a.reviewer);
                let wb = self.weight(area, &b.reviewer);
                if (wa - wb).abs() < WEIGHT_EPSILON {
                    Ok((
                        stricter,
                        format!(
                            "weighted: tie at {:.2} for '{}', stricter position wins",
                            wa, area
                        ),
                    ))
                } else if wa > wb {
                    Ok((
                        a,
                        format!("weighted: {} ({:.2}) outweighs {} ({:.2}) on '{}'", a.reviewer, wa, b.reviewer, wb, area),
                    ))
                } else {
                    Ok((
                        b,
                        format!("weighted: {} ({:.2}) outweighs {} ({:.2}) on '{}'", b.reviewer, wb, a.reviewer, wa, area),
                    ))
                }
            }
            ResolutionStrategy::DeferToLead => match self.config.lead.as_deref() {
                Some(lead) if lead == a.reviewer => {
                    Ok((a, format!("defer_to_lead: {} is lead", lead)))
                }
                Some(lead) if lead == b.reviewer => {
                    Ok((b, format!("defer_to_lead: {} is lead", lead)))
                }
                _ => Ok((
                    stricter,
                    "defer_to_lead: lead not party to conflict, stricter position wins"
                        .to_string(),
                )),
            },
            ResolutionStrategy::Unanimous => {
                Err("unanimous: positions differ".to_string())
            }
            ResolutionStrategy::Escalate => {
                Err("escalate: conflicts are always escalated".to_string())
            }
        };

        match outcome {
            Err(reason) => {
                conflict.escalated = true;
                conflict.reasoning = format!(
                    "{} ({} {} vs {} {})",
                    reason, a.reviewer, a.position, b.reviewer, b.position
                );
            }
            Ok((winner, reason)) if security && winner.reviewer == permissive.reviewer => {
                conflict.escalated = true;
                conflict.reasoning = format!(
                    "{}; security conflict on '{}' cannot accept permissive position '{}' from {}",
                    reason, area, winner.position, winner.reviewer
                );
            }
            Ok((winner, reason)) => {
                conflict.winner = Some(winner.reviewer.clone());
                conflict.accepted = Some(winner.position);
                conflict.reasoning = format!(
                    "{}: accepted '{}' from {}",
                    reason, winner.position, winner.reviewer
                );
            }
        }
        conflict
    }

    /// Detect and resolve every conflict in a feedback set.
    ///
    /// ERROR feedback never takes part in resolution and is returned unchanged.
    pub fn resolve(&self, strategy: ResolutionStrategy, feedback: &[Feedback]) -> Resolution {
        let (errors, valid): (Vec<Feedback>, Vec<Feedback>) =
            feedback.iter().cloned().partition(|f| f.is_error());

        let conflicts: Vec<Conflict> = self
            .detect(&valid)
            .into_iter()
            .map(|d| self.resolve_pair(strategy, d.kind, &d.area, &d.first, &d.second, d.security))
            .collect();

        let mut adjusted = valid;
        let mut overruled_issues = Vec::new();

        for c in conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::SeverityDisagreement && !c.escalated)
        {
            if let Some(Position::Severity(accepted)) = c.accepted {
                for concern in adjusted
                    .iter_mut()
                    .flat_map(|f| f.concerns.iter_mut())
                    .filter(|concern| concern.area == c.area)
                {
                    concern.severity = accepted;
                }
            }
        }

        let approval: Vec<&Conflict> = conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::ApprovalMismatch && !c.escalated)
            .collect();
        if !approval.is_empty() {
            let reject = approval
                .iter()
                .any(|c| c.accepted == Some(Position::Approval(false)));
            for fb in adjusted.iter_mut() {
                if reject {
                    fb.approved = false;
                } else if !fb.approved {
                    overruled_issues.extend(fb.blocking_issues.drain(..));
                    fb.approved = true;
                }
            }
        }

        let escalated: Vec<&Conflict> = conflicts.iter().filter(|c| c.escalated).collect();
        let escalation = if escalated.is_empty() {
            None
        } else {
            Some(ConflictEscalation {
                security: escalated.iter().any(|c| c.security),
                summary: escalated
                    .iter()
                    .map(|c| format!("[{} / {}] {}", c.kind, c.area, c.reasoning))
                    .collect::<Vec<_>>()
                    .join("; "),
            })
        };

        adjusted.extend(errors);
        adjusted.sort_by(|a, b| a.reviewer.cmp(&b.reviewer));

        Resolution {
            feedback: adjusted,
            conflicts,
            overruled_issues,
            escalation,
        }
    }
}
