//! Reviewer feedback, approval policies and conflict resolution.
//!
//! - [`feedback`]: the validated `Feedback` record produced once per reviewer per attempt
//! - [`conflict`]: detection and deterministic resolution of reviewer disagreement
//! - [`policy`]: the approval policy engine that turns a feedback set into a decision
//!
//! ## Usage
//!
//! ```
//! use foreman::review::{ApprovalPolicy, Feedback, PolicyEngine, ResolutionStrategy};
//!
//! let engine = PolicyEngine::with_defaults();
//! let feedback = vec![
//!     Feedback::new("security", true, 8.0),
//!     Feedback::new("architecture", false, 4.0).with_blocking_issue("sql injection"),
//! ];
//!
//! let decision = engine.evaluate(
//!     ApprovalPolicy::AllMustApprove,
//!     ResolutionStrategy::Conservative,
//!     &feedback,
//! );
//! assert!(!decision.approved);
//! assert_eq!(decision.unresolved_blocking_issues, vec!["sql injection".to_string()]);
//! ```

pub mod conflict;
pub mod feedback;
pub mod policy;

pub use conflict::{
    Conflict, ConflictEscalation, ConflictKind, ConflictResolver, Position, Resolution,
    ResolutionStrategy, ResolverConfig,
};
pub use feedback::{Concern, Feedback, FeedbackOutcome, Severity};
pub use policy::{ApprovalDecision, ApprovalPolicy, PolicyConfig, PolicyEngine};
