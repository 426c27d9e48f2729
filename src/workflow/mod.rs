//! The workflow engine.
//!
//! - [`state`]: the persisted workflow document
//! - [`transition`]: pure transitions and routing between phases
//! - [`fanout`]: bounded parallel execution of a phase cohort
//! - [`dispatch`]: one collaborator call with retries, fallback and accounting
//! - [`engine`]: the driver that ties them to checkpoints, escalations and the audit log
//!
//! ## Usage
//!
//! ```no_run
//! use foreman::agent::CollaboratorRegistry;
//! use foreman::config::Config;
//! use foreman::workflow::{Engine, RunOutcome};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::new(Path::new("."), false)?;
//! let engine = Engine::from_config(&config)?;
//! match engine.run().await? {
//!     RunOutcome::Completed => println!("done"),
//!     RunOutcome::Escalated(request) => println!("waiting on {}", request.id),
//!     RunOutcome::Aborted => println!("aborted"),
//! }
//! # let _ = CollaboratorRegistry::new();
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod engine;
pub mod fanout;
pub mod state;
pub mod transition;

pub use dispatch::{DispatchFailure, Dispatched, Dispatcher};
pub use engine::{Engine, EngineOptions, RunOutcome};
pub use fanout::{FanOut, UnitOutcome};
pub use state::{ErrorRecord, PendingEscalation, PhaseRecord, RetryCause, WorkflowState, WorkflowStatus};
pub use transition::{Route, StepOutcome};
