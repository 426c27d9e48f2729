//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `init`     | `Init`                    |
//! | `run`      | `Run`, `Resume`           |
//! | `status`   | `Status`, `History`       |
//! | `rollback` | `Rollback`                |
//! | `budget`   | `Budget`                  |
//! | `config`   | `Config`                  |
//!
//! Commands return the process exit code; errors are mapped by `main`.

pub mod budget;
pub mod config;
pub mod init;
pub mod rollback;
pub mod run;
pub mod status;

use anyhow::{Result, bail};
use std::path::Path;

use foreman::config::Config;

pub use budget::cmd_budget;
pub use config::cmd_config;
pub use init::cmd_init;
pub use rollback::cmd_rollback;
pub use run::{cmd_resume, cmd_run, resume_action};
pub use status::{cmd_history, cmd_status};

/// Load configuration for an initialized project.
pub(crate) fn load_config(project_dir: &Path, verbose: bool) -> Result<Config> {
    let config = Config::new(project_dir, verbose)?;
    if !config.is_initialized() {
        bail!(
            "No foreman project at {}. Run 'foreman init' first.",
            config.project_dir.display()
        );
    }
    Ok(config)
}
