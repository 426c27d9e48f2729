use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::foreman_config::ForemanToml;

/// Name of the per-project state directory.
pub const FOREMAN_DIR: &str = ".foreman";

/// Runtime configuration for foreman.
///
/// Bridges `foreman.toml` with the paths the engine reads and writes. Every
/// path lives under `<project>/.foreman/`.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub config_file: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub escalation_dir: PathBuf,
    pub phases_dir: PathBuf,
    pub log_dir: PathBuf,
    pub events_file: PathBuf,
    pub budget_file: PathBuf,
    pub state_file: PathBuf,
    pub verbose: bool,
    /// Parsed `foreman.toml` with environment overrides applied.
    pub toml: ForemanToml,
}

impl Config {
    /// Resolve paths for `project_dir` and load its configuration.
    pub fn new(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let mut toml = ForemanToml::load_or_default(&project_dir.join(FOREMAN_DIR))?;
        toml.apply_env_overrides(|key| std::env::var(key).ok())
            .context("Invalid environment override")?;
        Ok(Self::with_toml(&project_dir, toml, verbose))
    }

    /// Resolve paths for `project_dir` using an already-built configuration.
    pub fn with_toml(project_dir: &Path, toml: ForemanToml, verbose: bool) -> Self {
        let foreman_dir = project_dir.join(FOREMAN_DIR);
        Self {
            project_dir: project_dir.to_path_buf(),
            config_file: foreman_dir.join("foreman.toml"),
            checkpoint_dir: foreman_dir.join("checkpoints"),
            escalation_dir: foreman_dir.join("escalations"),
            phases_dir: foreman_dir.join("phases"),
            log_dir: foreman_dir.join("logs"),
            events_file: foreman_dir.join("events.jsonl"),
            budget_file: foreman_dir.join("budget.json"),
            state_file: foreman_dir.join("state.json"),
            foreman_dir,
            verbose,
            toml,
        }
    }

    /// Project identifier: `[project] name`, else the directory name.
    pub fn project_name(&self) -> String {
        self.toml
            .project
            .name
            .clone()
            .or_else(|| {
                self.project_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.foreman_dir.is_dir()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.foreman_dir,
            &self.checkpoint_dir,
            &self.escalation_dir,
            &self.phases_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_live_under_foreman_dir() {
        let dir = tempdir().unwrap();
        let config = Config::with_toml(dir.path(), ForemanToml::default(), false);
        assert_eq!(config.foreman_dir, dir.path().join(".foreman"));
        assert_eq!(config.checkpoint_dir, dir.path().join(".foreman/checkpoints"));
        assert_eq!(config.events_file, dir.path().join(".foreman/events.jsonl"));
        assert_eq!(config.state_file, dir.path().join(".foreman/state.json"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::with_toml(dir.path(), ForemanToml::default(), false);
        assert!(!config.is_initialized());
        config.ensure_directories().unwrap();
        assert!(config.is_initialized());
        assert!(config.escalation_dir.is_dir());
        assert!(config.phases_dir.is_dir());
    }

    #[test]
    fn test_project_name_prefers_config() {
        let dir = tempdir().unwrap();
        let mut toml = ForemanToml::default();
        let config = Config::with_toml(dir.path(), toml.clone(), false);
        assert_eq!(
            config.project_name(),
            dir.path().file_name().unwrap().to_string_lossy()
        );

        toml.project.name = Some("billing".to_string());
        let config = Config::with_toml(dir.path(), toml, false);
        assert_eq!(config.project_name(), "billing");
    }

    #[test]
    fn test_new_reads_foreman_toml() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        std::fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[project]\nname = \"from-file\"\n",
        )
        .unwrap();
        let config = Config::new(dir.path(), false).unwrap();
        assert_eq!(config.project_name(), "from-file");
    }
}
