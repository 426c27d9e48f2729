//! CLI tests for foreman
//!
//! Agents are plain `sh -c` scripts that print a canned JSON answer, so a
//! whole workflow runs without any external service.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

use foreman::foreman_config::{AgentSection, ForemanToml};

/// Accepted by planner, implementer and reviewer parsing alike.
const AGREEABLE_AGENT: &str = r#"cat >/dev/null; echo '{"status":"completed","plan":{"steps":["build it"]},"files_touched":["src/lib.rs"],"tests_passed":1,"tests_failed":0,"approved":true,"score":9}'"#;

/// Helper to create a foreman Command
fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

fn init_project(dir: &TempDir) {
    foreman()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

/// Rewrite foreman.toml so every agent runs `script`, then apply `tweak`.
fn configure_agents(dir: &TempDir, script: &str, tweak: impl FnOnce(&mut ForemanToml)) {
    let path = dir.path().join(".foreman/foreman.toml");
    let mut toml = ForemanToml::load(&path).unwrap();
    for agent in toml.agents.values_mut() {
        *agent = AgentSection::new("sh").with_args(&["-c", script]);
    }
    tweak(&mut toml);
    toml.save(&path).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        foreman().arg("--help").assert().success();
    }

    #[test]
    fn test_foreman_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized foreman project"));

        assert!(dir.path().join(".foreman/foreman.toml").exists());
        assert!(dir.path().join(".foreman/checkpoints").is_dir());
        assert!(dir.path().join(".foreman/escalations").is_dir());
        assert!(dir.path().join(".foreman/phases").is_dir());
    }

    #[test]
    fn test_init_twice_keeps_config() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_status_requires_init() {
        let dir = TempDir::new().unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("foreman init"));
    }

    #[test]
    fn test_status_before_run() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No workflow started"));
    }

    #[test]
    fn test_resume_flags_conflict() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["resume", "--override", "go", "--abort", "stop"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Config
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_starter_config_is_valid() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_unknown_participant_fails_validation() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        let path = dir.path().join(".foreman/foreman.toml");
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("\n[phases.verifying]\nreviewers = [\"ghost\"]\n");
        fs::write(&path, content).unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("ghost"));
    }

    #[test]
    fn test_show_renders_toml() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[budget]"));
    }
}

// =============================================================================
// Workflow
// =============================================================================

mod workflow {
    use super::*;

    #[test]
    fn test_run_completes_with_agreeable_agents() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_agents(&dir, AGREEABLE_AGENT, |_| {});

        foreman()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(0)
            .stdout(predicate::str::contains("Workflow completed."));

        assert!(dir.path().join(".foreman/state.json").exists());
        assert!(
            dir.path()
                .join(".foreman/phases/completing/attempt-0/COMPLETION.md")
                .exists()
        );

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        foreman()
            .current_dir(dir.path())
            .arg("history")
            .assert()
            .success()
            .stdout(predicate::str::contains("<- latest"));
    }

    #[test]
    fn test_exhausted_budget_exits_with_3() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_agents(&dir, AGREEABLE_AGENT, |toml| {
            toml.budget.project_limit = 0.1;
        });

        foreman()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(3)
            .stdout(predicate::str::contains("budget_exceeded"));

        foreman()
            .current_dir(dir.path())
            .arg("budget")
            .assert()
            .success()
            .stdout(predicate::str::contains("(halted)"));
    }

    #[test]
    fn test_budget_raise_clears_halt_and_resume_completes() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_agents(&dir, AGREEABLE_AGENT, |toml| {
            toml.budget.project_limit = 0.1;
        });
        foreman().current_dir(dir.path()).arg("run").assert().code(3);

        foreman()
            .current_dir(dir.path())
            .args(["budget", "raise", "--scope", "project", "--limit", "25"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Raised project limit to 25.00."));

        foreman()
            .current_dir(dir.path())
            .args(["resume", "--override", "budget raised"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("Workflow completed."));
    }

    #[test]
    fn test_failing_agent_escalates_with_1() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_agents(&dir, "cat >/dev/null; exit 1", |_| {});

        foreman()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("agent_failure"));

        foreman()
            .current_dir(dir.path())
            .args(["resume", "--abort", "agents are down"])
            .assert()
            .code(0)
            .stdout(predicate::str::contains("Workflow aborted."));
    }

    #[test]
    fn test_resume_without_escalation_fails() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        configure_agents(&dir, AGREEABLE_AGENT, |_| {});

        foreman()
            .current_dir(dir.path())
            .args(["resume", "--override", "go"])
            .assert()
            .failure();
    }

    #[test]
    fn test_corrupt_checkpoint_exits_with_2() {
        let dir = TempDir::new().unwrap();
        init_project(&dir);
        fs::write(dir.path().join(".foreman/checkpoints/LATEST"), "garbage").unwrap();

        foreman()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .code(2)
            .stderr(predicate::str::contains("invalid pointer"));
    }
}
