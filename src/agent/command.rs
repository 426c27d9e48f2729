//! Collaborators backed by an external command.
//!
//! The request is written to the child's stdin as JSON and the result is read
//! from stdout. Exit code 0 is success, 75 (`EX_TEMPFAIL`) is a transient
//! failure, anything else is a failure. On timeout the child is killed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::parse::extract_cost;
use super::{Collaborator, InvocationError, InvocationRequest, RawOutput};

/// Exit code a command uses to ask for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

/// Maximum stderr characters carried into an error message.
const STDERR_TAIL: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    id: String,
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl CommandCollaborator {
    pub fn new(id: &str, program: &str, working_dir: &Path) -> Self {
        Self {
            id: id.to_string(),
            program: program.to_string(),
            args: Vec::new(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<RawOutput, InvocationError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| InvocationError::Failed(format!("failed to encode request: {}", e)))?;

        debug!(
            participant = %self.id,
            program = %self.program,
            phase = %request.phase,
            attempt = request.attempt,
            "Spawning collaborator"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FOREMAN_PROJECT", &request.project)
            .env("FOREMAN_PHASE", request.phase.name())
            .env("FOREMAN_PARTICIPANT", &request.participant)
            .env("FOREMAN_ATTEMPT", request.attempt.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InvocationError::Failed(format!("failed to spawn '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close stdin early.
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(InvocationError::Transient(format!(
                        "failed to write request to '{}': {}",
                        self.program, e
                    )));
                }
            }
        }

        let limit = request.timeout();
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                InvocationError::Transient(format!("failed to wait for '{}': {}", self.program, e))
            })?,
            // Dropping the future drops the child, which kills it.
            Err(_) => return Err(InvocationError::Timeout(limit)),
        };

        match output.status.code() {
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let cost_usd = extract_cost(&stdout);
                Ok(RawOutput { stdout, cost_usd })
            }
            Some(EXIT_TEMPFAIL) => Err(InvocationError::Transient(format!(
                "'{}' asked for a retry: {}",
                self.program,
                stderr_tail(&output.stderr)
            ))),
            code => Err(InvocationError::Failed(format!(
                "'{}' exited with {}: {}",
                self.program,
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail(&output.stderr)
            ))),
        }
    }
}
