//! Host subprocess backend
//!
//! Fastest and weakest backend: the code runs as a direct child of this
//! process. It is only ever selected for payloads assessed as SAFE, so the
//! keyword blacklist below is a cheap pre-filter, not a boundary.

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Executor, Interpreters};
use crate::error::{FailureKind, SandboxError};
use crate::limits::ResourceLimits;
use crate::process::{exit_code, supervise, ProcessOutcome};
use crate::request::{BackendKind, ExecutionRequest, ExecutionResult, Language};
use crate::workspace::Workspaces;
use crate::Result;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Subprocess backend configuration
#[derive(Debug, Clone, Default)]
pub struct SubprocessConfig {
    pub interpreters: Interpreters,
    pub limits: ResourceLimits,
    /// Extra substrings refused before spawning
    pub blocked_patterns: Vec<String>,
}

pub struct SubprocessExecutor {
    config: SubprocessConfig,
    workspaces: Workspaces,
}

impl SubprocessExecutor {
    pub fn new(config: SubprocessConfig, workspaces: Workspaces) -> Self {
        Self { config, workspaces }
    }

    /// Return the first blacklisted token found in `code`
    fn blocked_token<'a>(&'a self, language: Language, code: &str) -> Option<&'a str> {
        let builtin: &[&str] = match language {
            Language::Python => &[
                "import subprocess",
                "from subprocess",
                "import ctypes",
                "__import__",
                "os.system",
                "os.popen",
                "os.fork",
                "pty.spawn",
                "socket.socket",
                "eval(",
                "exec(",
            ],
            Language::Shell => &["sudo ", "rm -rf", "mkfs", ":(){", "/dev/tcp/", "nc -e"],
            Language::JavaScript => &["child_process", "require('net')", "process.binding", "eval("],
        };
        builtin
            .iter()
            .copied()
            .chain(self.config.blocked_patterns.iter().map(String::as_str))
            .find(|token| code.contains(token))
    }
}

#[async_trait]
impl Executor for SubprocessExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        if let Some(token) = self.blocked_token(request.language(), request.code()) {
            warn!(session = request.session_id(), token, "subprocess pre-filter refused code");
            return Ok(ExecutionResult::failure(
                FailureKind::PolicyBlocked,
                format!("'{token}' is not allowed in host subprocess execution"),
            )
            .with_backend(BackendKind::Subprocess));
        }

        let workspace = self.workspaces.session(request.session_id())?;
        let (program, args) = self
            .config
            .interpreters
            .command_line(request.language(), request.code());

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(workspace.root())
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", workspace.root())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandboxError::unavailable(
                    BackendKind::Subprocess,
                    format!("interpreter '{program}' not found"),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let captured = supervise(child, request.timeout(), self.config.limits.max_output_bytes).await?;
        let result = match captured.outcome {
            ProcessOutcome::Exited(status) => ExecutionResult::completed(
                BackendKind::Subprocess,
                captured.stdout,
                captured.stderr,
                exit_code(&status),
                captured.elapsed,
            ),
            ProcessOutcome::TimedOut => {
                warn!(session = request.session_id(), "subprocess timed out, killed");
                ExecutionResult::timed_out(BackendKind::Subprocess, request.timeout())
                    .with_output(captured.stdout, captured.stderr)
                    .with_duration(captured.elapsed)
            }
            ProcessOutcome::OutputLimit => {
                warn!(session = request.session_id(), "subprocess output cap reached, killed");
                ExecutionResult::failure(
                    FailureKind::ResourceLimit,
                    format!(
                        "output exceeded {} bytes",
                        self.config.limits.max_output_bytes
                    ),
                )
                .with_backend(BackendKind::Subprocess)
                .with_output(captured.stdout, captured.stderr)
                .with_duration(captured.elapsed)
            }
        };

        info!(
            session = request.session_id(),
            success = result.success,
            exit_code = result.exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "subprocess execution finished"
        );
        Ok(result)
    }

    async fn cleanup(&self) -> Result<()> {
        // Children are killed on drop; nothing outlives a call
        Ok(())
    }
}
