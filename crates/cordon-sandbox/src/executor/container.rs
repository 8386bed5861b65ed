//! Ephemeral container backend driven through the docker/podman CLI
//!
//! One container per execution: no network, all capabilities dropped,
//! read-only root filesystem, memory/CPU/pid ceilings, and only the session
//! workspace mounted writable. Containers are named so they can be killed,
//! inspected and removed even when the client process is gone.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Executor, Interpreters};
use crate::error::{FailureKind, SandboxError};
use crate::limits::ResourceLimits;
use crate::process::{exit_code, supervise, ProcessOutcome};
use crate::request::{BackendKind, ExecutionRequest, ExecutionResult};
use crate::workspace::Workspaces;
use crate::Result;

/// Exit status the docker/podman CLI uses for its own failures
const ENGINE_ERROR_EXIT: i32 = 125;
const ENGINE_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Container backend configuration
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// `docker` or `podman`
    pub engine: String,
    pub image: String,
    /// Prefix of generated container names
    pub name_prefix: String,
    pub interpreters: Interpreters,
    pub limits: ResourceLimits,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            image: "python:3.12-slim".to_string(),
            name_prefix: "cordon".to_string(),
            interpreters: Interpreters::default(),
            limits: ResourceLimits::default(),
        }
    }
}

type LiveContainers = Arc<Mutex<HashMap<String, HashSet<String>>>>;

pub struct ContainerExecutor {
    config: ContainerConfig,
    workspaces: Workspaces,
    live: LiveContainers,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig, workspaces: Workspaces) -> Self {
        Self {
            config,
            workspaces,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Containers currently running for `session_id`
    pub fn live_containers(&self, session_id: &str) -> Vec<String> {
        let live = self.live.lock();
        let mut names: Vec<String> = live
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn container_name(&self, session_id: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.config.name_prefix, session_id, &suffix[..8])
    }

    /// Arguments of the `run` invocation, up to and including the command
    fn run_args(&self, name: &str, workspace_root: &Path, request: &ExecutionRequest) -> Vec<String> {
        let limits = &self.config.limits;
        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            limits.memory_flag(),
            "--memory-swap".into(),
            limits.memory_flag(),
            "--cpus".into(),
            format!("{}", limits.cpus),
            "--pids-limit".into(),
            limits.pids_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,size=64m".into(),
            "-v".into(),
            format!("{}:/workspace:rw", workspace_root.display()),
            "-w".into(),
            "/workspace".into(),
            "-e".into(),
            "HOME=/workspace".into(),
            "--label".into(),
            format!("cordon.session={}", request.session_id()),
            self.config.image.clone(),
        ];
        let (program, program_args) = self
            .config
            .interpreters
            .command_line(request.language(), request.code());
        args.push(program);
        args.extend(program_args);
        args
    }

    async fn engine(&self, args: &[&str]) -> io::Result<Output> {
        engine_output(&self.config.engine, args).await
    }

    async fn oom_killed(&self, name: &str) -> bool {
        match self
            .engine(&["inspect", "--format", "{{.State.OOMKilled}}", name])
            .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim() == "true",
            Ok(out) => {
                debug!(container = name, stderr = %String::from_utf8_lossy(&out.stderr).trim(), "inspect failed");
                false
            }
            Err(e) => {
                debug!(container = name, "inspect failed: {}", e);
                false
            }
        }
    }

    async fn remove_containers(&self, names: Vec<String>) -> Result<()> {
        for name in names {
            match self.engine(&["rm", "-f", &name]).await {
                Ok(out) if out.status.success() => debug!(container = %name, "container removed"),
                Ok(out) => warn!(
                    container = %name,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "container removal failed"
                ),
                Err(e) => warn!(container = %name, "container removal failed: {}", e),
            }
        }
        Ok(())
    }
}

async fn engine_output(engine: &str, args: &[&str]) -> io::Result<Output> {
    let mut cmd = Command::new(engine);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tokio::time::timeout(ENGINE_COMMAND_TIMEOUT, cmd.output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "container engine did not respond"))?
}

/// Keeps a container registered while a call is in flight. If the call is
/// abandoned before the container was removed, removal is scheduled on drop.
struct ContainerGuard {
    engine: String,
    session_id: String,
    name: String,
    live: LiveContainers,
    removed: bool,
}

impl ContainerGuard {
    fn new(engine: &str, session_id: &str, name: &str, live: &LiveContainers) -> Self {
        live.lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(name.to_string());
        Self {
            engine: engine.to_string(),
            session_id: session_id.to_string(),
            name: name.to_string(),
            live: live.clone(),
            removed: false,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        {
            let mut live = self.live.lock();
            if let Some(set) = live.get_mut(&self.session_id) {
                set.remove(&self.name);
                if set.is_empty() {
                    live.remove(&self.session_id);
                }
            }
        }
        if self.removed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let engine = std::mem::take(&mut self.engine);
            let name = std::mem::take(&mut self.name);
            handle.spawn(async move {
                let _ = engine_output(&engine, &["rm", "-f", &name]).await;
            });
        } else {
            warn!(container = %self.name, "no runtime to remove abandoned container");
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let workspace = self.workspaces.session(request.session_id())?;
        let name = self.container_name(request.session_id());
        let args = self.run_args(&name, workspace.root(), request);

        let mut guard = ContainerGuard::new(&self.config.engine, request.session_id(), &name, &self.live);

        let mut cmd = Command::new(&self.config.engine);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(container = %name, image = %self.config.image, "starting container");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                guard.removed = true;
                return Err(SandboxError::unavailable(
                    BackendKind::Container,
                    format!("container engine '{}' not found", self.config.engine),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let captured = supervise(child, request.timeout(), self.config.limits.max_output_bytes).await?;

        if !matches!(captured.outcome, ProcessOutcome::Exited(_)) {
            let _ = self.engine(&["kill", &name]).await;
        }
        let oom = self.oom_killed(&name).await;
        self.remove_containers(vec![name.clone()]).await?;
        guard.removed = true;

        let result = match captured.outcome {
            ProcessOutcome::Exited(status) if exit_code(&status) == ENGINE_ERROR_EXIT && !oom => {
                return Err(SandboxError::unavailable(
                    BackendKind::Container,
                    format!("engine failed to start container: {}", captured.stderr.trim()),
                ));
            }
            ProcessOutcome::Exited(_) if oom => {
                warn!(container = %name, "container killed by memory limit");
                ExecutionResult::failure(
                    FailureKind::ResourceLimit,
                    format!("memory limit of {} exceeded", self.config.limits.memory_flag()),
                )
                .with_backend(BackendKind::Container)
                .with_output(captured.stdout, captured.stderr)
                .with_duration(captured.elapsed)
            }
            ProcessOutcome::Exited(status) => ExecutionResult::completed(
                BackendKind::Container,
                captured.stdout,
                captured.stderr,
                exit_code(&status),
                captured.elapsed,
            ),
            ProcessOutcome::TimedOut => {
                warn!(container = %name, "container timed out, killed");
                ExecutionResult::timed_out(BackendKind::Container, request.timeout())
                    .with_output(captured.stdout, captured.stderr)
                    .with_duration(captured.elapsed)
            }
            ProcessOutcome::OutputLimit => ExecutionResult::failure(
                FailureKind::ResourceLimit,
                format!("output exceeded {} bytes", self.config.limits.max_output_bytes),
            )
            .with_backend(BackendKind::Container)
            .with_output(captured.stdout, captured.stderr)
            .with_duration(captured.elapsed),
        };

        info!(
            container = %name,
            session = request.session_id(),
            success = result.success,
            exit_code = result.exit_code,
            "container execution finished"
        );
        Ok(result)
    }

    async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        let names: Vec<String> = self
            .live
            .lock()
            .remove(session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        self.remove_containers(names).await
    }

    async fn cleanup(&self) -> Result<()> {
        let names: Vec<String> = self
            .live
            .lock()
            .drain()
            .flat_map(|(_, set)| set.into_iter())
            .collect();
        self.remove_containers(names).await
    }

    async fn is_available(&self) -> bool {
        match self.engine(&["version", "--format", "{{.Server.Version}}"]).await {
            Ok(out) => out.status.success(),
            Err(_) => false,
        }
    }
}
