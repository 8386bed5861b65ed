//! Execution backends
//!
//! Every backend implements [`Executor`]. The orchestrator picks one per
//! request; nothing else branches on backend kind.

mod container;
mod pooled;
mod subprocess;

pub use container::{ContainerConfig, ContainerExecutor};
pub use pooled::PooledExecutor;
pub use subprocess::{SubprocessConfig, SubprocessExecutor};

use async_trait::async_trait;
use std::time::Duration;

use crate::request::{BackendKind, ExecutionRequest, ExecutionResult, Language};
use crate::Result;

/// Common contract of all execution backends.
///
/// `execute` returns `Ok` for every outcome of running the code, including
/// non-zero exits, timeouts and resource-limit kills. `Err` is reserved for
/// failures of the backend itself (`BackendUnavailable`, I/O trouble).
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;

    /// Time a call may spend queued behind other calls of its session before
    /// its own timeout starts counting
    fn queue_allowance(&self) -> Duration {
        Duration::ZERO
    }

    /// Tear down everything this backend created
    async fn cleanup(&self) -> Result<()>;

    /// Tear down what belongs to one session
    async fn cleanup_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }

    /// Cheap reachability check
    async fn is_available(&self) -> bool {
        true
    }
}

/// Interpreter commands per language
#[derive(Debug, Clone)]
pub struct Interpreters {
    pub python: String,
    pub shell: String,
    pub node: String,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            shell: "sh".to_string(),
            node: "node".to_string(),
        }
    }
}

impl Interpreters {
    /// Program and arguments that run `code` inline
    pub fn command_line(&self, language: Language, code: &str) -> (String, Vec<String>) {
        match language {
            Language::Python => (
                self.python.clone(),
                vec!["-I".to_string(), "-c".to_string(), code.to_string()],
            ),
            Language::Shell => (self.shell.clone(), vec!["-c".to_string(), code.to_string()]),
            Language::JavaScript => (self.node.clone(), vec!["-e".to_string(), code.to_string()]),
        }
    }
}
