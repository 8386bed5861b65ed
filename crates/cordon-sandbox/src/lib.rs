//! Cordon Sandbox - Isolated code execution backends
//!
//! Three backends behind one [`Executor`] trait: host subprocess, ephemeral
//! container, and a pool of remote sandbox instances. Session workspaces
//! give every session its own directory that no path can escape.

pub mod error;
pub mod executor;
pub mod limits;
pub mod pool;
mod process;
pub mod remote;
pub mod request;
pub mod workspace;

pub use error::{FailureKind, SandboxError};
pub use executor::{
    ContainerConfig, ContainerExecutor, Executor, Interpreters, PooledExecutor, SubprocessConfig,
    SubprocessExecutor,
};
pub use limits::ResourceLimits;
pub use pool::{EntryState, InstanceProvider, Pool, PoolConfig, PoolLease, PoolStats};
pub use remote::{BrowserPage, HttpProvisioner, RemoteSandbox};
pub use request::{
    validate_session_id, BackendKind, ExecutionRequest, ExecutionResult, Language, RiskAssessment, RiskLevel,
    BACKEND_PREFERENCE_KEY, MAX_SESSION_ID_LEN,
};
pub use workspace::{check_relative, Workspace, WorkspaceEntry, Workspaces};

pub type Result<T> = std::result::Result<T, SandboxError>;
