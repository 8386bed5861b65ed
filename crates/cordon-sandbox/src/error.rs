//! Sandbox error taxonomy

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::request::BackendKind;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Path escapes session workspace: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable { backend: BackendKind, reason: String },

    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Blocked by execution policy: {0}")]
    PolicyBlocked(String),

    #[error("Sandbox pool is shut down")]
    PoolClosed,

    #[error("No pool capacity within {}ms", .0.as_millis())]
    PoolExhausted(Duration),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Tag reported to callers in `ExecutionResult::error`
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::ValidationError,
            Self::PathTraversal(_) => FailureKind::PathTraversal,
            Self::BackendUnavailable { .. } | Self::PoolClosed | Self::PoolExhausted(_) => {
                FailureKind::BackendUnavailable
            }
            Self::Timeout(_) => FailureKind::Timeout,
            Self::ResourceLimit(_) => FailureKind::ResourceLimit,
            Self::PolicyBlocked(_) => FailureKind::PolicyBlocked,
            Self::InvalidState(_) | Self::Io(_) => FailureKind::Internal,
        }
    }
}

/// Why an execution did not succeed.
///
/// Serialized as the short snake_case tag the agent loop reasons about
/// (`"timeout"`, `"confirmation_denied"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    PathTraversal,
    BackendUnavailable,
    Timeout,
    ResourceLimit,
    ConfirmationDenied,
    PolicyBlocked,
    /// The sandboxed code itself failed (non-zero exit, uncaught exception)
    ExecutionError,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::PathTraversal => "path_traversal",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Timeout => "timeout",
            Self::ResourceLimit => "resource_limit",
            Self::ConfirmationDenied => "confirmation_denied",
            Self::PolicyBlocked => "policy_blocked",
            Self::ExecutionError => "execution_error",
            Self::Internal => "internal",
        }
    }

    /// Whether resubmitting the same request unchanged can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable | Self::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
