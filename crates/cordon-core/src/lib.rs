//! Cordon Core - Risk policy, confirmation and execution orchestration
//!
//! Everything that decides *whether* and *where* code runs lives here; the
//! mechanics of running it live in `cordon-sandbox`.

pub mod config;
pub mod confirm;
pub mod manager;
pub mod risk;

pub use config::{Config, ConfigError, ConfirmationMode, RuleConfig};
pub use confirm::{AutoConfirm, ChannelConfirmation, ConfirmationInbox, ConfirmationService, PendingConfirmation};
pub use manager::{ExecutionStage, Manager, ManagerBuilder};
pub use risk::{required_backend, BackendDecision, RiskPolicy, SecurityMode};

use cordon_sandbox::SandboxError;

/// Errors from policy construction and orchestration setup
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid risk rule '{name}': {source}")]
    InvalidRule {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
