use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cordon_sandbox::{ContainerConfig, Interpreters, Language, PoolConfig, ResourceLimits, RiskLevel, SubprocessConfig};

use crate::risk::SecurityMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment substitution failed: {0}")]
    Env(String),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub security: SecurityConfig,
    pub limits: LimitsConfig,
    pub workspace: WorkspaceConfig,
    pub subprocess: SubprocessSection,
    pub container: ContainerSection,
    pub pool: PoolSection,
    pub confirmation: ConfirmationConfig,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    /// Risk level at or above which a human must confirm, or "none"
    pub confirm_threshold: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            mode: SecurityMode::Strict,
            confirm_threshold: "high".to_string(),
        }
    }
}

impl SecurityConfig {
    pub fn confirm_threshold(&self) -> Result<Option<RiskLevel>, ConfigError> {
        match self.confirm_threshold.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "never" => Ok(None),
            level => level
                .parse()
                .map(Some)
                .map_err(|_| invalid("security.confirm_threshold", format!("unknown level '{level}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub deadline_grace_ms: u64,
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            default_timeout_secs: limits.default_timeout.as_secs(),
            max_timeout_secs: limits.max_timeout.as_secs(),
            deadline_grace_ms: limits.deadline_grace.as_millis() as u64,
            max_output_bytes: limits.max_output_bytes,
            max_code_bytes: limits.max_code_bytes,
            memory_mb: limits.memory_bytes / (1024 * 1024),
            cpus: limits.cpus,
            pids_limit: limits.pids_limit,
        }
    }
}

impl LimitsConfig {
    pub fn to_limits(&self) -> ResourceLimits {
        ResourceLimits {
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            max_timeout: Duration::from_secs(self.max_timeout_secs),
            deadline_grace: Duration::from_millis(self.deadline_grace_ms),
            max_output_bytes: self.max_output_bytes,
            max_code_bytes: self.max_code_bytes,
            memory_bytes: self.memory_mb * 1024 * 1024,
            cpus: self.cpus,
            pids_limit: self.pids_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Base directory; each session gets a subdirectory
    pub root: PathBuf,
    pub max_file_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/workspaces"),
            max_file_bytes: cordon_sandbox::workspace::DEFAULT_MAX_FILE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessSection {
    pub enabled: bool,
    pub python: String,
    pub shell: String,
    pub node: String,
    /// Extra substrings refused by the subprocess pre-filter
    pub blocked_patterns: Vec<String>,
}

impl Default for SubprocessSection {
    fn default() -> Self {
        let interpreters = Interpreters::default();
        Self {
            enabled: true,
            python: interpreters.python,
            shell: interpreters.shell,
            node: interpreters.node,
            blocked_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSection {
    pub enabled: bool,
    /// `docker` or `podman`
    pub engine: String,
    pub image: String,
    pub name_prefix: String,
}

impl Default for ContainerSection {
    fn default() -> Self {
        let defaults = ContainerConfig::default();
        Self {
            enabled: true,
            engine: defaults.engine,
            image: defaults.image,
            name_prefix: defaults.name_prefix,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub enabled: bool,
    /// Base URL of the sandbox service. Supports ${ENV_VAR} substitution
    pub url: Option<String>,
    /// Supports ${ENV_VAR} substitution
    pub api_key: Option<String>,
    pub max_instances: usize,
    pub min_idle: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            enabled: false,
            url: None,
            api_key: None,
            max_instances: defaults.max_instances,
            min_idle: defaults.min_idle,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            sweep_interval_secs: defaults.sweep_interval.as_secs(),
            acquire_timeout_secs: defaults.acquire_timeout.as_secs(),
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_instances: self.max_instances,
            min_idle: self.min_idle,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    AutoApprove,
    #[default]
    Deny,
    Interactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    pub mode: ConfirmationMode,
    pub timeout_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            mode: ConfirmationMode::Deny,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub rules: Vec<RuleConfig>,
}

/// Operator-supplied risk rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    /// Regular expression matched against the code
    pub pattern: String,
    pub level: RiskLevel,
    /// Empty means every language
    #[serde(default)]
    pub languages: Vec<Language>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand variables like ${CORDON_POOL_KEY} in the pool endpoint and
    /// credentials. Rule patterns and blocked strings stay literal.
    fn expand_env(&mut self) -> Result<(), ConfigError> {
        for field in [&mut self.pool.url, &mut self.pool.api_key] {
            if let Some(value) = field.as_mut() {
                *value = shellexpand::env(value.as_str())
                    .map_err(|e| ConfigError::Env(e.to_string()))?
                    .into_owned();
            }
        }
        Ok(())
    }

    /// Reject values that are inconsistent with each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.security.confirm_threshold()?;

        let limits = &self.limits;
        if limits.default_timeout_secs == 0 {
            return Err(invalid("limits.default_timeout_secs", "must be positive"));
        }
        if limits.default_timeout_secs > limits.max_timeout_secs {
            return Err(invalid(
                "limits.default_timeout_secs",
                format!("{} exceeds max_timeout_secs {}", limits.default_timeout_secs, limits.max_timeout_secs),
            ));
        }
        if limits.max_output_bytes == 0 || limits.max_code_bytes == 0 {
            return Err(invalid("limits", "byte limits must be positive"));
        }
        if limits.memory_mb < 4 {
            return Err(invalid("limits.memory_mb", "must be at least 4"));
        }
        if !(limits.cpus > 0.0) {
            return Err(invalid("limits.cpus", "must be positive"));
        }
        if limits.pids_limit == 0 {
            return Err(invalid("limits.pids_limit", "must be positive"));
        }

        if self.container.enabled && self.container.engine.trim().is_empty() {
            return Err(invalid("container.engine", "must not be empty"));
        }
        if self.container.enabled && self.container.image.trim().is_empty() {
            return Err(invalid("container.image", "must not be empty"));
        }

        let pool = &self.pool;
        if pool.max_instances == 0 {
            return Err(invalid("pool.max_instances", "must be positive"));
        }
        if pool.min_idle > pool.max_instances {
            return Err(invalid(
                "pool.min_idle",
                format!("{} exceeds max_instances {}", pool.min_idle, pool.max_instances),
            ));
        }
        if pool.sweep_interval_secs == 0 {
            return Err(invalid("pool.sweep_interval_secs", "must be positive"));
        }
        if pool.enabled {
            match pool.url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => return Err(invalid("pool.url", format!("not an http(s) url: {url}"))),
                None => return Err(invalid("pool.url", "required when the pool is enabled")),
            }
        }

        if !self.subprocess.enabled && !self.container.enabled && !pool.enabled {
            return Err(invalid("backends", "at least one backend must be enabled"));
        }

        for rule in &self.risk.rules {
            if rule.name.trim().is_empty() {
                return Err(invalid("risk.rules.name", "must not be empty"));
            }
        }
        Ok(())
    }

    pub fn interpreters(&self) -> Interpreters {
        Interpreters {
            python: self.subprocess.python.clone(),
            shell: self.subprocess.shell.clone(),
            node: self.subprocess.node.clone(),
        }
    }

    pub fn subprocess_config(&self) -> SubprocessConfig {
        SubprocessConfig {
            interpreters: self.interpreters(),
            limits: self.limits.to_limits(),
            blocked_patterns: self.subprocess.blocked_patterns.clone(),
        }
    }

    pub fn container_config(&self) -> ContainerConfig {
        ContainerConfig {
            engine: self.container.engine.clone(),
            image: self.container.image.clone(),
            name_prefix: self.container.name_prefix.clone(),
            interpreters: self.interpreters(),
            limits: self.limits.to_limits(),
        }
    }

    /// Copy safe to print: secrets replaced
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.pool.api_key.is_some() {
            config.pool.api_key = Some("********".to_string());
        }
        config
    }
}
