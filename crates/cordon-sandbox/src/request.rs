//! Execution request/result data model shared by every backend

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FailureKind, SandboxError};
use crate::limits::ResourceLimits;

/// Longest accepted session identifier
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Metadata key a caller can use to ask for stronger isolation
pub const BACKEND_PREFERENCE_KEY: &str = "backend";

/// Language of a code payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// General purpose script (Python)
    Python,
    /// POSIX shell snippet
    Shell,
    JavaScript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" | "script" => Ok(Self::Python),
            "shell" | "sh" | "bash" => Ok(Self::Shell),
            "javascript" | "js" | "node" => Ok(Self::JavaScript),
            other => Err(SandboxError::Validation(format!("unknown language: {other}"))),
        }
    }
}

/// Execution backends, ordered by isolation strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child process on the host. Weakest isolation.
    Subprocess,
    /// Disposable container per call
    Container,
    /// Long-lived instance from the external sandbox service
    Pooled,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subprocess => "subprocess",
            Self::Container => "container",
            Self::Pooled => "pooled",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subprocess" | "process" => Ok(Self::Subprocess),
            "container" | "docker" => Ok(Self::Container),
            "pooled" | "pool" | "remote" => Ok(Self::Pooled),
            other => Err(SandboxError::Validation(format!("unknown backend: {other}"))),
        }
    }
}

/// Coarse, advisory classification of how dangerous a payload looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[serde(alias = "safe")]
    Safe,
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(Self::Safe),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(SandboxError::Validation(format!("unknown risk level: {other}"))),
        }
    }
}

/// Result of static inspection. Observability only; never an enforcement decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub detected_patterns: Vec<String>,
}

impl RiskAssessment {
    pub fn safe() -> Self {
        Self {
            level: RiskLevel::Safe,
            detected_patterns: Vec::new(),
        }
    }
}

/// A unit of untrusted code to run. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    code: String,
    language: Language,
    timeout: Duration,
    session_id: String,
    metadata: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, language: Language, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language,
            timeout: ResourceLimits::default().default_timeout,
            session_id: session_id.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Backend the caller asked for, if any. Only ever a preference.
    pub fn backend_preference(&self) -> Result<Option<BackendKind>, SandboxError> {
        self.metadata
            .get(BACKEND_PREFERENCE_KEY)
            .map(|b| b.parse())
            .transpose()
    }

    /// Reject malformed requests before any backend is touched
    pub fn validate(&self, limits: &ResourceLimits) -> Result<(), SandboxError> {
        validate_session_id(&self.session_id)?;

        if self.code.trim().is_empty() {
            return Err(SandboxError::Validation("code is empty".into()));
        }
        if self.code.len() > limits.max_code_bytes {
            return Err(SandboxError::Validation(format!(
                "code is {} bytes, limit is {}",
                self.code.len(),
                limits.max_code_bytes
            )));
        }
        if self.code.contains('\0') {
            return Err(SandboxError::Validation("code contains NUL bytes".into()));
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::Validation("timeout must be positive".into()));
        }
        if self.timeout > limits.max_timeout {
            return Err(SandboxError::Validation(format!(
                "timeout {}s exceeds maximum {}s",
                self.timeout.as_secs_f64(),
                limits.max_timeout.as_secs()
            )));
        }
        self.backend_preference()?;
        Ok(())
    }
}

/// Session ids end up in directory and container names
pub fn validate_session_id(session_id: &str) -> Result<(), SandboxError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SandboxError::Validation(format!(
            "session id must be 1-{MAX_SESSION_ID_LEN} characters"
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SandboxError::Validation(format!(
            "session id contains invalid characters: {session_id}"
        )));
    }
    Ok(())
}

/// Outcome of exactly one `ExecutionRequest`.
///
/// `success == true` means the code ran to a zero exit status and `error` is
/// `None`. Otherwise `error` always carries the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub sandbox_type: Option<BackendKind>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskAssessment>,
}

impl ExecutionResult {
    /// Result of code that ran to completion, successfully or not
    pub fn completed(
        backend: BackendKind,
        stdout: String,
        stderr: String,
        exit_code: i32,
        duration: Duration,
    ) -> Self {
        let success = exit_code == 0;
        Self {
            success,
            stdout,
            stderr,
            exit_code,
            error: (!success).then_some(FailureKind::ExecutionError),
            message: (!success).then(|| format!("process exited with status {exit_code}")),
            sandbox_type: Some(backend),
            duration,
            risk: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            error: Some(kind),
            message: Some(message.into()),
            sandbox_type: None,
            duration: Duration::ZERO,
            risk: None,
        }
    }

    pub fn from_error(err: &SandboxError) -> Self {
        Self::failure(err.failure_kind(), err.to_string())
    }

    pub fn timed_out(backend: BackendKind, timeout: Duration) -> Self {
        Self::failure(
            FailureKind::Timeout,
            format!("execution exceeded {}ms and was terminated", timeout.as_millis()),
        )
        .with_backend(backend)
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.sandbox_type = Some(backend);
        self
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_risk(mut self, risk: RiskAssessment) -> Self {
        self.risk = Some(risk);
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
