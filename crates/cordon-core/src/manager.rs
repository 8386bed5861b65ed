//! Execution orchestration
//!
//! Per request: validate, assess risk, optionally ask for confirmation, pick a
//! backend through [`required_backend`], run it under a hard deadline. Every
//! outcome, including internal failures, comes back as an `ExecutionResult`.
//!
//! The deadline is the request timeout plus `deadline_grace`, plus whatever
//! queueing allowance the backend declares (the pool's `acquire_timeout`), so a
//! call waiting behind its own session still gets its full timeout.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use cordon_sandbox::{
    BackendKind, ContainerExecutor, ExecutionRequest, ExecutionResult, Executor, FailureKind, HttpProvisioner,
    Pool, PooledExecutor, ResourceLimits, RiskAssessment, RiskLevel, SandboxError, SubprocessExecutor, Workspaces,
};

use crate::config::{Config, ConfirmationMode};
use crate::confirm::{AutoConfirm, ChannelConfirmation, ConfirmationInbox, ConfirmationService};
use crate::risk::{required_backend, BackendDecision, RiskPolicy, SecurityMode};
use crate::Result;

const CONFIRM_ACTION: &str = "execute_code";

/// One backend call under the outer deadline
type Attempt = std::result::Result<cordon_sandbox::Result<ExecutionResult>, tokio::time::error::Elapsed>;
const CODE_PREVIEW_CHARS: usize = 400;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    Received,
    RiskAssessed,
    ConfirmationPending,
    BackendSelected,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::RiskAssessed => "risk_assessed",
            Self::ConfirmationPending => "confirmation_pending",
            Self::BackendSelected => "backend_selected",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn stage(stage: ExecutionStage) {
    debug!(%stage, "execution stage");
}

pub struct Manager {
    policy: RiskPolicy,
    mode: SecurityMode,
    confirm_threshold: Option<RiskLevel>,
    limits: ResourceLimits,
    confirmation: Arc<dyn ConfirmationService>,
    executors: HashMap<BackendKind, Arc<dyn Executor>>,
    workspaces: Workspaces,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// Wire every enabled backend from configuration. With interactive
    /// confirmation the returned inbox must be served by the caller.
    pub fn from_config(config: &Config) -> Result<(Self, Option<ConfirmationInbox>)> {
        config.validate()?;
        let limits = config.limits.to_limits();
        let workspaces =
            Workspaces::new(&config.workspace.root).with_max_file_bytes(config.workspace.max_file_bytes);

        let mut builder = ManagerBuilder::default()
            .policy(RiskPolicy::with_rules(&config.risk.rules)?)
            .mode(config.security.mode)
            .confirm_threshold(config.security.confirm_threshold()?)
            .limits(limits.clone())
            .workspaces(workspaces.clone());

        if config.subprocess.enabled {
            builder = builder.executor(Arc::new(SubprocessExecutor::new(
                config.subprocess_config(),
                workspaces.clone(),
            )));
        }
        if config.container.enabled {
            builder = builder.executor(Arc::new(ContainerExecutor::new(
                config.container_config(),
                workspaces.clone(),
            )));
        }
        if config.pool.enabled {
            if let Some(url) = config.pool.url.as_deref() {
                let provisioner = HttpProvisioner::new(url, config.pool.api_key.clone(), limits)?;
                let pool = Pool::new(config.pool.to_pool_config(), Arc::new(provisioner));
                pool.start();
                builder = builder.executor(Arc::new(PooledExecutor::new(pool)));
            }
        }

        let timeout = Duration::from_secs(config.confirmation.timeout_secs);
        let (builder, inbox) = match config.confirmation.mode {
            ConfirmationMode::AutoApprove => (builder.confirmation(Arc::new(AutoConfirm::approve())), None),
            ConfirmationMode::Deny => (builder.confirmation(Arc::new(AutoConfirm::deny())), None),
            ConfirmationMode::Interactive => {
                let (service, inbox) = ChannelConfirmation::new(timeout);
                (builder.confirmation(Arc::new(service)), Some(inbox))
            }
        };
        Ok((builder.build()?, inbox))
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn policy(&self) -> &RiskPolicy {
        &self.policy
    }

    /// Direct file access for tools working outside code execution
    pub fn workspaces(&self) -> &Workspaces {
        &self.workspaces
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn assess(&self, request: &ExecutionRequest) -> RiskAssessment {
        self.policy.assess(request.code(), request.language())
    }

    /// Backend a request would be routed to, without running it
    pub fn select_backend(&self, request: &ExecutionRequest) -> Result<BackendDecision> {
        let preference = request.backend_preference()?;
        Ok(required_backend(&self.assess(request), self.mode, preference))
    }

    /// Run one request. Always returns a well-formed result.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let span = info_span!(
            "execute",
            request_id = %Uuid::new_v4(),
            session = request.session_id(),
            language = %request.language(),
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        stage(ExecutionStage::Received);
        let started = Instant::now();

        if let Err(e) = request.validate(&self.limits) {
            warn!("rejected request: {}", e);
            stage(ExecutionStage::Failed);
            return ExecutionResult::from_error(&e);
        }
        let preference = match request.backend_preference() {
            Ok(preference) => preference,
            Err(e) => return ExecutionResult::from_error(&e),
        };

        let assessment = self.assess(request);
        stage(ExecutionStage::RiskAssessed);
        if assessment.level > RiskLevel::Safe {
            info!(
                level = %assessment.level,
                patterns = ?assessment.detected_patterns,
                "risky code detected"
            );
        }

        if self.confirm_threshold.is_some_and(|t| assessment.level >= t) {
            stage(ExecutionStage::ConfirmationPending);
            let details = confirmation_details(request, &assessment);
            if !self.confirmation.request(CONFIRM_ACTION, &details).await {
                warn!(level = %assessment.level, "execution denied at confirmation gate");
                stage(ExecutionStage::Failed);
                return ExecutionResult::failure(
                    FailureKind::ConfirmationDenied,
                    format!("{} risk execution was not confirmed", assessment.level),
                )
                .with_risk(assessment)
                .with_duration(started.elapsed());
            }
        }

        let decision = required_backend(&assessment, self.mode, preference);
        stage(ExecutionStage::BackendSelected);
        debug!(backend = %decision.kind(), fallback = ?decision.fallback(), "backend selected");

        stage(ExecutionStage::Executing);
        let budget = self.limits.deadline_for(request.timeout()) + self.queue_allowance(&decision);
        let deadline = tokio::time::Instant::now() + budget;
        let (backend, attempt) = self.dispatch(&decision, request, deadline).await;
        let result = match attempt {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(backend = %backend, "execution failed: {}", e);
                let mut result = ExecutionResult::from_error(&e);
                if let SandboxError::BackendUnavailable { backend, .. } = &e {
                    result.sandbox_type = Some(*backend);
                }
                result.with_duration(started.elapsed())
            }
            Err(_) => {
                // dropping the executor future killed whatever was running
                warn!(backend = %backend, budget_ms = budget.as_millis() as u64, "hard deadline reached");
                ExecutionResult::timed_out(backend, request.timeout()).with_duration(started.elapsed())
            }
        };

        stage(if result.success {
            ExecutionStage::Completed
        } else {
            ExecutionStage::Failed
        });
        info!(
            success = result.success,
            backend = ?result.sandbox_type,
            error = ?result.error,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        );
        result.with_risk(assessment)
    }

    /// Run on the decided backend, then on its fallback if the first one is
    /// unavailable. Both share one deadline. Returns the backend that ran last.
    async fn dispatch(
        &self,
        decision: &BackendDecision,
        request: &ExecutionRequest,
        deadline: tokio::time::Instant,
    ) -> (BackendKind, Attempt) {
        let primary = decision.kind();
        let attempt = tokio::time::timeout_at(deadline, self.run_on(primary, request)).await;
        match (attempt, decision.fallback()) {
            (Ok(Err(e)), Some(fallback)) if e.failure_kind() == FailureKind::BackendUnavailable => {
                warn!(from = %primary, to = %fallback, "backend unavailable, falling back: {}", e);
                let attempt = tokio::time::timeout_at(deadline, self.run_on(fallback, request)).await;
                (fallback, attempt)
            }
            (attempt, _) => (primary, attempt),
        }
    }

    /// Longest time the candidate backends may keep a call queued
    fn queue_allowance(&self, decision: &BackendDecision) -> Duration {
        std::iter::once(decision.kind())
            .chain(decision.fallback())
            .filter_map(|kind| self.executors.get(&kind))
            .map(|executor| executor.queue_allowance())
            .max()
            .unwrap_or_default()
    }

    async fn run_on(&self, kind: BackendKind, request: &ExecutionRequest) -> cordon_sandbox::Result<ExecutionResult> {
        match self.executors.get(&kind) {
            Some(executor) => executor.execute(request).await,
            None => Err(SandboxError::unavailable(kind, "backend not configured")),
        }
    }

    /// Release everything a session holds: pool entry, lingering containers.
    /// The session workspace is left for the caller to remove.
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        cordon_sandbox::validate_session_id(session_id)?;
        let mut first_error = None;
        for (kind, executor) in &self.executors {
            if let Err(e) = executor.cleanup_session(session_id).await {
                warn!(backend = %kind, session = session_id, "session cleanup failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        info!(session = session_id, "session cleaned up");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Tear down every backend, including the pool
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;
        for (kind, executor) in &self.executors {
            if let Err(e) = executor.cleanup().await {
                warn!(backend = %kind, "backend cleanup failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        info!("manager shut down");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

fn confirmation_details(request: &ExecutionRequest, assessment: &RiskAssessment) -> BTreeMap<String, String> {
    let mut preview: String = request.code().chars().take(CODE_PREVIEW_CHARS).collect();
    if preview.len() < request.code().len() {
        preview.push_str("...");
    }
    BTreeMap::from([
        ("session_id".to_string(), request.session_id().to_string()),
        ("language".to_string(), request.language().to_string()),
        ("risk_level".to_string(), assessment.level.to_string()),
        ("patterns".to_string(), assessment.detected_patterns.join(", ")),
        ("code".to_string(), preview),
    ])
}

/// Assembles a [`Manager`] from parts
pub struct ManagerBuilder {
    policy: Option<RiskPolicy>,
    mode: SecurityMode,
    confirm_threshold: Option<RiskLevel>,
    limits: ResourceLimits,
    confirmation: Option<Arc<dyn ConfirmationService>>,
    executors: HashMap<BackendKind, Arc<dyn Executor>>,
    workspaces: Option<Workspaces>,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            policy: None,
            mode: SecurityMode::Strict,
            confirm_threshold: Some(RiskLevel::High),
            limits: ResourceLimits::default(),
            confirmation: None,
            executors: HashMap::new(),
            workspaces: None,
        }
    }
}

impl ManagerBuilder {
    pub fn policy(mut self, policy: RiskPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn mode(mut self, mode: SecurityMode) -> Self {
        self.mode = mode;
        self
    }

    /// `None` disables the confirmation gate
    pub fn confirm_threshold(mut self, threshold: Option<RiskLevel>) -> Self {
        self.confirm_threshold = threshold;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn confirmation(mut self, service: Arc<dyn ConfirmationService>) -> Self {
        self.confirmation = Some(service);
        self
    }

    /// Register a backend, replacing any earlier one of the same kind
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn workspaces(mut self, workspaces: Workspaces) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    pub fn build(self) -> Result<Manager> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => RiskPolicy::new()?,
        };
        Ok(Manager {
            policy,
            mode: self.mode,
            confirm_threshold: self.confirm_threshold,
            limits: self.limits,
            // unanswered confirmations deny
            confirmation: self.confirmation.unwrap_or_else(|| Arc::new(AutoConfirm::deny())),
            executors: self.executors,
            workspaces: self
                .workspaces
                .unwrap_or_else(|| Workspaces::new(std::env::temp_dir().join("cordon-workspaces"))),
        })
    }
}
