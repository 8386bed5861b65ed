//! End-to-end behaviour of the manager over real backends

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cordon_core::{AutoConfirm, Manager, SecurityMode};
use cordon_sandbox::{
    BackendKind, EntryState, ExecutionRequest, ExecutionResult, Executor, FailureKind, HttpProvisioner, Language, Pool,
    PoolConfig, PooledExecutor, ResourceLimits, RiskLevel, SandboxError, SubprocessConfig, SubprocessExecutor,
    Workspaces,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CountingContainer {
    calls: AtomicUsize,
}

#[async_trait]
impl Executor for CountingContainer {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(&self, _request: &ExecutionRequest) -> cordon_sandbox::Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SandboxError::unavailable(BackendKind::Container, "not in this test"))
    }

    async fn cleanup(&self) -> cordon_sandbox::Result<()> {
        Ok(())
    }
}

fn subprocess_manager(dir: &tempfile::TempDir, mode: SecurityMode) -> (Manager, Arc<CountingContainer>) {
    let workspaces = Workspaces::new(dir.path());
    let container = Arc::new(CountingContainer {
        calls: AtomicUsize::new(0),
    });
    let manager = Manager::builder()
        .mode(mode)
        .workspaces(workspaces.clone())
        .executor(Arc::new(SubprocessExecutor::new(SubprocessConfig::default(), workspaces)))
        .executor(container.clone())
        .build()
        .unwrap();
    (manager, container)
}

#[cfg(unix)]
#[tokio::test]
async fn test_safe_shell_runs_in_session_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, container) = subprocess_manager(&dir, SecurityMode::Strict);

    let result = manager
        .execute(&ExecutionRequest::new("s1", Language::Shell, "echo hello"))
        .await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.sandbox_type, Some(BackendKind::Subprocess));
    assert_eq!(result.risk.as_ref().map(|r| r.level), Some(RiskLevel::Safe));

    manager.workspaces().write("s1", "notes.txt", b"kept").unwrap();
    let result = manager.execute(&ExecutionRequest::new("s1", Language::Shell, "ls")).await;
    assert!(result.stdout.contains("notes.txt"), "{result:?}");
    assert_eq!(container.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_critical_code_denied_before_any_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, container) = subprocess_manager(&dir, SecurityMode::Strict);

    let req = ExecutionRequest::new("s1", Language::Python, "eval(input())");
    let result = manager.execute(&req).await;
    assert!(!result.success);
    assert_eq!(result.error, Some(FailureKind::ConfirmationDenied));
    assert_eq!(result.risk.map(|r| r.level), Some(RiskLevel::Critical));
    assert_eq!(container.calls.load(Ordering::SeqCst), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_infinite_loop_is_killed_at_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = subprocess_manager(&dir, SecurityMode::Permissive);

    let started = Instant::now();
    let req = ExecutionRequest::new("loop", Language::Shell, "while true; do :; done")
        .with_timeout(Duration::from_secs(2));
    let result = manager.execute(&req).await;
    assert_eq!(result.error, Some(FailureKind::Timeout));
    assert_eq!(result.sandbox_type, Some(BackendKind::Subprocess));
    assert!(result.error.unwrap().is_retryable());
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_pooled_session_serializes_and_provisions_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"stdout": "ok\n", "exit_code": 0, "status": "ok"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let provisioner = HttpProvisioner::new(&server.uri(), None, ResourceLimits::default()).unwrap();
    let pool = Pool::new(PoolConfig::default(), Arc::new(provisioner));
    let manager = Manager::builder()
        .executor(Arc::new(PooledExecutor::new(pool.clone())))
        .confirmation(Arc::new(AutoConfirm::deny()))
        .build()
        .unwrap();

    let req = ExecutionRequest::new("shared", Language::Python, "print('ok')").with_metadata("backend", "pooled");
    let started = Instant::now();
    let (a, b) = tokio::join!(manager.execute(&req), manager.execute(&req));
    assert!(a.success && b.success, "{a:?} {b:?}");
    assert_eq!(a.sandbox_type, Some(BackendKind::Pooled));
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(pool.stats().sessions, 1);
}

fn pooled_manager(server: &MockServer, limits: ResourceLimits, pool_config: PoolConfig) -> (Manager, Arc<Pool>) {
    let provisioner = HttpProvisioner::new(&server.uri(), None, limits.clone()).unwrap();
    let pool = Pool::new(pool_config, Arc::new(provisioner));
    let manager = Manager::builder()
        .executor(Arc::new(PooledExecutor::new(pool.clone())))
        .limits(limits)
        .build()
        .unwrap();
    (manager, pool)
}

async fn mount_provision(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({"id": "sb-1"}))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_queued_session_call_gets_full_timeout() {
    let server = MockServer::start().await;
    mount_provision(&server, Duration::ZERO).await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"stdout": "ok\n", "exit_code": 0, "status": "ok"}))
                .set_delay(Duration::from_millis(600)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let limits = ResourceLimits {
        deadline_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let (manager, _pool) = pooled_manager(&server, limits, PoolConfig::default());
    let req = ExecutionRequest::new("shared", Language::Python, "print('ok')")
        .with_metadata("backend", "pooled")
        .with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let (a, b) = tokio::join!(manager.execute(&req), manager.execute(&req));
    assert!(a.success, "{a:?}");
    assert!(b.success, "{b:?}");
    assert!(started.elapsed() >= Duration::from_millis(1200));
}

#[tokio::test]
async fn test_deadline_during_provisioning_leaves_session_usable() {
    let server = MockServer::start().await;
    mount_provision(&server, Duration::from_millis(800)).await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"stdout": "ok\n", "exit_code": 0, "status": "ok"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let limits = ResourceLimits {
        deadline_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let pool_config = PoolConfig {
        acquire_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let (manager, pool) = pooled_manager(&server, limits, pool_config);

    let req = ExecutionRequest::new("slow", Language::Python, "print('ok')")
        .with_metadata("backend", "pooled")
        .with_timeout(Duration::from_millis(200));
    let first = manager.execute(&req).await;
    assert_eq!(first.error, Some(FailureKind::Timeout));
    assert_eq!(first.sandbox_type, Some(BackendKind::Pooled));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.state("slow"), Some(EntryState::Idle));

    let second = manager
        .execute(&req.clone().with_timeout(Duration::from_secs(3)))
        .await;
    assert!(second.success, "{second:?}");
}

#[tokio::test]
async fn test_pooled_timeout_kills_remote_call() {
    let server = MockServer::start().await;
    mount_provision(&server, Duration::ZERO).await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/exec"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sandboxes/sb-1/kill"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (manager, _pool) = pooled_manager(&server, ResourceLimits::default(), PoolConfig::default());
    let req = ExecutionRequest::new("spin", Language::Python, "while True: pass")
        .with_metadata("backend", "pooled")
        .with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let result = manager.execute(&req).await;
    assert_eq!(result.error, Some(FailureKind::Timeout));
    assert_eq!(result.sandbox_type, Some(BackendKind::Pooled));
    assert!(started.elapsed() < Duration::from_millis(1800), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_workspace_traversal_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = subprocess_manager(&dir, SecurityMode::Strict);

    let err = manager
        .workspaces()
        .write("s1", "../../etc/passwd", b"root::0:0")
        .unwrap_err();
    assert!(matches!(err, SandboxError::PathTraversal(_)), "{err:?}");
    assert!(!dir.path().join("etc").exists());
    assert!(!dir.path().parent().unwrap().join("etc").join("passwd").exists());
}

#[tokio::test]
async fn test_strict_unavailable_container_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, container) = subprocess_manager(&dir, SecurityMode::Strict);

    let result = manager
        .execute(&ExecutionRequest::new("s1", Language::Python, "import sys\nprint(sys.version)"))
        .await;
    assert_eq!(result.error, Some(FailureKind::BackendUnavailable));
    assert_eq!(result.sandbox_type, Some(BackendKind::Container));
    assert_eq!(container.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cleanup_rejects_bad_session() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = subprocess_manager(&dir, SecurityMode::Strict);
    assert!(manager.cleanup("../x").await.is_err());
    assert!(manager.cleanup("s1").await.is_ok());
}
