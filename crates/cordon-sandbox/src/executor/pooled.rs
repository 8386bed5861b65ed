//! Pooled backend: executes on a session-affine remote instance

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::Executor;
use crate::error::SandboxError;
use crate::pool::{Pool, PoolLease};
use crate::remote::BrowserPage;
use crate::request::{BackendKind, ExecutionRequest, ExecutionResult};
use crate::workspace::WorkspaceEntry;
use crate::Result;

/// Lease held while code runs remotely. Dropped before the call returns, the
/// instance may still be running it: kill it and give the instance up.
struct InFlight(Option<PoolLease>);

impl InFlight {
    fn complete(mut self) -> Option<PoolLease> {
        self.0.take()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(lease) = self.0.take() else { return };
        let sandbox = lease.shared_sandbox();
        warn!(instance = sandbox.id(), "pooled call abandoned, killing instance");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sandbox.kill().await {
                        debug!(instance = sandbox.id(), "kill of abandoned call failed: {}", e);
                    }
                    lease.discard();
                });
            }
            Err(_) => lease.discard(),
        }
    }
}

pub struct PooledExecutor {
    pool: Arc<Pool>,
}

impl PooledExecutor {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let lease = self.pool.acquire(session_id).await?;
        lease.sandbox().read_file(path).await
    }

    pub async fn write_file(&self, session_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let lease = self.pool.acquire(session_id).await?;
        lease.sandbox().write_file(path, data).await
    }

    pub async fn list_files(&self, session_id: &str, path: &str) -> Result<Vec<WorkspaceEntry>> {
        let lease = self.pool.acquire(session_id).await?;
        lease.sandbox().list_files(path).await
    }

    /// Browse from inside the session's instance
    pub async fn browse(&self, session_id: &str, url: &str) -> Result<BrowserPage> {
        let lease = self.pool.acquire(session_id).await?;
        lease.sandbox().browse(url).await
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    fn kind(&self) -> BackendKind {
        BackendKind::Pooled
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let lease = self.pool.acquire(request.session_id()).await?;
        let sandbox = lease.shared_sandbox();
        debug!(session = request.session_id(), instance = sandbox.id(), "executing on pooled instance");

        let in_flight = InFlight(Some(lease));
        let outcome = sandbox.execute(request).await;
        let Some(lease) = in_flight.complete() else {
            return outcome;
        };
        match outcome {
            Ok(result) => {
                lease.release();
                Ok(result)
            }
            Err(e @ SandboxError::BackendUnavailable { .. }) => {
                warn!(instance = sandbox.id(), "dropping unresponsive instance: {}", e);
                lease.discard();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn queue_allowance(&self) -> Duration {
        self.pool.config().acquire_timeout
    }

    async fn cleanup_session(&self, session_id: &str) -> Result<()> {
        self.pool.remove(session_id).await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.pool.is_available().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;
    use crate::pool::PoolConfig;
    use crate::remote::HttpProvisioner;
    use crate::request::Language;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn executor(server: &MockServer) -> PooledExecutor {
        let provider = HttpProvisioner::new(&server.uri(), None, ResourceLimits::default()).unwrap();
        PooledExecutor::new(Pool::new(PoolConfig::default(), Arc::new(provider)))
    }

    #[tokio::test]
    async fn test_session_reuses_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "ok\n", "exit_code": 0, "status": "ok"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let exec = executor(&server).await;
        for _ in 0..2 {
            let req = ExecutionRequest::new("s1", Language::Python, "print('ok')");
            let result = exec.execute(&req).await.unwrap();
            assert!(result.success);
        }
    }

    #[tokio::test]
    async fn test_unavailable_instance_is_discarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sb-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let exec = executor(&server).await;
        let req = ExecutionRequest::new("s1", Language::Python, "print(1)");
        let err = exec.execute(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable { .. }));
        assert_eq!(exec.pool().state("s1"), None);
    }

    #[tokio::test]
    async fn test_abandoned_call_kills_and_discards_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-1"})))
            .mount(&server)
            .await;
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
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sb-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let exec = executor(&server).await;
        let req = ExecutionRequest::new("s1", Language::Python, "import time; time.sleep(60)");
        let abandoned = tokio::time::timeout(Duration::from_millis(300), exec.execute(&req)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(exec.pool().state("s1"), None);
    }

    #[test]
    fn test_queue_allowance_is_acquire_timeout() {
        let provider = HttpProvisioner::new("http://127.0.0.1:1", None, ResourceLimits::default()).unwrap();
        let config = PoolConfig {
            acquire_timeout: Duration::from_secs(7),
            ..Default::default()
        };
        let exec = PooledExecutor::new(Pool::new(config, Arc::new(provider)));
        assert_eq!(exec.queue_allowance(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_cleanup_session_destroys_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-7"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/sandboxes/sb-7/files/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sb-7"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let exec = executor(&server).await;
        assert!(exec.list_files("s1", "").await.unwrap().is_empty());
        exec.cleanup_session("s1").await.unwrap();
        assert_eq!(exec.pool().state("s1"), None);
    }
}
