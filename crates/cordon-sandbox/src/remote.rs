//! HTTP client for the pooled sandbox service
//!
//! The service hosts long-lived, isolated sandbox instances. Each instance
//! exposes code execution, a file API rooted at its workspace, and a headless
//! browser. All bodies are JSON except file contents, which are raw bytes.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{FailureKind, SandboxError};
use crate::limits::ResourceLimits;
use crate::pool::InstanceProvider;
use crate::request::{BackendKind, ExecutionRequest, ExecutionResult, Language};
use crate::workspace::{check_relative, WorkspaceEntry};
use crate::Result;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ExecBody<'a> {
    language: Language,
    code: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExecStatus {
    #[default]
    Ok,
    Timeout,
    ResourceLimit,
    Error,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    status: ExecStatus,
    #[serde(default)]
    message: Option<String>,
}

/// A page fetched by the instance's browser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: u16,
}

/// Handle to one sandbox instance hosted by the service
#[derive(Debug, Clone)]
pub struct RemoteSandbox {
    http: reqwest::Client,
    base_url: String,
    id: String,
    api_key: Option<String>,
    /// Added to the request timeout before the client gives up on the service
    client_grace: Duration,
}

impl RemoteSandbox {
    pub fn new(http: reqwest::Client, base_url: &str, id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            id: id.into(),
            api_key,
            client_grace: ResourceLimits::default().client_grace(),
        }
    }

    pub fn with_client_grace(mut self, grace: Duration) -> Self {
        self.client_grace = grace;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/v1/sandboxes/{}{}", self.base_url, self.id, path);
        authorized(self.http.request(method, url), self.api_key.as_deref())
    }

    /// Run code inside the instance
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let timeout = request.timeout();
        let body = ExecBody {
            language: request.language(),
            code: request.code(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let started = Instant::now();
        let sent = self
            .request(Method::POST, "/exec")
            .timeout(timeout + self.client_grace)
            .json(&body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(instance = %self.id, "service did not answer before the deadline, killing");
                if let Err(kill_err) = self.kill().await {
                    debug!(instance = %self.id, "kill after timeout failed: {}", kill_err);
                }
                return Ok(ExecutionResult::timed_out(BackendKind::Pooled, timeout).with_duration(started.elapsed()));
            }
            Err(e) => return Err(transport_error(e)),
        };
        let parsed: ExecResponse = checked(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::InvalidState(format!("malformed exec response: {e}")))?;
        let elapsed = started.elapsed();

        Ok(match parsed.status {
            ExecStatus::Ok => {
                ExecutionResult::completed(BackendKind::Pooled, parsed.stdout, parsed.stderr, parsed.exit_code, elapsed)
            }
            ExecStatus::Timeout => ExecutionResult::timed_out(BackendKind::Pooled, timeout)
                .with_output(parsed.stdout, parsed.stderr)
                .with_duration(elapsed),
            ExecStatus::ResourceLimit => ExecutionResult::failure(
                FailureKind::ResourceLimit,
                parsed
                    .message
                    .unwrap_or_else(|| "instance resource limit exceeded".to_string()),
            )
            .with_backend(BackendKind::Pooled)
            .with_output(parsed.stdout, parsed.stderr)
            .with_duration(elapsed),
            ExecStatus::Error => {
                let mut result = ExecutionResult::failure(
                    FailureKind::ExecutionError,
                    parsed.message.unwrap_or_else(|| "execution failed".to_string()),
                )
                .with_backend(BackendKind::Pooled)
                .with_output(parsed.stdout, parsed.stderr)
                .with_duration(elapsed);
                result.exit_code = parsed.exit_code;
                result
            }
        })
    }

    /// Kill whatever is running in the instance
    pub async fn kill(&self) -> Result<()> {
        let response = self
            .request(Method::POST, "/kill")
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        checked(response).await?;
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = relative_path(path)?;
        let response = self
            .request(Method::GET, "/files")
            .query(&[("path", path.as_str())])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        let bytes = checked(response).await?.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = relative_path(path)?;
        if path.is_empty() {
            return Err(SandboxError::Validation("cannot write to the workspace root".into()));
        }
        let response = self
            .request(Method::PUT, "/files")
            .query(&[("path", path.as_str())])
            .timeout(CONTROL_TIMEOUT)
            .body(data.to_vec())
            .send()
            .await
            .map_err(transport_error)?;
        checked(response).await?;
        Ok(())
    }

    pub async fn list_files(&self, path: &str) -> Result<Vec<WorkspaceEntry>> {
        let path = relative_path(path)?;
        let response = self
            .request(Method::GET, "/files/list")
            .query(&[("path", path.as_str())])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        checked(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::InvalidState(format!("malformed listing: {e}")))
    }

    /// Load `url` in the instance's browser and return the rendered page
    pub async fn browse(&self, url: &str) -> Result<BrowserPage> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SandboxError::Validation(format!("unsupported url: {url}")));
        }
        let response = self
            .request(Method::POST, "/browser/navigate")
            .timeout(CONTROL_TIMEOUT * 3)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(transport_error)?;
        checked(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::InvalidState(format!("malformed browser response: {e}")))
    }
}

fn authorized(builder: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => builder.bearer_auth(key),
        None => builder,
    }
}

/// Lexically validate a path and render it with forward slashes
fn relative_path(path: &str) -> Result<String> {
    let normalized = check_relative(path)?;
    let parts: Vec<String> = normalized
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn transport_error(e: reqwest::Error) -> SandboxError {
    SandboxError::unavailable(BackendKind::Pooled, e.to_string())
}

/// Map non-success statuses onto the error taxonomy
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let text = text.trim();
    Err(match status {
        StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => SandboxError::Validation(text.to_string()),
        StatusCode::FORBIDDEN => SandboxError::PathTraversal(text.into()),
        StatusCode::UNAUTHORIZED => SandboxError::unavailable(BackendKind::Pooled, "service rejected credentials"),
        StatusCode::NOT_FOUND => SandboxError::unavailable(BackendKind::Pooled, format!("not found: {text}")),
        s if s.is_server_error() => SandboxError::unavailable(BackendKind::Pooled, format!("service returned {s}: {text}")),
        s => SandboxError::InvalidState(format!("unexpected status {s}: {text}")),
    })
}

#[derive(Debug, Serialize)]
struct ProvisionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    memory_mb: u64,
    cpus: f64,
    network: bool,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    id: String,
}

/// Creates and destroys instances through the service's control API
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    limits: ResourceLimits,
}

impl HttpProvisioner {
    pub fn new(base_url: &str, api_key: Option<String>, limits: ResourceLimits) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| SandboxError::InvalidState(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            limits,
        })
    }

    /// `GET /health`
    pub async fn health(&self) -> bool {
        let request = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(3));
        match authorized(request, self.api_key.as_deref()).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("sandbox service health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl InstanceProvider for HttpProvisioner {
    async fn provision(&self, session_id: Option<&str>) -> Result<RemoteSandbox> {
        let body = ProvisionBody {
            session_id,
            memory_mb: self.limits.memory_bytes / (1024 * 1024),
            cpus: self.limits.cpus,
            network: false,
        };
        let request = self
            .http
            .post(format!("{}/v1/sandboxes", self.base_url))
            .timeout(CONTROL_TIMEOUT * 6)
            .json(&body);
        let response = authorized(request, self.api_key.as_deref())
            .send()
            .await
            .map_err(transport_error)?;
        let created: ProvisionResponse = checked(response)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::InvalidState(format!("malformed provision response: {e}")))?;
        debug!(instance = %created.id, session = ?session_id, "instance provisioned");
        Ok(RemoteSandbox::new(self.http.clone(), &self.base_url, created.id, self.api_key.clone())
            .with_client_grace(self.limits.client_grace()))
    }

    async fn destroy(&self, instance: &RemoteSandbox) -> Result<()> {
        let response = instance
            .request(Method::DELETE, "")
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        match checked(response).await {
            Ok(_) => Ok(()),
            // already gone
            Err(SandboxError::BackendUnavailable { reason, .. }) if reason.starts_with("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn is_available(&self) -> bool {
        self.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sandbox(server: &MockServer) -> RemoteSandbox {
        RemoteSandbox::new(reqwest::Client::new(), &server.uri(), "sb-1", Some("secret".into()))
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"language": "python", "code": "print(1)"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "1\n", "stderr": "", "exit_code": 0, "status": "ok"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let req = ExecutionRequest::new("s1", Language::Python, "print(1)");
        let result = sandbox(&server).await.execute(&req).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "1\n");
        assert_eq!(result.sandbox_type, Some(BackendKind::Pooled));
    }

    #[tokio::test]
    async fn test_execute_remote_timeout_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "stdout": "partial", "exit_code": -1, "status": "timeout"
            })))
            .mount(&server)
            .await;

        let req = ExecutionRequest::new("s1", Language::Python, "while True: pass");
        let result = sandbox(&server).await.execute(&req).await.unwrap();
        assert_eq!(result.error, Some(FailureKind::Timeout));
        assert_eq!(result.stdout, "partial");
    }

    #[tokio::test]
    async fn test_client_deadline_kills_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/kill"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let req = ExecutionRequest::new("s1", Language::Python, "import time; time.sleep(60)")
            .with_timeout(Duration::from_millis(200));
        let result = sandbox(&server).await.execute(&req).await.unwrap();
        assert_eq!(result.error, Some(FailureKind::Timeout));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let req = ExecutionRequest::new("s1", Language::Shell, "ls");
        let err = sandbox(&server).await.execute(&req).await.unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let sb = RemoteSandbox::new(reqwest::Client::new(), "http://127.0.0.1:1", "sb-1", None);
        let req = ExecutionRequest::new("s1", Language::Shell, "ls");
        let err = sb.execute(&req).await.unwrap_err();
        assert!(matches!(err, SandboxError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_file_roundtrip_uses_relative_paths() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/sandboxes/sb-1/files"))
            .and(query_param("path", "data/in.txt"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/sandboxes/sb-1/files"))
            .and(query_param("path", "data/in.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let sb = sandbox(&server).await;
        sb.write_file("./data/in.txt", b"hello").await.unwrap();
        assert_eq!(sb.read_file("data/in.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sb = sandbox(&server).await;
        for bad in ["../secret", "/etc/passwd", "a/../../b"] {
            let err = sb.read_file(bad).await.unwrap_err();
            assert!(matches!(err, SandboxError::PathTraversal(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_browse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/browser/navigate"))
            .and(body_partial_json(serde_json::json!({"url": "https://example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://example.com", "title": "Example", "content": "hi", "status": 200
            })))
            .mount(&server)
            .await;

        let page = sandbox(&server).await.browse("https://example.com").await.unwrap();
        assert_eq!(page.title, "Example");
        assert!(sandbox(&server).await.browse("file:///etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_provision_and_destroy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .and(body_partial_json(serde_json::json!({"session_id": "s1", "network": false})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "sb-9"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sb-9"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let provisioner = HttpProvisioner::new(&server.uri(), None, ResourceLimits::default()).unwrap();
        let instance = provisioner.provision(Some("s1")).await.unwrap();
        assert_eq!(instance.id(), "sb-9");
        provisioner.destroy(&instance).await.unwrap();
    }
}
