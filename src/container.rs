//! A single disposable sandbox container.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::CLIENT_TIMEOUT_MARGIN,
    engine::EngineClient,
    error::{Result, SandboxError},
    job::{ExecutionResult, Job},
    protocol::{ErrorResponse, ExecuteRequest},
};

/// Lifecycle of a container, from the engine request to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Requested,
    Started,
    AddressResolved,
    Settling,
    Ready,
    Executing,
    Destroying,
    Terminated,
}

impl LifecycleState {
    // Valid transitions:
    //   Requested → Started → AddressResolved → Settling → Ready → Executing
    //   any state except Terminated → Destroying
    //   Destroying → Terminated
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Requested, Started) |
                (Started, AddressResolved) |
                (AddressResolved, Settling) |
                (Settling, Ready) |
                (Ready, Executing) |
                (Destroying, Terminated)
        ) || (next == Destroying && !matches!(self, Destroying | Terminated))
    }

    /// States a container passes through before it is registered as Ready.
    pub fn is_booting(self) -> bool {
        matches!(
            self,
            LifecycleState::Requested |
                LifecycleState::Started |
                LifecycleState::AddressResolved |
                LifecycleState::Settling
        )
    }
}

struct ContainerInner {
    state: LifecycleState,
    address: String,
    cleaned_up: bool,
}

/// Handle to one provisioned sandbox container.
///
/// The engine handle is exclusively owned: nothing else stops or removes the
/// underlying instance.
pub struct Container {
    id: String,
    handle: String,
    engine: Arc<dyn EngineClient>,
    http: reqwest::Client,
    executor_port: u16,
    scratch_dir: Option<PathBuf>,
    inner: Mutex<ContainerInner>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn new(
        id: String,
        handle: String,
        engine: Arc<dyn EngineClient>,
        http: reqwest::Client,
        executor_port: u16,
        scratch_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            handle,
            engine,
            http,
            executor_port,
            scratch_dir,
            inner: Mutex::new(ContainerInner {
                state: LifecycleState::Requested,
                address: String::new(),
                cleaned_up: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    pub async fn address(&self) -> String {
        self.inner.lock().await.address.clone()
    }

    pub async fn is_cleaned_up(&self) -> bool {
        self.inner.lock().await.cleaned_up
    }

    pub async fn transition(&self, to: LifecycleState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.state.can_transition_to(to) {
            return Err(SandboxError::InvalidTransition {
                from: inner.state,
                to,
            });
        }
        debug!(container_id = %self.id, from = ?inner.state, to = ?to, "Container state transition");
        inner.state = to;
        Ok(())
    }

    /// Records the resolved address and moves to `AddressResolved`.
    pub async fn resolve_address(&self, address: String) -> Result<()> {
        if address.is_empty() {
            return Err(SandboxError::AddressResolution {
                reason: format!("engine reported an empty address for {}", self.handle),
            });
        }
        let mut inner = self.inner.lock().await;
        if !inner.state.can_transition_to(LifecycleState::AddressResolved) {
            return Err(SandboxError::InvalidTransition {
                from: inner.state,
                to: LifecycleState::AddressResolved,
            });
        }
        inner.state = LifecycleState::AddressResolved;
        inner.address = address;
        Ok(())
    }

    fn endpoint(&self, address: &str) -> String {
        format!("http://{}:{}/", address, self.executor_port)
    }

    /// Sends the job to the executor service and classifies the outcome.
    ///
    /// A client-side timeout is reported as a timed-out result rather than
    /// an error.
    pub async fn execute_job(&self, job: &Job) -> Result<ExecutionResult> {
        let address = self.address().await;
        if address.is_empty() {
            return Err(SandboxError::AddressResolution {
                reason: format!("container {} has no resolved address", self.id),
            });
        }

        let request = ExecuteRequest {
            code: job.code().to_string(),
            language: job.language().to_string(),
            timeout_ms: job.timeout().as_millis() as u64,
        };

        let response = match self
            .http
            .post(self.endpoint(&address))
            .json(&request)
            .timeout(job.timeout() + CLIENT_TIMEOUT_MARGIN)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(container_id = %self.id, timeout_ms = request.timeout_ms, "Executor did not answer in time");
                return Ok(ExecutionResult::timed_out());
            }
            Err(e) => return Err(SandboxError::Transport { source: e }),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(ExecutionResult::timed_out()),
            Err(e) => return Err(SandboxError::Transport { source: e }),
        };

        if body.is_empty() {
            return Err(SandboxError::Protocol("empty response from container".into()));
        }

        if !status.is_success() {
            let reason = serde_json::from_slice::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(SandboxError::Protocol(format!(
                "executor returned {}: {}",
                status, reason
            )));
        }

        serde_json::from_slice::<ExecutionResult>(&body)
            .map_err(|e| SandboxError::Protocol(format!("malformed executor response: {}", e)))
    }

    /// Stops and removes the engine instance and its scratch directory.
    ///
    /// Idempotent: once the container is cleaned up, further calls return
    /// immediately without touching the engine. Concurrent callers wait for
    /// the first one to finish.
    pub async fn cleanup(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.cleaned_up {
            return Ok(());
        }
        inner.state = LifecycleState::Destroying;

        let mut failures = Vec::new();
        // Remove is attempted even when stop fails.
        if let Err(e) = self.engine.stop(&self.handle).await {
            failures.push(format!("stop: {:#}", e));
        }
        let removed = match self.engine.remove(&self.handle, true).await {
            Ok(()) => true,
            Err(e) => {
                failures.push(format!("remove: {:#}", e));
                false
            }
        };

        if let Some(dir) = &self.scratch_dir {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("scratch dir {}: {}", dir.display(), e)),
            }
        }

        if removed {
            inner.cleaned_up = true;
            inner.state = LifecycleState::Terminated;
        }

        if failures.is_empty() {
            info!(container_id = %self.id, handle = %self.handle, "Container cleaned up");
            Ok(())
        } else {
            warn!(container_id = %self.id, handle = %self.handle, errors = ?failures, "Container teardown incomplete");
            Err(SandboxError::Teardown {
                handle: self.handle.clone(),
                reason: failures.join(", "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::{routing::post, Json, Router};

    use super::*;
    use crate::engine::ContainerSpec;

    #[derive(Default)]
    struct CountingEngine {
        stops: AtomicUsize,
        removes: AtomicUsize,
        fail_stop: AtomicBool,
        fail_remove: AtomicBool,
    }

    #[async_trait]
    impl EngineClient for CountingEngine {
        async fn create_container(&self, _spec: &ContainerSpec) -> anyhow::Result<String> {
            Ok("handle-1".into())
        }

        async fn start(&self, _handle: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn inspect(&self, _handle: &str) -> anyhow::Result<Option<String>> {
            Ok(Some("127.0.0.1".into()))
        }

        async fn stop(&self, _handle: &str) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop.load(Ordering::SeqCst) {
                anyhow::bail!("stop refused");
            }
            Ok(())
        }

        async fn remove(&self, _handle: &str, force: bool) -> anyhow::Result<()> {
            assert!(force);
            self.removes.fetch_add(1, Ordering::SeqCst);
            if self.fail_remove.load(Ordering::SeqCst) {
                anyhow::bail!("remove refused");
            }
            Ok(())
        }
    }

    fn container_with(engine: Arc<CountingEngine>, port: u16) -> Container {
        Container::new(
            "c-1".into(),
            "handle-1".into(),
            engine,
            reqwest::Client::new(),
            port,
            None,
        )
    }

    async fn make_ready(container: &Container) {
        container.transition(LifecycleState::Started).await.unwrap();
        container
            .resolve_address("127.0.0.1".into())
            .await
            .unwrap();
        container.transition(LifecycleState::Settling).await.unwrap();
        container.transition(LifecycleState::Ready).await.unwrap();
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    fn job(timeout: Duration) -> Job {
        Job::new("print(1)", "python", timeout).unwrap().0
    }

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(Requested.can_transition_to(Started));
        assert!(Settling.can_transition_to(Ready));
        assert!(Started.can_transition_to(Destroying));
        assert!(Executing.can_transition_to(Destroying));
        assert!(Destroying.can_transition_to(Terminated));
        assert!(!Requested.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Destroying));
        assert!(!Executing.can_transition_to(Ready));
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let container = container_with(Arc::new(CountingEngine::default()), 1);
        let err = container
            .transition(LifecycleState::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTransition { .. }));
        assert_eq!(container.state().await, LifecycleState::Requested);
    }

    #[tokio::test]
    async fn test_empty_address_is_rejected() {
        let container = container_with(Arc::new(CountingEngine::default()), 1);
        container.transition(LifecycleState::Started).await.unwrap();
        let err = container.resolve_address(String::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::AddressResolution { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let engine = Arc::new(CountingEngine::default());
        let container = container_with(engine.clone(), 1);

        container.cleanup().await.unwrap();
        container.cleanup().await.unwrap();

        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
        assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
        assert!(container.is_cleaned_up().await);
        assert_eq!(container.state().await, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_cleanup_removes_even_when_stop_fails() {
        let engine = Arc::new(CountingEngine::default());
        engine.fail_stop.store(true, Ordering::SeqCst);
        let container = container_with(engine.clone(), 1);

        let err = container.cleanup().await.unwrap_err();
        assert!(matches!(err, SandboxError::Teardown { .. }));
        assert_eq!(engine.removes.load(Ordering::SeqCst), 1);
        // The instance is gone, so a second call is a no-op.
        assert!(container.is_cleaned_up().await);
        container.cleanup().await.unwrap();
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_remove_allows_another_attempt() {
        let engine = Arc::new(CountingEngine::default());
        engine.fail_remove.store(true, Ordering::SeqCst);
        let container = container_with(engine.clone(), 1);

        assert!(container.cleanup().await.is_err());
        assert!(!container.is_cleaned_up().await);
        assert_eq!(container.state().await, LifecycleState::Destroying);

        engine.fail_remove.store(false, Ordering::SeqCst);
        container.cleanup().await.unwrap();
        assert_eq!(engine.removes.load(Ordering::SeqCst), 2);
        assert_eq!(container.state().await, LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_cleanup_removes_scratch_dir() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("c-1");
        std::fs::create_dir(&scratch).unwrap();
        std::fs::write(scratch.join("code.py"), "print(1)").unwrap();

        let container = Container::new(
            "c-1".into(),
            "handle-1".into(),
            Arc::new(CountingEngine::default()),
            reqwest::Client::new(),
            1,
            Some(scratch.clone()),
        );
        container.cleanup().await.unwrap();
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_execute_passes_response_through() {
        let router = Router::new().route(
            "/",
            post(|Json(req): Json<ExecuteRequest>| async move {
                assert_eq!(req.language, "python");
                assert_eq!(req.timeout_ms, 1000);
                Json(serde_json::json!({
                    "stdout": "1\n",
                    "stderr": "",
                    "combined": "1\n",
                    "isError": false,
                    "timedOut": false,
                }))
            }),
        );
        let port = serve(router).await;
        let container = container_with(Arc::new(CountingEngine::default()), port);
        make_ready(&container).await;

        let result = container
            .execute_job(&job(Duration::from_millis(1000)))
            .await
            .unwrap();
        assert_eq!(result.stdout, "1\n");
        assert!(!result.is_error);
        assert!(!result.killed_by_container);
    }

    #[tokio::test]
    async fn test_unresponsive_executor_yields_timed_out_result() {
        let router = Router::new().route(
            "/",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        );
        let port = serve(router).await;
        let container = container_with(Arc::new(CountingEngine::default()), port);
        make_ready(&container).await;

        let result = container
            .execute_job(&job(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(result, ExecutionResult::timed_out());
    }

    #[tokio::test]
    async fn test_empty_body_is_a_protocol_error() {
        let router = Router::new().route("/", post(|| async { "" }));
        let port = serve(router).await;
        let container = container_with(Arc::new(CountingEngine::default()), port);
        make_ready(&container).await;

        let err = container
            .execute_job(&job(Duration::from_millis(1000)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Protocol(ref m) if m.contains("empty response")));
    }

    #[tokio::test]
    async fn test_error_status_is_a_protocol_error() {
        let router = Router::new().route(
            "/",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "no code or timeout specified"})),
                )
            }),
        );
        let port = serve(router).await;
        let container = container_with(Arc::new(CountingEngine::default()), port);
        make_ready(&container).await;

        let err = container
            .execute_job(&job(Duration::from_millis(1000)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no code or timeout specified"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let container = container_with(Arc::new(CountingEngine::default()), port);
        make_ready(&container).await;

        let err = container
            .execute_job(&job(Duration::from_millis(1000)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
