//! Per-attempt container lifecycle.
//!
//! One attempt walks through:
//! ```text
//! RESOLVE IMAGE → (PROXY) → CREATE → START → WAIT (bounded) → LOGS → EXTRACT
//!                              └──────────── always: FORCE REMOVE ─────────┘
//! ```
//! Once a container exists it is force-removed exactly once, whether the
//! attempt succeeds, fails, times out, or the attempt future is dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::execution::docker_client::{ContainerConfig, ContainerRuntime};
use crate::execution::extractor::ResultExtractor;
use crate::execution::options::RuntimeOptions;
use crate::execution::proxy::ProxyFetcher;
use crate::metrics::MetricsCollector;

/// Inputs for one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Owning task id, used for labels and logs.
    pub task_id: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Image reference; surrounding whitespace is ignored.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Runtime options passed to the container.
    pub options: RuntimeOptions,
    /// Endpoint to ask for an outbound proxy, if any.
    pub proxy_url: Option<String>,
    /// Upper bound on the wait-for-exit step.
    pub timeout: Duration,
}

/// Outcome of an attempt whose container ran to completion.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Container exit code.
    pub status_code: i64,
    /// Extracted logical result.
    pub result: String,
    /// Raw combined output.
    pub logs: String,
    /// Wall-clock time from start to exit.
    pub duration: Duration,
}

impl ExecutionReport {
    /// A run succeeds exactly when the process exited with code 0.
    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }
}

/// Runs task commands in throwaway containers.
pub struct ContainerExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    proxy: ProxyFetcher,
    extractor: ResultExtractor,
    metrics: MetricsCollector,
}

impl ContainerExecutor {
    /// Creates an executor on top of a container runtime.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            proxy: ProxyFetcher::new(),
            extractor: ResultExtractor::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Uses a custom result delimiter.
    pub fn with_extractor(mut self, extractor: ResultExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Uses a custom proxy fetcher.
    pub fn with_proxy_fetcher(mut self, proxy: ProxyFetcher) -> Self {
        self.proxy = proxy;
        self
    }

    /// Runs one attempt to completion.
    ///
    /// # Errors
    ///
    /// Any failure before the container exits, including the wait timeout,
    /// is returned as an [`ExecutionError`]. A non-zero exit is not an error;
    /// it is reported through [`ExecutionReport::status_code`].
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutionError> {
        let image = request.image.trim();
        self.ensure_image(image).await?;

        let mut options = request.options.clone();
        if let Some(url) = request.proxy_url.as_deref() {
            match self.proxy.fetch(url).await {
                Ok(proxy) => options.apply_proxy(&proxy),
                // Proxy lookup is best-effort: run without one.
                Err(e) => warn!(
                    task_id = %request.task_id,
                    proxy_url = %url,
                    error = %e,
                    "Proxy fetch failed, continuing without proxy"
                ),
            }
        }
        options.validate()?;
        for key in options.unsupported_keys() {
            warn!(task_id = %request.task_id, key = %key, "Ignoring unsupported container option");
        }

        let config = ContainerConfig::new(image, request.command.clone())
            .with_options(options)
            .with_task(&request.task_id, request.attempt);

        let id = self.runtime.create_container(&config).await?;
        info!(task_id = %request.task_id, container_id = %id, image = %image, "Container created");

        let guard = ContainerGuard::new(Arc::clone(&self.runtime), id, self.metrics.clone());
        let outcome = self.drive(guard.id(), request).await;
        guard.release().await;
        outcome
    }

    async fn ensure_image(&self, image: &str) -> Result<(), ExecutionError> {
        if self.runtime.image_exists(image).await {
            info!(image = %image, "Image found locally");
            return Ok(());
        }
        info!(image = %image, "Image not found locally, pulling");
        self.runtime.pull_image(image).await?;
        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn drive(
        &self,
        id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionReport, ExecutionError> {
        self.runtime.start_container(id).await?;
        info!(task_id = %request.task_id, container_id = %id, "Container started");
        let started = Instant::now();

        let status_code = tokio::time::timeout(request.timeout, self.runtime.wait_container(id))
            .await
            .map_err(|_| ExecutionError::Timeout {
                seconds: request.timeout.as_secs(),
            })??;
        let duration = started.elapsed();

        let logs = self.runtime.get_logs(id).await?;
        debug!(task_id = %request.task_id, container_id = %id, output = %logs, "Container output");

        let result = self.extractor.extract(&logs);
        info!(
            task_id = %request.task_id,
            container_id = %id,
            status_code,
            duration_ms = duration.as_millis() as u64,
            "Container exited"
        );

        Ok(ExecutionReport {
            status_code,
            result,
            logs,
            duration,
        })
    }
}

/// Owns a created container until it is removed.
///
/// `release` removes it on the normal path; if the attempt future is dropped
/// first, `Drop` schedules the removal on the current runtime instead.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
    metrics: MetricsCollector,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String, metrics: MetricsCollector) -> Self {
        Self {
            runtime,
            id: Some(id),
            metrics,
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove_container(self.runtime.as_ref(), &id, &self.metrics).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let metrics = self.metrics.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_container(runtime.as_ref(), &id, &metrics).await;
                });
            }
            Err(_) => warn!(container_id = %id, "No async runtime left to remove container"),
        }
    }
}

/// Force-removes a container; failures are logged, never escalated.
async fn remove_container(runtime: &dyn ContainerRuntime, id: &str, metrics: &MetricsCollector) {
    match runtime.remove_container(id, true).await {
        Ok(()) => {
            metrics.record_container_removal(true);
            info!(container_id = %id, "Container removed");
        }
        Err(e) => {
            metrics.record_container_removal(false);
            warn!(container_id = %id, error = %e, "Failed to remove container");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{FailAt, FakeRuntime};

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest {
            task_id: "task-1".to_string(),
            attempt: 1,
            image: "  python:3.13-slim \n".to_string(),
            command: vec!["python".to_string(), "-c".to_string(), command.to_string()],
            options: RuntimeOptions::new(),
            proxy_url: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn executor(runtime: &Arc<FakeRuntime>) -> ContainerExecutor {
        ContainerExecutor::new(Arc::clone(runtime) as Arc<dyn ContainerRuntime>)
    }

    #[tokio::test]
    async fn test_successful_run_extracts_result() {
        let runtime = Arc::new(FakeRuntime::new(
            "Hello\n===result-data===\n42\n===result-data===\n",
        ));
        let report = executor(&runtime)
            .run(&request("print(42)"))
            .await
            .expect("run should succeed");

        assert!(report.is_success());
        assert_eq!(report.status_code, 0);
        assert_eq!(report.result, "42");

        let created = runtime.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].image, "python:3.13-slim");
        assert_eq!(runtime.removed(), vec!["fake-1".to_string()]);
        assert!(runtime.pulled().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_is_pulled() {
        let runtime = Arc::new(FakeRuntime::new("ok").without_image());
        executor(&runtime)
            .run(&request("pass"))
            .await
            .expect("run should succeed");
        assert_eq!(runtime.pulled(), vec!["python:3.13-slim".to_string()]);
    }

    #[tokio::test]
    async fn test_pull_failure_creates_nothing() {
        let runtime = Arc::new(FakeRuntime::new("").without_image().failing_at(FailAt::Pull));
        let err = executor(&runtime).run(&request("pass")).await.unwrap_err();

        assert!(matches!(err, ExecutionError::ImagePull { .. }));
        assert!(err.is_retryable());
        assert!(runtime.created().is_empty());
        assert!(runtime.removed().is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported_not_raised() {
        let runtime = Arc::new(FakeRuntime::new("Traceback...\nValueError: nope\n").with_exit_code(1));
        let report = executor(&runtime)
            .run(&request("raise ValueError"))
            .await
            .expect("non-zero exit is still a report");

        assert!(!report.is_success());
        assert_eq!(report.status_code, 1);
        assert_eq!(report.result, "ValueError: nope");
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_on_every_failure_path() {
        for step in [FailAt::Start, FailAt::Logs] {
            let runtime = Arc::new(FakeRuntime::new("").failing_at(step));
            let result = executor(&runtime).run(&request("pass")).await;
            assert!(result.is_err(), "{step:?} should fail the attempt");
            assert_eq!(runtime.removed(), vec!["fake-1".to_string()], "{step:?}");
        }
    }

    #[tokio::test]
    async fn test_create_failure_has_nothing_to_remove() {
        let runtime = Arc::new(FakeRuntime::new("").failing_at(FailAt::Create));
        let err = executor(&runtime).run(&request("pass")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Create(_)));
        assert!(runtime.removed().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails_attempt_and_removes_container() {
        let runtime =
            Arc::new(FakeRuntime::new("never").with_wait_delay(Duration::from_secs(30)));
        let mut req = request("import time; time.sleep(60)");
        req.timeout = Duration::from_millis(50);

        let err = executor(&runtime).run(&req).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_removal_failure_does_not_change_outcome() {
        let runtime = Arc::new(FakeRuntime::new("done").failing_at(FailAt::Remove));
        let report = executor(&runtime)
            .run(&request("pass"))
            .await
            .expect("removal failure is only logged");
        assert_eq!(report.result, "done");
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_attempt_still_removes_container() {
        let runtime =
            Arc::new(FakeRuntime::new("never").with_wait_delay(Duration::from_secs(30)));
        let exec = executor(&runtime);
        let req = request("sleep");

        let attempt = exec.run(&req);
        let _ = tokio::time::timeout(Duration::from_millis(50), attempt).await;

        for _ in 0..50 {
            if !runtime.removed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.removed(), vec!["fake-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_ignored() {
        let runtime = Arc::new(FakeRuntime::new("ok"));
        let mut req = request("pass");
        req.proxy_url = Some("http://127.0.0.1:9/proxy".to_string());

        let exec = executor(&runtime)
            .with_proxy_fetcher(ProxyFetcher::with_timeout(Duration::from_millis(500)));
        let report = exec.run(&req).await.expect("proxy failure is ignored");

        assert_eq!(report.result, "ok");
        let created = runtime.created();
        assert!(!created[0].options.env.contains_key("HTTP_PROXY"));
    }

    #[tokio::test]
    async fn test_invalid_options_are_not_retryable() {
        let runtime = Arc::new(FakeRuntime::new("ok"));
        let mut req = request("pass");
        req.options = RuntimeOptions::new().with_volume("nocolon");

        let err = executor(&runtime).run(&req).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidOptions(_)));
        assert!(!err.is_retryable());
        assert!(runtime.created().is_empty());
    }
}
