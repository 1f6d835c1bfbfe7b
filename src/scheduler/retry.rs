//! Bounded, delayed retry around one execution attempt.
//!
//! The controller never loops. It runs a single attempt and returns a
//! [`RetryDecision`]; the worker turns `RetryAfter` into a delayed
//! re-enqueue so the remaining budget survives a worker crash.
//!
//! ```text
//! ATTEMPT(n) --ok--------------------------> Complete(payload)
//! ATTEMPT(n) --err, n <= max_retries-------> RetryAfter(delay)
//! ATTEMPT(n) --err, n >  max_retries-------> Complete(FAILURE payload)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::job::{ResultPayload, TaskEnvelope};
use crate::error::ExecutionError;
use crate::execution::{ContainerExecutor, ExecutionReport};
use crate::metrics::MetricsCollector;

/// Default upper bound on one attempt when the submission sets none.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(3600);

/// What the worker should do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// The task is terminal with this payload.
    Complete(ResultPayload),
    /// Run another attempt after `delay`.
    RetryAfter { delay: Duration, error: String },
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::RetryAfter { .. })
    }
}

/// Maps an attempt outcome to a decision.
///
/// A finished container is always terminal, whatever its exit code. Errors
/// are retried while the attempt number is within the retry budget and the
/// error is retryable.
pub fn decide(
    envelope: &TaskEnvelope,
    outcome: Result<ExecutionReport, ExecutionError>,
) -> RetryDecision {
    let attempt = envelope.attempt();
    let callback = envelope.submission.callback.clone();

    match outcome {
        Ok(report) => RetryDecision::Complete(ResultPayload::completed(
            attempt,
            report.status_code,
            report.result,
            callback,
        )),
        Err(err) if err.is_retryable() && attempt <= envelope.submission.max_retries => {
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(envelope.submission.retry_delay),
                error: err.to_string(),
            }
        }
        Err(err) => {
            let message = err.to_string();
            let traceback = render_traceback(err, &envelope.id, attempt);
            RetryDecision::Complete(ResultPayload::failed(attempt, message, traceback, callback))
        }
    }
}

/// Renders the full error chain for a failure payload.
fn render_traceback(err: ExecutionError, task_id: &str, attempt: u32) -> String {
    let report =
        anyhow::Error::new(err).context(format!("task {task_id} failed on attempt {attempt}"));
    format!("{report:?}")
}

/// Runs attempts through the executor and decides what comes next.
pub struct RetryController {
    executor: Arc<ContainerExecutor>,
    default_timeout: Duration,
    metrics: MetricsCollector,
}

impl RetryController {
    pub fn new(executor: Arc<ContainerExecutor>) -> Self {
        Self {
            executor,
            default_timeout: DEFAULT_MAX_EXECUTION_TIME,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the attempt time limit used when a submission sets none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Runs the envelope's current attempt.
    pub async fn run_attempt(&self, envelope: &TaskEnvelope) -> RetryDecision {
        let request = envelope.execution_request(self.default_timeout);
        let outcome = self.executor.run(&request).await;

        if let Ok(report) = &outcome {
            self.metrics.record_attempt_duration(report.duration);
        }

        let decision = decide(envelope, outcome);
        match &decision {
            RetryDecision::Complete(payload) if payload.success => {
                info!(task_id = %envelope.id, attempt = payload.attempt, "Task succeeded");
            }
            RetryDecision::Complete(payload) => match &payload.error {
                Some(e) => error!(
                    task_id = %envelope.id,
                    attempt = payload.attempt,
                    error = %e,
                    "Task failed"
                ),
                None => warn!(
                    task_id = %envelope.id,
                    attempt = payload.attempt,
                    status_code = ?payload.status_code,
                    "Task exited with non-zero status"
                ),
            },
            RetryDecision::RetryAfter { delay, error } => warn!(
                task_id = %envelope.id,
                attempt = envelope.attempt(),
                max_retries = envelope.submission.max_retries,
                delay_secs = delay.as_secs(),
                error = %error,
                "Attempt failed, retrying"
            ),
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{FailAt, FakeRuntime};
    use crate::scheduler::job::{TaskStatus, TaskSubmission};
    use chrono::Utc;

    fn envelope(max_retries: u32) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskSubmission::new("python:3.13-slim", vec!["python".into()])
                .with_retries(max_retries, 1)
                .with_callback("http://example.com/hook"),
            Utc::now(),
        )
    }

    fn report(status_code: i64, result: &str) -> ExecutionReport {
        ExecutionReport {
            status_code,
            result: result.to_string(),
            logs: String::new(),
            duration: Duration::from_millis(5),
        }
    }

    fn pull_error() -> ExecutionError {
        ExecutionError::ImagePull {
            image: "nope:latest".to_string(),
            reason: "not found".to_string(),
        }
    }

    #[test]
    fn test_success_is_complete() {
        let env = envelope(1);
        let decision = decide(&env, Ok(report(0, "42")));
        let RetryDecision::Complete(payload) = decision else {
            panic!("expected Complete");
        };
        assert!(payload.success);
        assert_eq!(payload.attempt, 1);
        assert_eq!(payload.result.as_deref(), Some("42"));
        assert_eq!(payload.callback.as_deref(), Some("http://example.com/hook"));
        assert!(payload.traceback.is_none());
    }

    #[test]
    fn test_non_zero_exit_is_terminal() {
        let decision = decide(&envelope(3), Ok(report(2, "oops")));
        let RetryDecision::Complete(payload) = decision else {
            panic!("expected Complete");
        };
        assert!(!payload.success);
        assert_eq!(payload.status_code, Some(2));
        assert_eq!(payload.status(), TaskStatus::Failure);
    }

    #[test]
    fn test_failure_within_budget_retries() {
        let env = envelope(1);
        let decision = decide(&env, Err(pull_error()));
        assert_eq!(
            decision,
            RetryDecision::RetryAfter {
                delay: Duration::from_secs(1),
                error: pull_error().to_string(),
            }
        );
    }

    #[test]
    fn test_failure_past_budget_is_terminal() {
        let env = envelope(1).next_attempt(Duration::from_secs(1), Utc::now());
        assert_eq!(env.attempt(), 2);

        let RetryDecision::Complete(payload) = decide(&env, Err(pull_error())) else {
            panic!("expected Complete");
        };
        assert!(!payload.success);
        assert_eq!(payload.attempt, 2);
        assert!(payload.error.as_deref().unwrap().contains("nope:latest"));
        let traceback = payload.traceback.expect("traceback");
        assert!(traceback.contains("failed on attempt 2"));
        assert!(traceback.contains("Caused by"));
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let env = envelope(0);
        let decision = decide(&env, Err(ExecutionError::Timeout { seconds: 3 }));
        assert!(!decision.is_retry());
    }

    #[test]
    fn test_timeout_consumes_an_attempt() {
        let env = envelope(2);
        assert!(decide(&env, Err(ExecutionError::Timeout { seconds: 3 })).is_retry());
    }

    #[test]
    fn test_non_retryable_error_skips_budget() {
        let env = envelope(5);
        let decision = decide(
            &env,
            Err(ExecutionError::InvalidOptions("bad volume".to_string())),
        );
        let RetryDecision::Complete(payload) = decision else {
            panic!("expected Complete");
        };
        assert_eq!(payload.attempt, 1);
        assert!(payload.error.unwrap().contains("bad volume"));
    }

    #[tokio::test]
    async fn test_controller_runs_executor() {
        let runtime = Arc::new(FakeRuntime::new("===result-data===\n42\n===result-data===\n"));
        let executor = Arc::new(ContainerExecutor::new(runtime.clone()));
        let controller = RetryController::new(executor);

        let RetryDecision::Complete(payload) = controller.run_attempt(&envelope(0)).await else {
            panic!("expected Complete");
        };
        assert!(payload.success);
        assert_eq!(payload.result.as_deref(), Some("42"));
        assert_eq!(runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_controller_retries_pull_failure() {
        let runtime = Arc::new(FakeRuntime::new("").without_image().failing_at(FailAt::Pull));
        let executor = Arc::new(ContainerExecutor::new(runtime.clone()));
        let controller = RetryController::new(executor);

        let decision = controller.run_attempt(&envelope(1)).await;
        assert!(decision.is_retry());
        assert!(runtime.created().is_empty());
    }
}
