//! Error types for dockq operations.
//!
//! Defines error types for each subsystem:
//! - Task submission validation
//! - Container execution (image, lifecycle, timeouts)
//! - Broker and result store access
//! - Best-effort side calls (proxy fetch, callback delivery)
//! - The task gateway facade

use thiserror::Error;

/// Errors raised while validating a task submission.
///
/// These are client errors: the task is never enqueued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Missing image or command")]
    MissingImageOrCommand,

    #[error("Queue name must not be empty")]
    EmptyQueueName,

    #[error("Invalid callback URL '{0}': must start with http:// or https://")]
    InvalidCallback(String),

    #[error("{field} must be at most {max} seconds")]
    OutOfRange { field: &'static str, max: u64 },
}

/// Errors that can occur while running one attempt inside a container.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to create container: {0}")]
    Create(String),

    #[error("Failed to start container {id}: {reason}")]
    Start { id: String, reason: String },

    #[error("Container execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Error waiting for container {id}: {reason}")]
    Wait { id: String, reason: String },

    #[error("Error reading logs of container {id}: {reason}")]
    Logs { id: String, reason: String },

    #[error("Failed to remove container {id}: {reason}")]
    Remove { id: String, reason: String },

    #[error("Invalid container options: {0}")]
    InvalidOptions(String),
}

impl ExecutionError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Malformed options fail identically every time, so they skip the
    /// remaining retry budget.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::InvalidOptions(_))
    }
}

/// Errors that can occur during broker or result store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No connection to the broker could be acquired at all.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// A single Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue operation failed: {0}")]
    Operation(String),
}

/// Errors from the task gateway facade.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid submission: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Task {task_id} already {status}, its result cannot be removed")]
    AlreadyStarted { task_id: String, status: String },

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Queue error: {0}")]
    Queue(QueueError),
}

impl GatewayError {
    /// True when the caller sent something unacceptable (HTTP 400 class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::Submission(_) | GatewayError::AlreadyStarted { .. }
        )
    }
}

impl From<QueueError> for GatewayError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Unavailable(msg) => GatewayError::Unavailable(msg),
            other => GatewayError::Queue(other),
        }
    }
}

/// Errors from delivering a result to a caller-supplied webhook.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("Callback URL '{0}' is not http(s)")]
    UnsupportedUrl(String),

    #[error("Callback request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Callback endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors from the best-effort proxy lookup.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Proxy fetch request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Proxy endpoint returned {0}")]
    Status(u16),

    #[error("Proxy endpoint returned an empty body")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_retryable() {
        assert!(ExecutionError::Timeout { seconds: 5 }.is_retryable());
        assert!(ExecutionError::ImagePull {
            image: "nope:latest".to_string(),
            reason: "not found".to_string()
        }
        .is_retryable());
        assert!(!ExecutionError::InvalidOptions("bad port".to_string()).is_retryable());
    }

    #[test]
    fn test_gateway_error_classification() {
        let err: GatewayError = SubmissionError::MissingImageOrCommand.into();
        assert!(err.is_client_error());

        let err = GatewayError::AlreadyStarted {
            task_id: "t1".to_string(),
            status: "STARTED".to_string(),
        };
        assert!(err.is_client_error());
        assert!(err.to_string().contains("STARTED"));

        let err: GatewayError = QueueError::Unavailable("refused".to_string()).into();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert!(!err.is_client_error());

        let err: GatewayError = QueueError::Operation("boom".to_string()).into();
        assert!(matches!(err, GatewayError::Queue(_)));
    }

    #[test]
    fn test_timeout_display() {
        let err = ExecutionError::Timeout { seconds: 30 };
        assert!(err.to_string().contains("30"));
    }
}
