//! Task definitions for the scheduler.
//!
//! This module defines the core types that flow through the queue:
//!
//! - `TaskSubmission`: what a caller asks to run
//! - `TaskEnvelope`: a submission plus scheduling state, stored in the broker
//! - `TaskStatus`: lifecycle state of a task
//! - `ResultPayload`: the terminal outcome of a task
//! - `TaskRecord`: what the result store keeps per task id

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SubmissionError;
use crate::execution::{ExecutionRequest, RuntimeOptions};

/// Default retry budget for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default delay between attempts, in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Default queue name.
pub const DEFAULT_QUEUE: &str = "celery";

/// Upper bound for every seconds-valued scheduling field (one year).
pub const MAX_SCHEDULE_SECS: u64 = 365 * 86_400;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// A caller's request to run a command in a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Docker image reference.
    #[serde(default)]
    pub image: String,
    /// Command and arguments.
    #[serde(default)]
    pub command: Vec<String>,
    /// Options passed through to the container runtime.
    #[serde(default, alias = "container_kwargs")]
    pub container_options: RuntimeOptions,
    /// Endpoint that hands out an outbound proxy address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// Number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Queue to submit to.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Seconds before the first attempt becomes eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u64>,
    /// Seconds after which an unstarted task is discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    /// Wall-clock limit for one attempt's container, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    /// URL to POST the result to once the task is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl TaskSubmission {
    /// Creates a submission with default scheduling parameters.
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            container_options: RuntimeOptions::default(),
            proxy: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY_SECS,
            queue: DEFAULT_QUEUE.to_string(),
            countdown: None,
            expires: None,
            max_execution_time: None,
            callback: None,
        }
    }

    /// Sets the container options.
    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.container_options = options;
        self
    }

    /// Sets the proxy-fetch endpoint.
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// Sets the retry budget and delay.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Sets the queue name.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delays the first attempt.
    pub fn with_countdown(mut self, seconds: u64) -> Self {
        self.countdown = Some(seconds);
        self
    }

    /// Discards the task if it has not started within `seconds`.
    pub fn with_expires(mut self, seconds: u64) -> Self {
        self.expires = Some(seconds);
        self
    }

    /// Bounds each attempt's execution time.
    pub fn with_max_execution_time(mut self, seconds: u64) -> Self {
        self.max_execution_time = Some(seconds);
        self
    }

    /// Sets the callback URL.
    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback = Some(url.into());
        self
    }

    /// Checks the submission before it is enqueued.
    ///
    /// Trims the image name in place. An empty image, an empty command or a
    /// command made only of blank arguments is rejected.
    pub fn validate(&mut self) -> Result<(), SubmissionError> {
        self.image = self.image.trim().to_string();
        if self.image.is_empty() || self.command.iter().all(|arg| arg.trim().is_empty()) {
            return Err(SubmissionError::MissingImageOrCommand);
        }
        if self.queue.trim().is_empty() {
            return Err(SubmissionError::EmptyQueueName);
        }
        if let Some(callback) = self.callback.as_deref() {
            if callback.trim().is_empty() {
                self.callback = None;
            } else if !is_http_url(callback) {
                return Err(SubmissionError::InvalidCallback(callback.to_string()));
            }
        }

        let bounded = [
            ("countdown", self.countdown),
            ("expires", self.expires),
            ("retry_delay", Some(self.retry_delay)),
            ("max_execution_time", self.max_execution_time),
        ];
        for (field, value) in bounded {
            if value.is_some_and(|secs| secs > MAX_SCHEDULE_SECS) {
                return Err(SubmissionError::OutOfRange {
                    field,
                    max: MAX_SCHEDULE_SECS,
                });
            }
        }
        Ok(())
    }
}

/// Whether `url` uses the http or https scheme.
pub fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// A submission wrapped with its scheduling state.
///
/// Envelopes are what the broker stores and what workers dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Globally unique task id.
    pub id: String,
    /// The caller's submission.
    pub submission: TaskSubmission,
    /// Number of retries already consumed.
    pub retries: u32,
    /// Earliest time the next attempt may start.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Time after which an unstarted task is discarded.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Wraps a validated submission, resolving countdown and expiry
    /// against `now`.
    pub fn new(submission: TaskSubmission, now: DateTime<Utc>) -> Self {
        let eta = submission
            .countdown
            .filter(|secs| *secs > 0)
            .map(|secs| after(now, Duration::from_secs(secs)));
        let expires_at = submission
            .expires
            .map(|secs| after(now, Duration::from_secs(secs)));

        Self {
            id: Uuid::new_v4().to_string(),
            submission,
            retries: 0,
            eta,
            expires_at,
            created_at: now,
        }
    }

    /// Queue this task belongs to.
    pub fn queue(&self) -> &str {
        &self.submission.queue
    }

    /// The 1-indexed attempt about to run.
    pub fn attempt(&self) -> u32 {
        self.retries + 1
    }

    /// Whether the task may no longer start.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Prepares the envelope for its next attempt after `delay`.
    pub fn next_attempt(mut self, delay: Duration, now: DateTime<Utc>) -> Self {
        self.retries += 1;
        self.eta = Some(after(now, delay));
        self
    }

    /// Builds the executor input for the current attempt.
    pub fn execution_request(&self, default_timeout: Duration) -> ExecutionRequest {
        let timeout = self
            .submission
            .max_execution_time
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        ExecutionRequest {
            task_id: self.id.clone(),
            attempt: self.attempt(),
            image: self.submission.image.clone(),
            command: self.submission.command.clone(),
            options: self.submission.container_options.clone(),
            proxy_url: self.submission.proxy.clone(),
            timeout,
        }
    }
}

/// `now + delay`, saturating at the latest representable instant.
fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Accepted, waiting in a queue (also reported for unknown ids).
    Pending,
    /// Taken off the queue by a worker.
    Received,
    /// An attempt is running.
    Started,
    /// An attempt failed; another is scheduled.
    Retry,
    /// Terminal: the command exited 0.
    Success,
    /// Terminal: the command failed or the retry budget ran out.
    Failure,
    /// Discarded before starting (forgotten or expired).
    Revoked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Received,
        TaskStatus::Started,
        TaskStatus::Retry,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Revoked,
    ];

    /// No further attempts will occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// The stored result may still be forgotten.
    pub fn is_forgettable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Received)
    }

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Received => "RECEIVED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Revoked => "REVOKED",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a task, as stored and as POSTed to callbacks.
///
/// Fields without a value are omitted from the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub success: bool,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl ResultPayload {
    /// Payload for a container that ran to completion.
    pub fn completed(
        attempt: u32,
        status_code: i64,
        result: impl Into<String>,
        callback: Option<String>,
    ) -> Self {
        Self {
            success: status_code == 0,
            attempt,
            result: Some(result.into()),
            status_code: Some(status_code),
            error: None,
            traceback: None,
            callback,
        }
    }

    /// Payload for a task that failed without a usable run.
    pub fn failed(
        attempt: u32,
        error: impl Into<String>,
        traceback: impl Into<String>,
        callback: Option<String>,
    ) -> Self {
        Self {
            success: false,
            attempt,
            result: None,
            status_code: None,
            error: Some(error.into()),
            traceback: Some(traceback.into()),
            callback,
        }
    }

    /// Terminal status this payload represents.
    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Success
        } else {
            TaskStatus::Failure
        }
    }
}

/// What the result store keeps for one task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Record for a non-terminal status.
    pub fn in_flight(task_id: impl Into<String>, status: TaskStatus, attempt: u32) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            attempt,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Record for a task waiting on a retry, keeping the last error.
    pub fn retrying(task_id: impl Into<String>, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::in_flight(task_id, TaskStatus::Retry, attempt)
        }
    }

    /// Record for a terminal payload.
    pub fn terminal(task_id: impl Into<String>, payload: ResultPayload) -> Self {
        Self {
            task_id: task_id.into(),
            status: payload.status(),
            attempt: payload.attempt,
            result: Some(payload),
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Reply to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    /// Present only once the task is terminal.
    pub result: Option<ResultPayload>,
}

impl TaskStatusView {
    /// Builds the view from an optional stored record.
    pub fn from_record(task_id: &str, record: Option<TaskRecord>) -> Self {
        match record {
            Some(record) => {
                let result = if record.status.is_terminal() {
                    record.result
                } else {
                    None
                };
                Self {
                    task_id: task_id.to_string(),
                    status: record.status,
                    result,
                }
            }
            None => Self {
                task_id: task_id.to_string(),
                status: TaskStatus::Pending,
                result: None,
            },
        }
    }
}
