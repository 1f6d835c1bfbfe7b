//! Submission, status and forget operations for clients.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::job::{TaskEnvelope, TaskRecord, TaskStatus, TaskStatusView, TaskSubmission};
use super::queue::TaskBroker;
use crate::error::GatewayError;

/// Client-facing front of the task queue.
#[derive(Clone)]
pub struct TaskGateway {
    broker: Arc<dyn TaskBroker>,
}

impl TaskGateway {
    pub fn new(broker: Arc<dyn TaskBroker>) -> Self {
        Self { broker }
    }

    /// Validates and enqueues a submission, returning its task id.
    ///
    /// Returns as soon as the envelope is stored; execution happens later on
    /// whichever worker dequeues it. If the enqueue fails, the PENDING record
    /// written for it is removed again.
    pub async fn submit(&self, mut submission: TaskSubmission) -> Result<String, GatewayError> {
        submission.validate()?;

        let envelope = TaskEnvelope::new(submission, Utc::now());
        self.broker
            .store_record(&TaskRecord::in_flight(&envelope.id, TaskStatus::Pending, 1))
            .await?;
        if let Err(e) = self.broker.enqueue(&envelope).await {
            if let Err(cleanup) = self.broker.delete_record(&envelope.id).await {
                warn!(task_id = %envelope.id, error = %cleanup, "Failed to remove record of unqueued task");
            }
            return Err(e.into());
        }

        info!(
            task_id = %envelope.id,
            queue = %envelope.queue(),
            image = %envelope.submission.image,
            eta = ?envelope.eta,
            "Task submitted"
        );
        Ok(envelope.id)
    }

    /// Current status of a task, with its result once terminal.
    ///
    /// Unknown ids report PENDING.
    pub async fn status(&self, task_id: &str) -> Result<TaskStatusView, GatewayError> {
        let record = self.broker.load_record(task_id).await?;
        if record.is_none() && self.broker.is_revoked(task_id).await? {
            return Ok(TaskStatusView {
                task_id: task_id.to_string(),
                status: TaskStatus::Revoked,
                result: None,
            });
        }
        Ok(TaskStatusView::from_record(task_id, record))
    }

    /// Drops a task that has not started yet.
    ///
    /// # Errors
    ///
    /// `GatewayError::AlreadyStarted` once a worker has begun (or finished)
    /// executing the task.
    pub async fn forget(&self, task_id: &str) -> Result<(), GatewayError> {
        if let Some(status) = self.broker.revoke_unstarted(task_id).await? {
            return Err(GatewayError::AlreadyStarted {
                task_id: task_id.to_string(),
                status: status.to_string(),
            });
        }
        info!(task_id = %task_id, "Task forgotten");
        Ok(())
    }
}
