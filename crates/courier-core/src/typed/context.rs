//! Per-attempt context handed to handlers.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::{TaskId, TaskType};
use crate::queue::ClaimedTask;

/// What a handler knows about the attempt it is running.
///
/// The token is cancelled when the attempt times out or the processor is
/// stopping; long handlers should check it between steps.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    queue: String,
    retry_count: u32,
    max_retry: u32,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn from_claim(claim: &ClaimedTask, deadline: DateTime<Utc>, cancel: CancellationToken) -> Self {
        Self {
            task_id: claim.envelope.id(),
            task_type: claim.envelope.task_type().clone(),
            queue: claim.envelope.queue().to_string(),
            retry_count: claim.retry_count,
            max_retry: claim.envelope.max_retry(),
            deadline,
            cancel,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Failed attempts before this one.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Is this the last attempt before the task is archived?
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retry
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
