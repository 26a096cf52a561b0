//! Task record: envelope + mutable broker-side state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LeaseId, TaskEnvelope, TaskId, TaskState};

/// A time-bounded exclusive claim on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What a worker receives from `dequeue`.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub envelope: TaskEnvelope,
    pub lease: Lease,
    /// Failed attempts so far (0 on the first attempt).
    pub retry_count: u32,
    pub last_error: Option<String>,
}

/// Metadata + envelope for a task in the broker.
///
/// This is the single source of truth for task state; queue structures hold
/// `TaskId`s only and every transition goes through a method here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub state: TaskState,
    pub retry_count: u32,
    pub process_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub died_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(envelope: TaskEnvelope, process_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let state = if process_at > now {
            TaskState::Scheduled
        } else {
            TaskState::Pending
        };
        Self {
            envelope,
            state,
            retry_count: 0,
            process_at,
            last_error: None,
            lease: None,
            updated_at: now,
            completed_at: None,
            died_at: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.envelope.id()
    }

    /// Is `lease` the lease this task is currently active under?
    pub fn holds(&self, lease: &Lease) -> bool {
        self.state == TaskState::Active
            && self
                .lease
                .as_ref()
                .is_some_and(|current| current.lease_id == lease.lease_id)
    }

    /// Claim under `lease` (state: -> Active).
    pub fn start_attempt(&mut self, lease: Lease, now: DateTime<Utc>) -> ClaimedTask {
        self.state = TaskState::Active;
        self.lease = Some(lease.clone());
        self.updated_at = now;
        ClaimedTask {
            envelope: self.envelope.clone(),
            lease,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
        }
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Completed;
        self.lease = None;
        self.last_error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_dead(&mut self, error: &str, now: DateTime<Utc>) {
        self.state = TaskState::Dead;
        self.lease = None;
        self.last_error = Some(error.to_string());
        self.died_at = Some(now);
        self.updated_at = now;
    }

    /// Apply the retry ceiling: archive when the budget is spent, otherwise
    /// count the failure and schedule strictly after the previous `process_at`.
    ///
    /// Returns the new `process_at`, or `None` when the task died.
    pub fn fail_attempt(
        &mut self,
        candidate: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if self.retry_count >= self.envelope.max_retry() {
            self.mark_dead(error, now);
            return None;
        }
        let floor = self.process_at + chrono::Duration::milliseconds(1);
        let process_at = candidate.max(floor);

        self.retry_count += 1;
        self.state = TaskState::Retry;
        self.process_at = process_at;
        self.last_error = Some(error.to_string());
        self.lease = None;
        self.updated_at = now;
        Some(process_at)
    }

    /// Lease expired without settlement (state: Active -> Pending).
    pub fn release_expired(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.lease = None;
        self.last_error = Some("lease expired".to_string());
        self.updated_at = now;
    }

    /// Due scheduled/retry task becomes pending.
    pub fn promote(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.updated_at = now;
    }

    /// Dead task back to pending with a fresh retry budget.
    pub fn revive(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Pending;
        self.retry_count = 0;
        self.process_at = now.max(self.process_at);
        self.died_at = None;
        self.updated_at = now;
    }
}
