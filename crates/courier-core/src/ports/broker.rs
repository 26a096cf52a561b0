//! Broker port - 共有キューの抽象化
//!
//! The broker is the single point of coordination between distributors and
//! workers. Every operation that reads and then writes queue state is atomic
//! with respect to every other, which is what guarantees a task is leased to
//! at most one worker at a time.
//!
//! # 実装
//! - `InMemoryBroker`: single process, tests and development
//! - `RedisBroker`: persistent, shared across processes (feature `redis`)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CourierResult, TaskEnvelope, TaskId};
use crate::queue::{ClaimedTask, Lease, TaskRecord};

/// What `retry` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rescheduled; eligible again at `process_at`.
    Scheduled { process_at: DateTime<Utc> },
    /// Retry ceiling reached; archived.
    Dead,
    /// The lease was stale (expired and reclaimed, or already settled).
    Ignored,
}

/// Per-queue task counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub active: usize,
    pub retry: usize,
    pub completed: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Tasks that may still run.
    pub fn in_flight(&self) -> usize {
        self.pending + self.scheduled + self.active + self.retry
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Insert a new task, eligible at `process_at`.
    ///
    /// Fails with `DuplicateTask` while another live task holds the same
    /// `(task_type, unique key)` inside its TTL.
    async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        process_at: DateTime<Utc>,
    ) -> CourierResult<TaskId>;

    /// Claim up to `count` eligible tasks, visiting `queues` in order.
    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        lease_duration: Duration,
    ) -> CourierResult<Vec<ClaimedTask>>;

    /// Mark completed. A stale or already-settled lease is a no-op.
    async fn ack(&self, lease: &Lease) -> CourierResult<()>;

    /// Record a failed attempt and reschedule after `delay`, or archive the
    /// task once `retry_count == max_retry`.
    async fn retry(
        &self,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> CourierResult<RetryDisposition>;

    /// Archive immediately, skipping any remaining retries.
    async fn dead_letter(&self, lease: &Lease, error: &str) -> CourierResult<()>;

    /// Return tasks whose lease expired to pending; prune completed tasks
    /// past retention. Returns the number of reclaimed tasks.
    async fn reap_expired_leases(&self) -> CourierResult<usize>;

    async fn task(&self, id: TaskId) -> CourierResult<Option<TaskRecord>>;

    async fn counts(&self, queue: &str) -> CourierResult<QueueCounts>;

    /// Every queue that has ever received a task.
    async fn queues(&self) -> CourierResult<Vec<String>>;

    /// Move a dead task back to pending with a fresh retry budget.
    ///
    /// The task's unique key is held again for a full TTL; fails with
    /// `DuplicateTask` while another live task holds it.
    async fn requeue_dead(&self, id: TaskId) -> CourierResult<bool>;

    /// Remove a task that is not currently leased.
    async fn delete_task(&self, id: TaskId) -> CourierResult<bool>;

    /// Block until work may be available in `queues`, at most `timeout`.
    async fn wait_for_work(&self, _queues: &[String], timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}
