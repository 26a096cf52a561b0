//! TaskEnvelope - the unit of work handed to the broker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskType};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Deduplication window for `(task_type, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueLock {
    pub key: String,
    pub ttl: Duration,
}

/// Type + opaque payload + scheduling metadata.
///
/// Immutable once built. Everything that changes while the task moves
/// through the broker (state, retry count, lease) lives in `TaskRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    id: TaskId,
    task_type: TaskType,
    #[serde(skip)]
    payload: Vec<u8>,
    queue: String,
    max_retry: u32,
    unique: Option<UniqueLock>,
    timeout: Option<Duration>,
    created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            unique: None,
            timeout: None,
            created_at,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_unique(mut self, unique: Option<UniqueLock>) -> Self {
        self.unique = unique;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reattach a payload to metadata decoded from storage.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn unique(&self) -> Option<&UniqueLock> {
        self.unique.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
