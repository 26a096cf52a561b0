//! Per-task options accepted by the distributor.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::envelope::{DEFAULT_MAX_RETRY, DEFAULT_QUEUE, UniqueLock};

/// When the task becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAt {
    Now,
    In(Duration),
    At(DateTime<Utc>),
}

impl ProcessAt {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ProcessAt::Now => now,
            ProcessAt::In(delay) => add_std(now, delay),
            ProcessAt::At(at) => at,
        }
    }
}

/// `at + delay`, saturating at the largest representable instant.
pub fn add_std(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Builder-style options; anything left unset falls back to the defaults.
///
/// ```ignore
/// let opts = TaskOptions::new()
///     .queue("critical")
///     .max_retry(10)
///     .process_in(Duration::from_secs(10))
///     .unique(format!("verify:{username}"), Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: Option<String>,
    pub max_retry: Option<u32>,
    pub process_at: ProcessAt,
    pub unique: Option<UniqueLock>,
    pub timeout: Option<Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: None,
            max_retry: None,
            process_at: ProcessAt::Now,
            unique: None,
            timeout: None,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = ProcessAt::In(delay);
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = ProcessAt::At(at);
        self
    }

    /// Reject another `(task_type, key)` enqueue for `ttl`, or until this
    /// task completes or dies, whichever comes first.
    pub fn unique(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.unique = Some(UniqueLock {
            key: key.into(),
            ttl,
        });
        self
    }

    /// Per-task override of the processor's attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn queue_or_default(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }

    pub fn max_retry_or_default(&self) -> u32 {
        self.max_retry.unwrap_or(DEFAULT_MAX_RETRY)
    }
}
