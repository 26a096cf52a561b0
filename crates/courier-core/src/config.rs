//! Processor configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `COURIER_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{CourierError, CourierResult, DEFAULT_QUEUE};
use crate::queue::{QueueWeight, RetryPolicy, parse_queue_weights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of worker tasks (= max concurrently running handlers).
    pub concurrency: usize,
    /// Queues to serve and their weights.
    pub queues: Vec<QueueWeight>,
    /// Always drain higher-weight queues first instead of weighted round-robin.
    pub strict_priority: bool,
    /// Attempt timeout when the task carries none of its own.
    pub attempt_timeout: Duration,
    /// Must exceed `attempt_timeout` so a healthy attempt never loses its lease.
    pub lease_duration: Duration,
    pub reaper_interval: Duration,
    /// Longest a worker idles before polling the broker again.
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Backoff between task attempts.
    pub retry: RetryPolicy,
    /// Backoff between failed broker calls.
    pub broker_retry: RetryPolicy,
    /// Consecutive broker failures after which a worker gives up.
    pub broker_failure_threshold: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![QueueWeight::new(DEFAULT_QUEUE, 1)],
            strict_priority: false,
            attempt_timeout: Duration::from_secs(30 * 60),
            lease_duration: Duration::from_secs(35 * 60),
            reaper_interval: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            broker_retry: RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            broker_failure_threshold: 10,
        }
    }
}

impl ProcessorConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueWeight>) -> Self {
        self.queues = queues;
        self
    }

    /// Convenience: `with_queue("critical", 6).with_queue("default", 3)`.
    /// Replaces the implicit `default` queue on first use.
    pub fn with_queue(mut self, name: impl Into<String>, weight: u32) -> Self {
        let name = name.into();
        if self.queues == [QueueWeight::new(DEFAULT_QUEUE, 1)] && name != DEFAULT_QUEUE {
            self.queues.clear();
        }
        self.queues.retain(|q| q.name != name);
        self.queues.push(QueueWeight::new(name, weight));
        self
    }

    pub fn with_strict_priority(mut self, strict: bool) -> Self {
        self.strict_priority = strict;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_broker_retry(mut self, retry: RetryPolicy, failure_threshold: u32) -> Self {
        self.broker_retry = retry;
        self.broker_failure_threshold = failure_threshold;
        self
    }

    pub fn validate(&self) -> CourierResult<()> {
        if self.concurrency == 0 {
            return Err(CourierError::Config("concurrency must be at least 1".into()));
        }
        if self.queues.is_empty() {
            return Err(CourierError::Config("at least one queue is required".into()));
        }
        if let Some(q) = self.queues.iter().find(|q| q.name.trim().is_empty()) {
            return Err(CourierError::Config(format!("empty queue name (weight {})", q.weight)));
        }
        if let Some(q) = self.queues.iter().find(|q| q.weight == 0) {
            return Err(CourierError::Config(format!("queue '{}' has weight 0", q.name)));
        }
        if self.lease_duration <= self.attempt_timeout {
            return Err(CourierError::Config(format!(
                "lease_duration ({:?}) must exceed attempt_timeout ({:?})",
                self.lease_duration, self.attempt_timeout
            )));
        }
        if self.reaper_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(CourierError::Config(
                "reaper_interval and poll_interval must be non-zero".into(),
            ));
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(CourierError::Config(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.broker_failure_threshold == 0 {
            return Err(CourierError::Config("broker_failure_threshold must be at least 1".into()));
        }
        Ok(())
    }

    /// Defaults overlaid with `COURIER_*` environment variables.
    pub fn from_env() -> CourierResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CourierResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("COURIER_CONCURRENCY") {
            config.concurrency = parse_var("COURIER_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("COURIER_QUEUES") {
            config.queues = parse_queue_weights(&raw)
                .map_err(|e| CourierError::Config(format!("COURIER_QUEUES: {e}")))?;
        }
        if let Some(raw) = lookup("COURIER_STRICT_PRIORITY") {
            config.strict_priority = parse_var("COURIER_STRICT_PRIORITY", &raw)?;
        }
        if let Some(raw) = lookup("COURIER_ATTEMPT_TIMEOUT_SECS") {
            config.attempt_timeout =
                Duration::from_secs(parse_var("COURIER_ATTEMPT_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("COURIER_LEASE_SECS") {
            config.lease_duration = Duration::from_secs(parse_var("COURIER_LEASE_SECS", &raw)?);
        }
        if let Some(raw) = lookup("COURIER_REAPER_INTERVAL_SECS") {
            config.reaper_interval =
                Duration::from_secs(parse_var("COURIER_REAPER_INTERVAL_SECS", &raw)?);
        }
        if let Some(raw) = lookup("COURIER_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_var("COURIER_POLL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = lookup("COURIER_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace =
                Duration::from_secs(parse_var("COURIER_SHUTDOWN_GRACE_SECS", &raw)?);
        }
        if let Some(raw) = lookup("COURIER_RETRY_MULTIPLIER") {
            config.retry = config
                .retry
                .with_multiplier(parse_var("COURIER_RETRY_MULTIPLIER", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> CourierResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| CourierError::Config(format!("{key}={raw:?}: {e}")))
}
