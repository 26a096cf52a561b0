//! Errors and their operational classification.

use std::time::Duration;

use thiserror::Error;

use super::TaskType;

/// Operational classification of an error.
///
/// - Transient: worth retrying the task with backoff.
/// - Permanent: retrying cannot help; dead-letter immediately.
/// - Infrastructure: the broker itself failed; retry the broker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CourierError {
    /// Unique-key collision. Not a failure: the work is already queued.
    #[error("duplicate task: task_type={task_type} unique_key={unique_key}")]
    DuplicateTask {
        task_type: TaskType,
        unique_key: String,
    },

    #[error("no handler registered for task_type={0}")]
    NoHandlerRegistered(TaskType),

    #[error("handler failed: {0}")]
    Handler(String),

    /// Handler failure that must not be retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("attempt exceeded timeout of {0:?}")]
    TimeoutExceeded(Duration),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("payload codec: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type CourierResult<T> = Result<T, CourierError>;

impl CourierError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn broker(message: impl std::fmt::Display) -> Self {
        Self::BrokerUnavailable(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Handler(_) | CourierError::TimeoutExceeded(_) => ErrorKind::Transient,
            CourierError::BrokerUnavailable(_) => ErrorKind::Infrastructure,
            CourierError::DuplicateTask { .. }
            | CourierError::NoHandlerRegistered(_)
            | CourierError::Permanent(_)
            | CourierError::InvalidTask(_)
            | CourierError::Codec(_)
            | CourierError::Config(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CourierError::DuplicateTask { .. })
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Codec(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CourierError {
    fn from(err: redis::RedisError) -> Self {
        CourierError::BrokerUnavailable(err.to_string())
    }
}
