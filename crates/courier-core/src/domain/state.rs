//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Broker-side state of a task.
///
/// State transitions:
/// - Pending -> Active -> Completed
/// - Scheduled -> Active (once `process_at` has passed)
/// - Active -> Retry -> Active (loop until `max_retry`)
/// - Active -> Dead (retry ceiling reached, no handler, permanent error)
/// - Active -> Pending (lease expired without settlement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Eligible now.
    Pending,

    /// Waiting for its first `process_at`.
    Scheduled,

    /// Claimed by exactly one worker under a lease.
    Active,

    /// Waiting for a backoff delay after a failed attempt.
    Retry,

    /// Handler succeeded.
    Completed,

    /// Archived; never redelivered.
    Dead,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Dead)
    }

    /// Does this state wait on `process_at` before becoming claimable?
    pub fn is_delayed(self) -> bool {
        matches!(self, TaskState::Scheduled | TaskState::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scheduled => "scheduled",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "scheduled" => Ok(TaskState::Scheduled),
            "active" => Ok(TaskState::Active),
            "retry" => Ok(TaskState::Retry),
            "completed" => Ok(TaskState::Completed),
            "dead" => Ok(TaskState::Dead),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_dead_are_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Dead.is_terminal());
        assert!(!TaskState::Retry.is_terminal());
        assert!(!TaskState::Active.is_terminal());
    }

    #[test]
    fn text_form_round_trips() {
        for state in [
            TaskState::Pending,
            TaskState::Scheduled,
            TaskState::Active,
            TaskState::Retry,
            TaskState::Completed,
            TaskState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("archived".parse::<TaskState>().is_err());
    }
}
