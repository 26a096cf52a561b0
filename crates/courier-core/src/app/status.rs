//! Status - キューの状態照会
//!
//! 全キューの件数集計と、1 タスクが「いまなぜこの状態なのか」の説明。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{CourierResult, TaskState};
use crate::ports::{Broker, QueueCounts};
use crate::queue::TaskRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue: String,
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub queues: Vec<QueueStatus>,
    pub totals: QueueCounts,
}

/// Counts for every known queue plus their sum.
pub async fn status_report(broker: &dyn Broker) -> CourierResult<StatusReport> {
    let mut report = StatusReport::default();
    for queue in broker.queues().await? {
        let counts = broker.counts(&queue).await?;
        let t = &mut report.totals;
        t.pending += counts.pending;
        t.scheduled += counts.scheduled;
        t.active += counts.active;
        t.retry += counts.retry;
        t.completed += counts.completed;
        t.dead += counts.dead;
        report.queues.push(QueueStatus { queue, counts });
    }
    Ok(report)
}

/// One-line, human-readable explanation of a task's state.
pub fn describe(record: &TaskRecord, now: DateTime<Utc>) -> String {
    let id = record.id();
    let attempts = format!("{}/{}", record.retry_count, record.envelope.max_retry());
    let last_error = record
        .last_error
        .as_deref()
        .map(|e| format!("; last error: {e}"))
        .unwrap_or_default();

    match record.state {
        TaskState::Pending => format!("{id} pending, waiting for a worker (retries {attempts}){last_error}"),
        TaskState::Scheduled => format!(
            "{id} scheduled, eligible in {}",
            humanize(record.process_at - now)
        ),
        TaskState::Retry => format!(
            "{id} waiting to retry (retries {attempts}), eligible in {}{last_error}",
            humanize(record.process_at - now)
        ),
        TaskState::Active => match &record.lease {
            Some(lease) if lease.is_expired(now) => {
                format!("{id} active under an expired lease; the reaper will reclaim it")
            }
            Some(lease) => format!(
                "{id} active under {}, lease expires in {}",
                lease.lease_id,
                humanize(lease.expires_at - now)
            ),
            None => format!("{id} active"),
        },
        TaskState::Completed => format!("{id} completed"),
        TaskState::Dead => format!("{id} dead after {attempts} retries{last_error}"),
    }
}

fn humanize(delta: chrono::Duration) -> String {
    let secs = delta.num_seconds();
    if secs <= 0 {
        "now".to_string()
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    }
}
