//! In-memory broker (single process; tests and development).

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument};

use crate::domain::options::add_std;
use crate::domain::{CourierError, CourierResult, TaskEnvelope, TaskId, TaskState, TaskType};
use crate::ports::{Broker, Clock, IdGenerator, QueueCounts, RetryDisposition, SystemClock, UlidGenerator};
use crate::queue::{ClaimedTask, Lease, TaskRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBrokerConfig {
    /// How long completed records stay inspectable.
    pub completed_retention: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            completed_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Delayed (scheduled or retry) entry; reverse ordering makes the heap a
/// min-heap on `process_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedTask {
    process_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .process_at
            .cmp(&self.process_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<TaskId>,
    delayed: BinaryHeap<DelayedTask>,
}

#[derive(Debug, Clone, Copy)]
struct UniqueHold {
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct BrokerState {
    /// Single source of truth; the queue structures hold ids only.
    records: HashMap<TaskId, TaskRecord>,
    queues: BTreeMap<String, QueueState>,
    active: HashSet<TaskId>,
    unique: HashMap<(TaskType, String), UniqueHold>,
}

impl BrokerState {
    /// Move due delayed tasks of `queue` to its pending list.
    fn promote_due(&mut self, queue: &str, now: DateTime<Utc>) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };
        while let Some(entry) = q.delayed.peek() {
            if entry.process_at > now {
                break;
            }
            let Some(entry) = q.delayed.pop() else {
                break;
            };
            // stale entries (deleted, revived, rescheduled) are skipped
            let Some(record) = self.records.get_mut(&entry.task_id) else {
                continue;
            };
            if record.state.is_delayed() && record.process_at == entry.process_at {
                record.promote(now);
                q.pending.push_back(entry.task_id);
            }
        }
    }

    fn release_unique(&mut self, record: &TaskRecord) {
        if let Some(lock) = record.envelope.unique() {
            let key = (record.envelope.task_type().clone(), lock.key.clone());
            if self
                .unique
                .get(&key)
                .is_some_and(|hold| hold.task_id == record.id())
            {
                self.unique.remove(&key);
            }
        }
    }

    fn check_unique(&mut self, envelope: &TaskEnvelope, now: DateTime<Utc>) -> CourierResult<()> {
        let Some(lock) = envelope.unique() else {
            return Ok(());
        };
        let key = (envelope.task_type().clone(), lock.key.clone());
        if let Some(hold) = self.unique.get(&key) {
            let live = hold.expires_at > now
                && self
                    .records
                    .get(&hold.task_id)
                    .is_some_and(|r| !r.state.is_terminal());
            if live {
                return Err(CourierError::DuplicateTask {
                    task_type: envelope.task_type().clone(),
                    unique_key: lock.key.clone(),
                });
            }
        }
        self.unique.insert(
            key,
            UniqueHold {
                task_id: envelope.id(),
                expires_at: add_std(now, lock.ttl),
            },
        );
        Ok(())
    }

    fn push_delayed(&mut self, queue: &str, task_id: TaskId, process_at: DateTime<Utc>) {
        self.queues
            .entry(queue.to_string())
            .or_default()
            .delayed
            .push(DelayedTask {
                process_at,
                task_id,
            });
    }

    /// Earliest delayed entry among `queues`; other queues never wake us.
    fn next_due(&self, queues: &[String]) -> Option<DateTime<Utc>> {
        queues
            .iter()
            .filter_map(|name| self.queues.get(name))
            .filter_map(|q| q.delayed.peek().map(|e| e.process_at))
            .min()
    }

    /// Remove the task from `active` and hand back its record when `lease`
    /// is still the current one.
    fn settle(&mut self, lease: &Lease) -> Option<&mut TaskRecord> {
        let holds = self
            .records
            .get(&lease.task_id)
            .is_some_and(|record| record.holds(lease));
        if !holds {
            debug!(task_id = %lease.task_id, lease_id = %lease.lease_id, "stale lease; ignoring");
            return None;
        }
        self.active.remove(&lease.task_id);
        self.records.get_mut(&lease.task_id)
    }
}

/// In-memory broker.
///
/// One `tokio::sync::Mutex` guards all state, so every operation is atomic
/// with respect to every other. The lock is never held across an `.await`
/// other than its own acquisition.
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: MemoryBrokerConfig,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_config(clock, MemoryBrokerConfig::default())
    }

    pub fn with_config(clock: Arc<dyn Clock>, config: MemoryBrokerConfig) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            clock,
            ids,
            config,
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    #[instrument(skip_all, fields(task_id = %envelope.id(), task_type = %envelope.task_type(), queue = envelope.queue()))]
    async fn enqueue(
        &self,
        envelope: TaskEnvelope,
        process_at: DateTime<Utc>,
    ) -> CourierResult<TaskId> {
        let task_id = envelope.id();
        {
            let mut state = self.state.lock().await;
            if state.records.contains_key(&task_id) {
                return Err(CourierError::InvalidTask(format!("{task_id} already exists")));
            }
            let now = self.clock.now();
            state.check_unique(&envelope, now)?;

            let queue = envelope.queue().to_string();
            let record = TaskRecord::new(envelope, process_at, now);
            let delayed = record.state == TaskState::Scheduled;
            state.records.insert(task_id, record);
            if delayed {
                state.push_delayed(&queue, task_id, process_at);
            } else {
                state.queues.entry(queue).or_default().pending.push_back(task_id);
            }
        }
        // Notify waiting workers outside the lock
        self.notify.notify_one();
        debug!("enqueued");
        Ok(task_id)
    }

    async fn dequeue(
        &self,
        queues: &[String],
        count: usize,
        lease_duration: Duration,
    ) -> CourierResult<Vec<ClaimedTask>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut claimed = Vec::new();

        for queue in queues {
            if claimed.len() >= count {
                break;
            }
            state.promote_due(queue, now);

            while claimed.len() < count {
                let Some(task_id) = state
                    .queues
                    .get_mut(queue)
                    .and_then(|q| q.pending.pop_front())
                else {
                    break;
                };
                let lease = Lease {
                    task_id,
                    lease_id: self.ids.generate_lease_id(),
                    expires_at: add_std(now, lease_duration),
                };
                let Some(record) = state.records.get_mut(&task_id) else {
                    continue;
                };
                if record.state != TaskState::Pending {
                    continue;
                }
                claimed.push(record.start_attempt(lease, now));
                state.active.insert(task_id);
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, lease: &Lease) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(record) = state.settle(lease) else {
            return Ok(());
        };
        record.mark_completed(now);
        let record = record.clone();
        state.release_unique(&record);
        debug!(task_id = %lease.task_id, "completed");
        Ok(())
    }

    async fn retry(
        &self,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> CourierResult<RetryDisposition> {
        let disposition = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let Some(record) = state.settle(lease) else {
                return Ok(RetryDisposition::Ignored);
            };
            match record.fail_attempt(add_std(now, delay), error, now) {
                Some(process_at) => {
                    let queue = record.envelope.queue().to_string();
                    state.push_delayed(&queue, lease.task_id, process_at);
                    RetryDisposition::Scheduled { process_at }
                }
                None => {
                    let record = record.clone();
                    state.release_unique(&record);
                    RetryDisposition::Dead
                }
            }
        };
        if matches!(disposition, RetryDisposition::Scheduled { .. }) {
            self.notify.notify_one();
        }
        Ok(disposition)
    }

    async fn dead_letter(&self, lease: &Lease, error: &str) -> CourierResult<()> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let Some(record) = state.settle(lease) else {
            return Ok(());
        };
        record.mark_dead(error, now);
        let record = record.clone();
        state.release_unique(&record);
        Ok(())
    }

    async fn reap_expired_leases(&self) -> CourierResult<usize> {
        let reclaimed = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let expired: Vec<TaskId> = state
                .active
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .records
                        .get(id)
                        .and_then(|r| r.lease.as_ref())
                        .is_none_or(|lease| lease.is_expired(now))
                })
                .collect();

            for task_id in &expired {
                state.active.remove(task_id);
                if let Some(record) = state.records.get_mut(task_id) {
                    record.release_expired(now);
                    let queue = record.envelope.queue().to_string();
                    state.queues.entry(queue).or_default().pending.push_front(*task_id);
                }
            }

            let retention = self.config.completed_retention;
            state.records.retain(|_, r| {
                !(r.state == TaskState::Completed
                    && r.completed_at.is_some_and(|at| add_std(at, retention) <= now))
            });
            expired.len()
        };
        if reclaimed > 0 {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn task(&self, id: TaskId) -> CourierResult<Option<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn counts(&self, queue: &str) -> CourierResult<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for record in state.records.values().filter(|r| r.envelope.queue() == queue) {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::Active => counts.active += 1,
                TaskState::Retry => counts.retry += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }

    async fn queues(&self) -> CourierResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.queues.keys().cloned().collect())
    }

    async fn requeue_dead(&self, id: TaskId) -> CourierResult<bool> {
        {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let envelope = match state.records.get(&id) {
                Some(record) if record.state == TaskState::Dead => record.envelope.clone(),
                _ => return Ok(false),
            };
            // the hold was released when the task died; take it back
            state.check_unique(&envelope, now)?;
            let Some(record) = state.records.get_mut(&id) else {
                return Ok(false);
            };
            record.revive(now);
            let queue = record.envelope.queue().to_string();
            state.queues.entry(queue).or_default().pending.push_back(id);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn delete_task(&self, id: TaskId) -> CourierResult<bool> {
        let mut state = self.state.lock().await;
        let removable = state
            .records
            .get(&id)
            .is_some_and(|r| r.state != TaskState::Active);
        if !removable {
            return Ok(false);
        }
        let Some(record) = state.records.remove(&id) else {
            return Ok(false);
        };
        state.release_unique(&record);
        if let Some(q) = state.queues.get_mut(record.envelope.queue()) {
            q.pending.retain(|pending| *pending != id);
        }
        Ok(true)
    }

    async fn wait_for_work(&self, queues: &[String], timeout: Duration) {
        let until_due = {
            let state = self.state.lock().await;
            state
                .next_due(queues)
                .map(|due| (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
        };
        let wait = until_due.map_or(timeout, |d| d.min(timeout));
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep(wait) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UniqueLock;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use ulid::Ulid;

    const LEASE: Duration = Duration::from_secs(30);

    fn setup() -> (InMemoryBroker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        (InMemoryBroker::with_clock(clock.clone()), clock)
    }

    fn envelope(clock: &FixedClock, task_type: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new(task_type),
            br#"{"user_id":42}"#.to_vec(),
            clock.now(),
        )
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let (broker, clock) = setup();
        broker.enqueue(envelope(&clock, "test"), clock.now()).await.unwrap();

        let counts = broker.counts("default").await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(broker.queues().await.unwrap(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn dequeue_transitions_to_active() {
        let (broker, clock) = setup();
        let id = broker.enqueue(envelope(&clock, "test"), clock.now()).await.unwrap();

        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].envelope.id(), id);
        assert_eq!(claimed[0].retry_count, 0);
        assert_eq!(claimed[0].envelope.payload(), br#"{"user_id":42}"#);

        let record = broker.task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Active);
        assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dequeue_respects_queue_order_and_count() {
        let (broker, clock) = setup();
        let low = broker
            .enqueue(envelope(&clock, "t").with_queue("low"), clock.now())
            .await
            .unwrap();
        let critical = broker
            .enqueue(envelope(&clock, "t").with_queue("critical"), clock.now())
            .await
            .unwrap();

        let claimed = broker
            .dequeue(&queues(&["critical", "low"]), 1, LEASE)
            .await
            .unwrap();
        assert_eq!(claimed[0].envelope.id(), critical);

        let claimed = broker
            .dequeue(&queues(&["critical", "low"]), 5, LEASE)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].envelope.id(), low);
    }

    #[tokio::test]
    async fn scheduled_task_is_not_claimable_before_process_at() {
        let (broker, clock) = setup();
        let at = clock.now() + chrono::Duration::seconds(10);
        let id = broker.enqueue(envelope(&clock, "t"), at).await.unwrap();
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Scheduled);

        clock.advance(Duration::from_millis(9_999));
        assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());

        clock.advance(Duration::from_millis(1));
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].envelope.id(), id);
    }

    #[tokio::test]
    async fn duplicate_unique_key_within_ttl_is_rejected() {
        let (broker, clock) = setup();
        let lock = Some(UniqueLock {
            key: "X".into(),
            ttl: Duration::from_secs(60),
        });

        broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap();
        let err = broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        // same key, different type: independent
        broker
            .enqueue(envelope(&clock, "email:welcome").with_unique(lock.clone()), clock.now())
            .await
            .unwrap();

        // after the TTL the key is free again
        clock.advance(Duration::from_secs(61));
        broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock), clock.now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unique_key_is_released_on_completion() {
        let (broker, clock) = setup();
        let lock = Some(UniqueLock {
            key: "X".into(),
            ttl: Duration::from_secs(3600),
        });
        broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap();

        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        // still held while active
        assert!(
            broker
                .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
                .await
                .unwrap_err()
                .is_duplicate()
        );

        broker.ack(&claimed[0].lease).await.unwrap();
        broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock), clock.now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn double_ack_is_a_noop() {
        let (broker, clock) = setup();
        let id = broker.enqueue(envelope(&clock, "t"), clock.now()).await.unwrap();
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();

        broker.ack(&claimed[0].lease).await.unwrap();
        let after_first = broker.task(id).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(1));
        broker.ack(&claimed[0].lease).await.unwrap();
        let after_second = broker.task(id).await.unwrap().unwrap();

        assert_eq!(after_first.state, TaskState::Completed);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn retry_until_ceiling_then_dead() {
        let (broker, clock) = setup();
        let id = broker
            .enqueue(envelope(&clock, "t").with_max_retry(1), clock.now())
            .await
            .unwrap();

        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        let disposition = broker
            .retry(&claimed[0].lease, Duration::from_secs(5), "err1")
            .await
            .unwrap();
        let RetryDisposition::Scheduled { process_at } = disposition else {
            panic!("expected Scheduled, got {disposition:?}");
        };
        assert_eq!(process_at, clock.now() + chrono::Duration::seconds(5));
        let record = broker.task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Retry);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("err1"));

        // not eligible until the backoff passes
        assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(5));
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        assert_eq!(claimed[0].retry_count, 1);

        let disposition = broker
            .retry(&claimed[0].lease, Duration::from_secs(5), "err2")
            .await
            .unwrap();
        assert_eq!(disposition, RetryDisposition::Dead);
        let record = broker.task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Dead);
        assert_eq!(record.retry_count, 1);

        clock.advance(Duration::from_secs(3600));
        assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_skips_retries() {
        let (broker, clock) = setup();
        let id = broker.enqueue(envelope(&clock, "t"), clock.now()).await.unwrap();
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();

        broker.dead_letter(&claimed[0].lease, "no handler").await.unwrap();

        let record = broker.task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Dead);
        assert_eq!(record.retry_count, 0);
        assert_eq!(broker.counts("default").await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_old_lease_goes_stale() {
        let (broker, clock) = setup();
        let id = broker.enqueue(envelope(&clock, "t"), clock.now()).await.unwrap();
        let first = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();

        assert_eq!(broker.reap_expired_leases().await.unwrap(), 0);
        clock.advance(LEASE);
        assert_eq!(broker.reap_expired_leases().await.unwrap(), 1);
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Pending);

        let second = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        assert_eq!(second[0].envelope.id(), id);
        assert_ne!(second[0].lease.lease_id, first[0].lease.lease_id);

        // the crashed worker's late settlement must not touch the new claim
        broker.ack(&first[0].lease).await.unwrap();
        assert_eq!(
            broker
                .retry(&first[0].lease, Duration::from_secs(1), "late")
                .await
                .unwrap(),
            RetryDisposition::Ignored
        );
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Active);

        broker.ack(&second[0].lease).await.unwrap();
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Completed);
    }

    #[tokio::test]
    async fn concurrent_dequeues_are_disjoint() {
        let (broker, clock) = setup();
        let broker = Arc::new(broker);
        for _ in 0..200 {
            broker.enqueue(envelope(&clock, "t"), clock.now()).await.unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..8 {
            let broker = Arc::clone(&broker);
            joins.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let claimed = broker
                        .dequeue(&["default".to_string()], 3, LEASE)
                        .await
                        .unwrap();
                    if claimed.is_empty() {
                        break ids;
                    }
                    ids.extend(claimed.into_iter().map(|c| c.envelope.id()));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut seen = HashSet::new();
        for join in joins {
            for id in join.await.unwrap() {
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn completed_records_are_pruned_after_retention() {
        let (broker, clock) = setup();
        let id = broker.enqueue(envelope(&clock, "t"), clock.now()).await.unwrap();
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        broker.ack(&claimed[0].lease).await.unwrap();

        broker.reap_expired_leases().await.unwrap();
        assert!(broker.task(id).await.unwrap().is_some());

        clock.advance(Duration::from_secs(24 * 60 * 60));
        broker.reap_expired_leases().await.unwrap();
        assert!(broker.task(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn requeue_dead_and_delete() {
        let (broker, clock) = setup();
        let id = broker
            .enqueue(envelope(&clock, "t").with_max_retry(0), clock.now())
            .await
            .unwrap();
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        broker.retry(&claimed[0].lease, Duration::ZERO, "boom").await.unwrap();
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Dead);

        assert!(broker.requeue_dead(id).await.unwrap());
        assert!(!broker.requeue_dead(id).await.unwrap());
        let record = broker.task(id).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.retry_count, 0);

        assert!(broker.delete_task(id).await.unwrap());
        assert!(broker.task(id).await.unwrap().is_none());
        assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeued_dead_task_takes_back_its_unique_key() {
        let (broker, clock) = setup();
        let lock = Some(UniqueLock {
            key: "X".into(),
            ttl: Duration::from_secs(3600),
        });
        let id = broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap();
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        broker.dead_letter(&claimed[0].lease, "bad user").await.unwrap();

        assert!(broker.requeue_dead(id).await.unwrap());
        let err = broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        // a newer live task owns the key: the dead one cannot come back
        let claimed = broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap();
        broker.dead_letter(&claimed[0].lease, "bad user").await.unwrap();
        broker
            .enqueue(envelope(&clock, "email:verify").with_unique(lock.clone()), clock.now())
            .await
            .unwrap();
        let err = broker.requeue_dead(id).await.unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(broker.task(id).await.unwrap().unwrap().state, TaskState::Dead);
    }

    #[tokio::test]
    async fn due_task_in_unserved_queue_does_not_cut_the_wait_short() {
        let (broker, clock) = setup();
        let at = clock.now() + chrono::Duration::seconds(1);
        broker
            .enqueue(envelope(&clock, "t").with_queue("low"), at)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        let mut wakeups = 0;
        while start.elapsed() < Duration::from_millis(200) {
            assert!(broker.dequeue(&queues(&["default"]), 1, LEASE).await.unwrap().is_empty());
            broker.wait_for_work(&queues(&["default"]), Duration::from_millis(100)).await;
            wakeups += 1;
        }
        assert!(wakeups <= 4, "woke {wakeups} times");

        // a worker serving "low" is not made to wait for it
        let start = tokio::time::Instant::now();
        broker.wait_for_work(&queues(&["low"]), Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(broker.dequeue(&queues(&["low"]), 1, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wait_for_work_wakes_on_enqueue() {
        let broker = Arc::new(InMemoryBroker::new());
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let start = tokio::time::Instant::now();
                broker.wait_for_work(&queues(&["default"]), Duration::from_secs(5)).await;
                start.elapsed()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let env = TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("t"),
            vec![],
            Utc::now(),
        );
        broker.enqueue(env, Utc::now()).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }
}
