//! Distributor - タスクの投入口
//!
//! Request 側のコードが使う唯一の API。envelope を組み立てて
//! `Broker::enqueue` に渡すだけで、状態は持たない（Clone して共有できる）。

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::domain::{
    CourierError, CourierResult, TaskEnvelope, TaskId, TaskOptions, TaskType,
};
use crate::ports::{Broker, Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::typed::Task;

#[derive(Clone)]
pub struct Distributor {
    broker: Arc<dyn Broker>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Distributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_clock(broker, Arc::new(SystemClock))
    }

    pub fn with_clock(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self { broker, ids, clock }
    }

    /// Enqueue a raw task.
    ///
    /// Errors are enqueue-time only: `InvalidTask`, `DuplicateTask`,
    /// `BrokerUnavailable`. What happens to the task afterwards is never
    /// reported back here.
    #[instrument(skip(self, payload, options), fields(task_type = %task_type))]
    pub async fn distribute(
        &self,
        task_type: TaskType,
        payload: Vec<u8>,
        options: TaskOptions,
    ) -> CourierResult<TaskId> {
        let envelope = self.build_envelope(task_type, payload, &options)?;
        let process_at = options.process_at.resolve(self.clock.now());
        let task_id = self.broker.enqueue(envelope, process_at).await?;
        debug!(task_id = %task_id, %process_at, "task distributed");
        Ok(task_id)
    }

    /// Typed variant; the payload is `task` as JSON.
    pub async fn distribute_task<T: Task>(
        &self,
        task: &T,
        options: TaskOptions,
    ) -> CourierResult<TaskId> {
        let payload = serde_json::to_vec(task)?;
        self.distribute(T::task_type(), payload, options).await
    }

    fn build_envelope(
        &self,
        task_type: TaskType,
        payload: Vec<u8>,
        options: &TaskOptions,
    ) -> CourierResult<TaskEnvelope> {
        if task_type.is_empty() {
            return Err(CourierError::InvalidTask("task type must not be empty".into()));
        }
        let queue = options.queue_or_default();
        if queue.trim().is_empty() {
            return Err(CourierError::InvalidTask("queue name must not be empty".into()));
        }
        if let Some(lock) = &options.unique {
            if lock.key.is_empty() || lock.ttl.is_zero() {
                return Err(CourierError::InvalidTask(
                    "unique lock needs a key and a non-zero ttl".into(),
                ));
            }
        }

        Ok(TaskEnvelope::new(
            self.ids.generate_task_id(),
            task_type,
            payload,
            self.clock.now(),
        )
        .with_queue(queue)
        .with_max_retry(options.max_retry_or_default())
        .with_unique(options.unique.clone())
        .with_timeout(options.timeout))
    }
}
