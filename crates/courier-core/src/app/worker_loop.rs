//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. QueueSelector で今回のキュー順を決める
//! 2. `Broker::dequeue` で 1 件 claim（lease 発行）
//! 3. Handler を spawn し、timeout 付きで待つ
//! 4. 結果を分類して ack / retry / dead_letter
//! 5. 何もなければ `wait_for_work` で待つ（shutdown と競合させる）
//!
//! Handler のエラーや panic で worker が落ちることはない。Broker の
//! エラーは `broker_retry` で再試行し、連続失敗が閾値を超えたら fatal
//! チャネルに報告して抜ける。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::domain::options::add_std;
use crate::domain::{CourierError, CourierResult, ErrorKind};
use crate::ports::{Broker, Clock, RetryDisposition};
use crate::queue::{ClaimedTask, Lease, QueueSelector};
use crate::typed::{HandlerRegistry, TaskContext};

/// What to tell the broker about a finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settlement {
    Ack,
    Retry { delay: Duration, error: String },
    DeadLetter { error: String },
}

/// Shared, read-only wiring handed to every worker.
#[derive(Clone)]
pub(crate) struct WorkerShared {
    pub broker: Arc<dyn Broker>,
    pub registry: Arc<HandlerRegistry>,
    pub config: Arc<ProcessorConfig>,
    pub clock: Arc<dyn Clock>,
    /// Parent of every attempt's cancellation token.
    pub handlers_cancel: CancellationToken,
    pub fatal_tx: mpsc::UnboundedSender<CourierError>,
}

pub struct WorkerLoop {
    worker_id: usize,
    shared: WorkerShared,
    selector: QueueSelector,
    shutdown_rx: watch::Receiver<bool>,
    broker_failures: u32,
}

impl WorkerLoop {
    pub(crate) fn new(
        worker_id: usize,
        shared: WorkerShared,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let selector = QueueSelector::new(&shared.config.queues, shared.config.strict_priority);
        Self {
            worker_id,
            shared,
            selector,
            shutdown_rx,
            broker_failures: 0,
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub async fn run(mut self) {
        debug!(worker = self.worker_id, "worker started");
        loop {
            if self.shutting_down() {
                break;
            }

            let order = self.selector.next_order();
            let claimed = match self
                .shared
                .broker
                .dequeue(&order, 1, self.shared.config.lease_duration)
                .await
            {
                Ok(claimed) => {
                    self.broker_failures = 0;
                    claimed
                }
                Err(err) => {
                    if self.broker_failed("dequeue", err).await {
                        continue;
                    }
                    break;
                }
            };

            let Some(claim) = claimed.into_iter().next() else {
                // 空振り: enqueue の通知か poll_interval まで待つ
                tokio::select! {
                    changed = self.shutdown_rx.changed() => {
                        // sender gone: the processor was dropped
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.shared.broker.wait_for_work(&order, self.shared.config.poll_interval) => {}
                }
                continue;
            };

            let lease = claim.lease.clone();
            let settlement = self.execute(claim).await;
            if !self.settle(&lease, settlement).await {
                break;
            }
        }
        debug!(worker = self.worker_id, "worker stopped");
    }

    /// Run the handler for one claimed task and classify the result.
    async fn execute(&self, claim: ClaimedTask) -> Settlement {
        let envelope = &claim.envelope;
        let task_type = envelope.task_type().clone();

        let Some(handler) = self.shared.registry.get(&task_type) else {
            let err = CourierError::NoHandlerRegistered(task_type);
            warn!(worker = self.worker_id, task_id = %envelope.id(), "{err}");
            return Settlement::DeadLetter {
                error: err.to_string(),
            };
        };

        // The lease is sized from attempt_timeout, so a task timeout may only tighten it.
        let timeout = envelope
            .timeout()
            .map_or(self.shared.config.attempt_timeout, |t| {
                t.min(self.shared.config.attempt_timeout)
            });
        let token = self.shared.handlers_cancel.child_token();
        let ctx = TaskContext::from_claim(
            &claim,
            add_std(self.shared.clock.now(), timeout),
            token.clone(),
        );
        let payload = envelope.payload().to_vec();

        debug!(
            worker = self.worker_id,
            task_id = %envelope.id(),
            task_type = %envelope.task_type(),
            queue = envelope.queue(),
            retry_count = claim.retry_count,
            "processing task"
        );

        let mut join = tokio::spawn(async move { handler.handle_dyn(payload, ctx).await });
        let result = match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(join_error(join_err)),
            Err(_) => {
                // 待つのをやめるだけで handler は abort しない
                token.cancel();
                Err(CourierError::TimeoutExceeded(timeout))
            }
        };

        self.classify(&claim, result)
    }

    fn classify(&self, claim: &ClaimedTask, result: CourierResult<()>) -> Settlement {
        let err = match result {
            Ok(()) => return Settlement::Ack,
            Err(err) => err,
        };
        match err.kind() {
            ErrorKind::Permanent => Settlement::DeadLetter {
                error: err.to_string(),
            },
            ErrorKind::Transient | ErrorKind::Infrastructure => Settlement::Retry {
                delay: self.shared.config.retry.backoff(claim.retry_count),
                error: err.to_string(),
            },
        }
    }

    /// Report the outcome, retrying broker failures. `false` means the
    /// worker must exit.
    async fn settle(&mut self, lease: &Lease, settlement: Settlement) -> bool {
        loop {
            match self.apply(lease, &settlement).await {
                Ok(()) => {
                    self.broker_failures = 0;
                    return true;
                }
                Err(err) => {
                    if !self.broker_failed("settle", err).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn apply(&self, lease: &Lease, settlement: &Settlement) -> CourierResult<()> {
        let broker = &self.shared.broker;
        let task_id = lease.task_id;
        match settlement {
            Settlement::Ack => {
                broker.ack(lease).await?;
                debug!(worker = self.worker_id, task_id = %task_id, "task completed");
            }
            Settlement::Retry { delay, error } => match broker.retry(lease, *delay, error).await? {
                RetryDisposition::Scheduled { process_at } => {
                    warn!(worker = self.worker_id, task_id = %task_id, %process_at, error = %error, "task failed; retry scheduled");
                }
                RetryDisposition::Dead => {
                    error!(worker = self.worker_id, task_id = %task_id, error = %error, "task failed; retries exhausted");
                }
                RetryDisposition::Ignored => {
                    info!(worker = self.worker_id, task_id = %task_id, "lease lost before settling; result dropped");
                }
            },
            Settlement::DeadLetter { error } => {
                broker.dead_letter(lease, error).await?;
                error!(worker = self.worker_id, task_id = %task_id, error = %error, "task dead-lettered");
            }
        }
        Ok(())
    }

    /// Count a broker failure and back off. Returns `false` once the failure
    /// threshold is reached (fatal reported) or shutdown interrupts the wait.
    async fn broker_failed(&mut self, op: &str, err: CourierError) -> bool {
        self.broker_failures += 1;
        let config = &self.shared.config;
        if self.broker_failures >= config.broker_failure_threshold {
            error!(worker = self.worker_id, op, failures = self.broker_failures, error = %err, "broker unavailable; worker giving up");
            let fatal = CourierError::BrokerUnavailable(format!(
                "{op} failed {} times in a row: {err}",
                self.broker_failures
            ));
            let _ = self.shared.fatal_tx.send(fatal);
            return false;
        }

        let delay = config.broker_retry.backoff(self.broker_failures - 1);
        warn!(worker = self.worker_id, op, failures = self.broker_failures, ?delay, error = %err, "broker call failed; backing off");
        if op == "dequeue" {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            // settling must go through even while stopping
            tokio::time::sleep(delay).await;
        }
        true
    }
}

fn join_error(err: JoinError) -> CourierError {
    if err.is_panic() {
        CourierError::handler(format!("handler panicked: {}", panic_message(err.into_panic())))
    } else {
        CourierError::handler("handler task cancelled")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
