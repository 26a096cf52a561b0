//! Processor - worker pool + reaper
//!
//! # ライフサイクル
//! - `start()`: `concurrency` 個の worker と reaper を 1 つ spawn
//! - `stop()`: 新規 claim を止め、`shutdown_grace` だけ実行中の handler を待ち、
//!   残りは cancel token を発火して abort する
//! - `fatal()`: worker が Broker を諦めたときのエラーを待つ
//!
//! stop で待ちきれなかったタスクは settle されないまま残り、lease 期限切れ後に
//! reaper が pending に戻す（at-least-once）。

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::reaper_loop::ReaperLoop;
use super::worker_loop::{WorkerLoop, WorkerShared};
use crate::config::ProcessorConfig;
use crate::domain::{CourierError, CourierResult};
use crate::ports::{Broker, Clock};
use crate::typed::HandlerRegistry;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handlers_cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

pub struct Processor {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    config: Arc<ProcessorConfig>,
    clock: Arc<dyn Clock>,
    fatal_tx: mpsc::UnboundedSender<CourierError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<CourierError>>,
    running: Option<Running>,
}

impl Processor {
    /// Use `ProcessorBuilder` unless the registry is already assembled.
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: HandlerRegistry,
        config: ProcessorConfig,
        clock: Arc<dyn Clock>,
    ) -> CourierResult<Self> {
        config.validate()?;
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Ok(Self {
            broker,
            registry: Arc::new(registry),
            config: Arc::new(config),
            clock,
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
            running: None,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the workers and the reaper. Starting twice is a config error.
    pub fn start(&mut self) -> CourierResult<()> {
        if self.running.is_some() {
            return Err(CourierError::Config("processor already started".into()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handlers_cancel = CancellationToken::new();
        let shared = WorkerShared {
            broker: Arc::clone(&self.broker),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            handlers_cancel: handlers_cancel.clone(),
            fatal_tx: self.fatal_tx.clone(),
        };

        let mut joins = Vec::with_capacity(self.config.concurrency + 1);
        for worker_id in 0..self.config.concurrency {
            let worker = WorkerLoop::new(worker_id, shared.clone(), shutdown_rx.clone());
            joins.push(tokio::spawn(worker.run()));
        }
        let reaper = ReaperLoop::new(
            Arc::clone(&self.broker),
            self.config.reaper_interval,
            shutdown_rx,
        );
        joins.push(tokio::spawn(reaper.run()));

        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues.iter().map(|q| format!("{}={}", q.name, q.weight)).collect::<Vec<_>>(),
            strict_priority = self.config.strict_priority,
            "processor started"
        );
        self.running = Some(Running {
            shutdown_tx,
            handlers_cancel,
            joins,
        });
        Ok(())
    }

    /// Stop claiming, wait up to `shutdown_grace` for in-flight handlers,
    /// then cancel and abort whatever is left. No-op when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!(grace = ?self.config.shutdown_grace, "processor stopping");
        // ignore send error: receivers may already be gone
        let _ = running.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut remaining = Vec::new();
        let mut joins = running.joins.into_iter();
        while let Some(mut join) = joins.next() {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                remaining.push(join);
                remaining.extend(joins.by_ref());
                break;
            }
        }

        if !remaining.is_empty() {
            warn!(
                unfinished = remaining.len(),
                "shutdown grace expired; cancelling in-flight handlers"
            );
            running.handlers_cancel.cancel();
            for join in &remaining {
                join.abort();
            }
            for join in remaining {
                let _ = join.await;
            }
        }
        info!("processor stopped");
    }

    /// Resolves with the first fatal error reported by a worker.
    pub async fn fatal(&self) -> CourierError {
        let mut rx = self.fatal_rx.lock().await;
        match rx.recv().await {
            Some(err) => err,
            // unreachable while `self` holds a sender
            None => std::future::pending().await,
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            running.handlers_cancel.cancel();
            for join in running.joins {
                join.abort();
            }
        }
    }
}
