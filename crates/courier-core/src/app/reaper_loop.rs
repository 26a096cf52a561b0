//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. `reaper_interval` ごとに `Broker::reap_expired_leases()`
//! 2. 期限切れの active → pending（別 worker が拾い直す）
//! 3. retention を過ぎた completed を削除
//!
//! Broker エラーはログのみ。次の tick で再試行される。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::ports::Broker;

pub struct ReaperLoop {
    broker: Arc<dyn Broker>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ReaperLoop {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            broker,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.reap_once().await;
        }
        debug!("reaper stopped");
    }

    async fn reap_once(&self) {
        match self.broker.reap_expired_leases().await {
            Ok(0) => {}
            Ok(reclaimed) => info!(reclaimed, "expired leases returned to pending"),
            Err(err) => warn!(error = %err, "reap failed; retrying next tick"),
        }
    }
}
