//! ReaperLoop - idle 接続の解放と status の整合
//!
//! # フロー（interval ごと）
//! 1. 接続が idle_window 以上使われていなければ閉じる
//! 2. 前回の整合以降に他の利用があれば `reconcile()` で孤児 status を修復
//!
//! 自分の整合処理は「利用」に数えない。そうしないと接続が永遠に閉じない。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::domain::Result;
use crate::status::EntityStatusMachine;
use crate::store::StorePool;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperTick {
    pub closed_idle: bool,
    pub repaired: usize,
}

pub struct ReaperLoop {
    pool: StorePool,
    statuses: EntityStatusMachine,
    interval: Duration,
    /// Pool activity right after our own last reconcile.
    reconciled_at: Option<DateTime<Utc>>,
}

impl ReaperLoop {
    pub fn new(pool: StorePool, statuses: EntityStatusMachine, interval: Duration) -> Self {
        Self {
            pool,
            statuses,
            interval,
            reconciled_at: None,
        }
    }

    pub async fn tick(&mut self) -> Result<ReaperTick> {
        let mut tick = ReaperTick {
            closed_idle: self.statuses.close_if_idle().await,
            ..ReaperTick::default()
        };
        if tick.closed_idle || !self.pool.is_connected() {
            return Ok(tick);
        }
        if self.reconciled_at == Some(self.pool.last_activity()) {
            return Ok(tick);
        }

        tick.repaired = self.statuses.reconcile().await?;
        self.reconciled_at = Some(self.pool.last_activity());
        Ok(tick)
    }

    /// Tick every `interval` until shutdown is requested.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => match self.tick().await {
                    Ok(tick) if tick != ReaperTick::default() => debug!(?tick, "reaper tick"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reaper tick failed"),
                },
            }
        }
        debug!("reaper loop stopped");
    }
}
