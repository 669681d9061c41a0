//! StorePool - 共有ストア接続のプール
//!
//! # 仕組み
//! - 接続は最初の `acquire()` で遅延生成し、以降は全コンポーネントで共有
//! - `acquire()` が返す `StoreConn` ガードが生きている間は in-flight として数える
//! - `close_if_idle()` は「in-flight が 0」かつ「最後の利用から idle_window 経過」を
//!   ロックの中で確認してから接続を閉じる。処理中の操作を中断することはない
//! - 閉じた後の `acquire()` は新しい接続を張り直す

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::ports::{Clock, SharedStore, StoreConnector, StoreError};

struct PoolState {
    conn: Option<Arc<dyn SharedStore>>,
    in_flight: usize,
    last_activity: DateTime<Utc>,
}

struct PoolInner {
    connector: Arc<dyn StoreConnector>,
    clock: Arc<dyn Clock>,
    idle_window: Duration,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a guard for `conn`. Caller holds the state lock.
    fn checkout(self: &Arc<Self>, state: &mut PoolState, conn: Arc<dyn SharedStore>) -> StoreConn {
        state.in_flight += 1;
        state.last_activity = self.clock.now();
        StoreConn {
            conn,
            pool: Arc::clone(self),
        }
    }
}

/// Shared, lazily connected store handle. Cloning shares the same connection.
#[derive(Clone)]
pub struct StorePool {
    inner: Arc<PoolInner>,
}

impl StorePool {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        clock: Arc<dyn Clock>,
        idle_window: Duration,
    ) -> Self {
        let now = clock.now();
        Self {
            inner: Arc::new(PoolInner {
                connector,
                clock,
                idle_window,
                state: Mutex::new(PoolState {
                    conn: None,
                    in_flight: 0,
                    last_activity: now,
                }),
            }),
        }
    }

    /// Borrow the connection, connecting first if needed.
    pub async fn acquire(&self) -> Result<StoreConn, StoreError> {
        {
            let mut state = self.inner.state();
            if let Some(conn) = state.conn.clone() {
                return Ok(self.inner.checkout(&mut state, conn));
            }
        }

        // connect() は await するのでロックの外で行う
        let fresh = self.inner.connector.connect().await?;

        let (guard, redundant) = {
            let mut state = self.inner.state();
            match state.conn.clone() {
                // 並行 acquire が先に接続していた
                Some(existing) => (self.inner.checkout(&mut state, existing), Some(fresh)),
                None => {
                    state.conn = Some(Arc::clone(&fresh));
                    (self.inner.checkout(&mut state, fresh), None)
                }
            }
        };

        match redundant {
            Some(extra) => {
                if let Err(e) = extra.close().await {
                    warn!(error = %e, "failed to close redundant store connection");
                }
            }
            None => info!("store connection opened"),
        }
        Ok(guard)
    }

    /// Close the connection if nothing holds it and it has been idle for the
    /// configured window. Returns whether a connection was closed.
    pub async fn close_if_idle(&self) -> bool {
        let conn = {
            let mut state = self.inner.state();
            let idle_for = self.inner.clock.now() - state.last_activity;
            let window = chrono::Duration::from_std(self.inner.idle_window)
                .unwrap_or(chrono::Duration::days(3650));

            if state.conn.is_none() || state.in_flight > 0 || idle_for < window {
                return false;
            }
            state.conn.take()
        };

        let Some(conn) = conn else {
            return false;
        };
        if let Err(e) = conn.close().await {
            warn!(error = %e, "error while closing idle store connection");
        }
        info!(idle_window = ?self.inner.idle_window, "idle store connection closed");
        true
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().conn.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight
    }

    /// When a borrowed connection was last handed out or returned.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.state().last_activity
    }
}

/// A borrowed connection. Counts as in-flight until dropped.
pub struct StoreConn {
    conn: Arc<dyn SharedStore>,
    pool: Arc<PoolInner>,
}

impl Deref for StoreConn {
    type Target = dyn SharedStore;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for StoreConn {
    fn drop(&mut self) {
        let mut state = self.pool.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_activity = self.pool.clock.now();
        debug!(in_flight = state.in_flight, "store connection released");
    }
}
