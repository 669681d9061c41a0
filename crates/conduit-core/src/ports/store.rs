//! SharedStore port - 共有 key-value ストア
//!
//! Job / entity status / task の正本はすべてここに置きます。
//!
//! # 設計原則
//! - 値は文字列（JSON）。型付けは呼び出し側の責務
//! - 条件付き書き込み（compare_and_swap）が唯一の排他手段
//! - TTL と簡易 pub/sub をサポート
//! - 接続が閉じられたら全操作が `StoreError::Closed` を返す

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store connection is closed")]
    Closed,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("value at `{key}` has the wrong type")]
    WrongType { key: String },
}

/// A pub/sub subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the channel is gone.
    ///
    /// Slow subscribers skip what they missed instead of failing.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<String> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// A connection to the shared store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write. `ttl: None` clears any previous expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns whether the write happened.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically replace the value if it still equals `expected`
    /// (`None` = key must be absent). Keeps any existing TTL.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    /// Delete only if the value still equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a TTL on an existing key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Append to a list; returns the new length.
    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove every occurrence of `value`; returns how many were removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Atomic counter.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Opens new connections for the store pool.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn SharedStore>, StoreError>;
}
