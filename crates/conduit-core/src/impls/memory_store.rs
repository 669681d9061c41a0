//! MemoryStore - 開発・テスト用の共有ストア
//!
//! # 構成
//! - `MemoryBackend`: データ本体（「サーバー」に相当）。接続より長生きする
//! - `MemoryStore`: 1 本の接続。close すると以降の操作は `StoreError::Closed`
//! - `MemoryConnector`: StorePool が使う接続ファクトリ
//!
//! 各操作は std Mutex の中で完結する（ロックを跨いで await しない）。
//! TTL は注入された Clock で判定するので、テストでは FixedClock で期限切れを再現できる。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::ports::{Clock, SharedStore, StoreConnector, StoreError, Subscription, SystemClock};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Backing data shared by every connection.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        })
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Open a connection directly, bypassing any pool.
    pub fn connect(self: &Arc<Self>) -> MemoryStore {
        MemoryStore {
            backend: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, broadcast::Sender<String>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(3650))
        })
    }
}

/// Drop `key` if its TTL has passed, then return the live entry.
fn live<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<&'a mut Entry> {
    let expired = data
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        data.remove(key);
    }
    data.get_mut(key)
}

fn as_str<'a>(entry: &'a Entry, key: &str) -> Result<&'a str, StoreError> {
    match &entry.value {
        Value::Str(s) => Ok(s),
        Value::List(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

fn as_list<'a>(entry: &'a mut Entry, key: &str) -> Result<&'a mut VecDeque<String>, StoreError> {
    match &mut entry.value {
        Value::List(l) => Ok(l),
        Value::Str(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

/// One connection to a [`MemoryBackend`].
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<&MemoryBackend, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if !self.backend.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend is offline".into()));
        }
        Ok(&self.backend)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => as_str(entry, key).map(|s| Some(s.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let backend = self.check()?;
        let entry = Entry {
            value: Value::Str(value.to_string()),
            expires_at: backend.expiry(ttl),
        };
        backend.data().insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        if live(&mut data, key, now).is_some() {
            return Ok(false);
        }
        let entry = Entry {
            value: Value::Str(value.to_string()),
            expires_at: backend.expiry(ttl),
        };
        data.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match (live(&mut data, key, now), expected) {
            (None, None) => {
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(new.to_string()),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
            (Some(entry), Some(expected)) => {
                if as_str(entry, key)? != expected {
                    return Ok(false);
                }
                entry.value = Value::Str(new.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        let matches = match live(&mut data, key, now) {
            Some(entry) => as_str(entry, key)? == expected,
            None => false,
        };
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        let existed = live(&mut data, key, now).is_some();
        data.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let expires_at = backend.expiry(Some(ttl));
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        if live(&mut data, key, now).is_none() {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        let entry = data.get_mut(key).ok_or(StoreError::WrongType {
            key: key.to_string(),
        })?;
        let list = as_list(entry, key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => Ok(as_list(entry, key)?.iter().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => Ok(as_list(entry, key)?.len()),
            None => Ok(0),
        }
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => Ok(as_list(entry, key)?.pop_front()),
            None => Ok(None),
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        match live(&mut data, key, now) {
            Some(entry) => {
                let list = as_list(entry, key)?;
                let before = list.len();
                list.retain(|v| v != value);
                Ok(before - list.len())
            }
            None => Ok(0),
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let backend = self.check()?;
        let now = backend.clock.now();
        let mut data = backend.data();
        let current = match live(&mut data, key, now) {
            Some(entry) => as_str(entry, key)?
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType {
                    key: key.to_string(),
                })?,
            None => 0,
        };
        let next = current + delta;
        let expires_at = data.get(key).and_then(|e| e.expires_at);
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let backend = self.check()?;
        let channels = backend.channels();
        // send は受信者がいないと Err になるが、pub/sub としては 0 件配送で正常
        Ok(channels
            .get(channel)
            .map(|tx| tx.send(message.to_string()).unwrap_or(0))
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let backend = self.check()?;
        let mut channels = backend.channels();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Subscription::new(tx.subscribe()))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connection factory for [`StorePool`](crate::store::StorePool).
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// How many connections have been opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn SharedStore>, StoreError> {
        if !self.backend.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend is offline".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.backend.connect()))
    }
}
