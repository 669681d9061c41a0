//! JSON records on top of the string store.
//!
//! `update_record` is the one read-modify-write primitive every transition goes
//! through: read the raw value, let the caller decide the new record, and write it
//! back with compare-and-swap against the exact bytes that were read. A lost race
//! re-reads and re-decides.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::domain::{PipelineError, Result};
use crate::ports::{SharedStore, StoreError};

/// Attempts before giving up on a hot key.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Decision returned by an `update_record` closure.
pub(crate) struct Update<T, R> {
    /// `Some` = write this record, `None` = leave the store untouched.
    pub write: Option<T>,
    pub result: R,
}

impl<T, R> Update<T, R> {
    pub fn write(record: T, result: R) -> Self {
        Self {
            write: Some(record),
            result,
        }
    }

    pub fn skip(result: R) -> Self {
        Self {
            write: None,
            result,
        }
    }
}

pub(crate) async fn read_record<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) async fn write_record<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    record: &T,
) -> Result<()> {
    let raw = serde_json::to_string(record)?;
    store.set(key, &raw, None).await?;
    Ok(())
}

/// Conditional read-modify-write of one JSON record.
pub(crate) async fn update_record<T, R, F>(
    store: &dyn SharedStore,
    key: &str,
    mut decide: F,
) -> Result<R>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Update<T, R>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let raw = store.get(key).await?;
        let current = match raw.as_deref() {
            Some(s) => Some(serde_json::from_str::<T>(s)?),
            None => None,
        };

        let Update { write, result } = decide(current);
        let Some(next) = write else {
            return Ok(result);
        };

        let encoded = serde_json::to_string(&next)?;
        if store
            .compare_and_swap(key, raw.as_deref(), &encoded)
            .await?
        {
            return Ok(result);
        }
    }

    warn!(key, "compare-and-swap kept losing; giving up");
    Err(PipelineError::Store(StoreError::Unavailable(format!(
        "too much contention on `{key}`"
    ))))
}

/// Parse every id in a list, dropping entries that do not parse.
pub(crate) fn parse_ids<I: std::str::FromStr>(raw: Vec<String>) -> Vec<I> {
    raw.into_iter().filter_map(|s| s.parse().ok()).collect()
}
