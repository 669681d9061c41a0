//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::RetryPolicy;

const ENV_PREFIX: &str = "CONDUIT_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse `{value}` as {expected}")]
    Invalid {
        var: String,
        value: String,
        expected: &'static str,
    },

    #[error("{var} must be greater than zero")]
    Zero { var: String },
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Store connection is released after being idle this long.
    pub idle_window: Duration,
    /// Attempts per job unless the enqueue overrides it.
    pub default_max_attempts: u32,
    /// Backoff for jobs that do not bring their own policy.
    pub default_backoff: RetryPolicy,
    /// Completed job records kept per queue (oldest evicted first).
    pub completed_retention: usize,
    /// Failed job records kept per queue (oldest evicted first).
    pub failed_retention: usize,
    /// Optional age limit for completed job records.
    pub completed_ttl: Option<Duration>,
    /// `queued` records with no job are repaired after this long.
    pub repair_grace: Duration,
    /// Upper bound on how long an idle worker slot sleeps between checks.
    pub poll_interval: Duration,
    /// Period of the idle-teardown / reconciliation loop.
    pub reaper_interval: Duration,
    /// Reported in the aggregate status snapshot.
    pub summarizer_enabled: bool,
    /// Worker slots per queue unless registered otherwise.
    pub default_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(300), // 5 minutes
            default_max_attempts: 3,
            default_backoff: RetryPolicy::default(),
            completed_retention: 100,
            failed_retention: 500,
            completed_ttl: None,
            repair_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(60), // 1 minute
            summarizer_enabled: true,
            default_concurrency: 2,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut cfg = Self::default();

        if let Some(ms) = env.parse::<u64>("IDLE_WINDOW_MS", "milliseconds")? {
            cfg.idle_window = Duration::from_millis(ms);
        }
        if let Some(n) = env.positive::<u32>("DEFAULT_MAX_ATTEMPTS")? {
            cfg.default_max_attempts = n;
        }
        if let Some(ms) = env.parse::<u64>("BACKOFF_BASE_MS", "milliseconds")? {
            cfg.default_backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse::<u64>("BACKOFF_MAX_MS", "milliseconds")? {
            cfg.default_backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env.parse::<usize>("COMPLETED_RETENTION", "a count")? {
            cfg.completed_retention = n;
        }
        if let Some(n) = env.parse::<usize>("FAILED_RETENTION", "a count")? {
            cfg.failed_retention = n;
        }
        if let Some(secs) = env.parse::<u64>("COMPLETED_TTL_SECS", "seconds")? {
            // 0 disables the age limit
            cfg.completed_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(ms) = env.parse::<u64>("REPAIR_GRACE_MS", "milliseconds")? {
            cfg.repair_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env.positive::<u64>("POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env.positive::<u64>("REAPER_INTERVAL_MS")? {
            cfg.reaper_interval = Duration::from_millis(ms);
        }
        if let Some(b) = env.parse::<bool>("SUMMARIZER_ENABLED", "true or false")? {
            cfg.summarizer_enabled = b;
        }
        if let Some(n) = env.positive::<usize>("DEFAULT_CONCURRENCY")? {
            cfg.default_concurrency = n;
        }
        Ok(cfg)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn parse<T: FromStr>(&self, name: &str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        let var = format!("{ENV_PREFIX}{name}");
        match (self.lookup)(&var) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
                var,
                value: raw,
                expected,
            }),
        }
    }

    fn positive<T: FromStr + PartialEq + Default>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.parse::<T>(name, "a positive integer")? {
            Some(v) if v == T::default() => Err(ConfigError::Zero {
                var: format!("{ENV_PREFIX}{name}"),
            }),
            other => Ok(other),
        }
    }
}
