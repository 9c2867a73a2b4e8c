//! Queue configuration.

use std::sync::Arc;
use std::time::Duration;

use baton_core::QueueItem;

use crate::error::QueueError;

pub const DEFAULT_QUEUE_LABEL: &str = "Queue That";
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const QUEUE_GROUP_TIME: Duration = Duration::from_millis(100);
pub const BACKOFF_TIME: Duration = Duration::from_millis(1000);
pub const PROCESS_TIMEOUT: Duration = Duration::from_millis(2000);
pub const ACTIVE_QUEUE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Transform applied to the whole queue after every enqueue.
pub type TrimFn = Arc<dyn Fn(Vec<QueueItem>) -> Vec<QueueItem> + Send + Sync>;

/// Configuration of one queue instance.
#[derive(Clone)]
pub struct QueueConfig {
    /// Shared name of the logical queue; every store key derives from it.
    pub label: String,
    /// Maximum number of items handed to the processor at once.
    pub batch_size: usize,
    /// Optional trim applied after each enqueue (identity when `None`).
    pub trim: Option<TrimFn>,
    /// Debounce delay between an enqueue and the check it triggers.
    pub queue_group_time: Duration,
    /// Base of the exponential backoff.
    pub backoff_time: Duration,
    /// Optional ceiling on a single backoff delay. `None` keeps growth
    /// unbounded.
    pub max_backoff: Option<Duration>,
    /// How long a batch may stay in flight before it counts as failed.
    pub process_timeout: Duration,
    /// Liveness window of the active-owner record; also the period of the
    /// fallback check.
    pub active_queue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_QUEUE_LABEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            trim: None,
            queue_group_time: QUEUE_GROUP_TIME,
            backoff_time: BACKOFF_TIME,
            max_backoff: None,
            process_timeout: PROCESS_TIMEOUT,
            active_queue_timeout: ACTIVE_QUEUE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("label", &self.label)
            .field("batch_size", &self.batch_size)
            .field("trim", &self.trim.as_ref().map(|_| "<fn>"))
            .field("queue_group_time", &self.queue_group_time)
            .field("backoff_time", &self.backoff_time)
            .field("max_backoff", &self.max_backoff)
            .field("process_timeout", &self.process_timeout)
            .field("active_queue_timeout", &self.active_queue_timeout)
            .finish()
    }
}

impl QueueConfig {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_trim<F>(mut self, trim: F) -> Self
    where
        F: Fn(Vec<QueueItem>) -> Vec<QueueItem> + Send + Sync + 'static,
    {
        self.trim = Some(Arc::new(trim));
        self
    }

    pub fn with_queue_group_time(mut self, delay: Duration) -> Self {
        self.queue_group_time = delay;
        self
    }

    pub fn with_backoff_time(mut self, base: Duration) -> Self {
        self.backoff_time = base;
        self
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_active_queue_timeout(mut self, timeout: Duration) -> Self {
        self.active_queue_timeout = timeout;
        self
    }

    /// Check the invariants the coordinator relies on.
    ///
    /// The process timeout must be strictly shorter than the liveness
    /// window so a stalled owner's claim can lapse no earlier than its own
    /// timeout fires.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.label.trim().is_empty() {
            return Err(QueueError::config("label must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(QueueError::config("batch_size must be greater than zero"));
        }
        if self.process_timeout.is_zero() {
            return Err(QueueError::config("process_timeout must be greater than zero"));
        }
        if self.process_timeout >= self.active_queue_timeout {
            return Err(QueueError::config(format!(
                "active_queue_timeout ({:?}) must be greater than process_timeout ({:?})",
                self.active_queue_timeout, self.process_timeout
            )));
        }
        if let Some(cap) = self.max_backoff {
            if cap < self.backoff_time {
                return Err(QueueError::config(
                    "max_backoff must not be smaller than backoff_time",
                ));
            }
        }
        Ok(())
    }

    /// Defaults overlaid with `BATON_*` environment variables.
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Recognised keys: `BATON_LABEL`, `BATON_BATCH_SIZE`,
    /// `BATON_QUEUE_GROUP_MS`, `BATON_BACKOFF_MS`, `BATON_MAX_BACKOFF_MS`,
    /// `BATON_PROCESS_TIMEOUT_MS`, `BATON_ACTIVE_QUEUE_TIMEOUT_MS`, and
    /// `BATON_MAX_QUEUE_LEN` (keeps only the newest items).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, QueueError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(label) = lookup("BATON_LABEL") {
            config.label = label;
        }
        if let Some(raw) = lookup("BATON_BATCH_SIZE") {
            config.batch_size = raw.trim().parse().map_err(|e| {
                QueueError::config(format!("BATON_BATCH_SIZE: invalid value '{raw}': {e}"))
            })?;
        }
        if let Some(ms) = parse_ms(&lookup, "BATON_QUEUE_GROUP_MS")? {
            config.queue_group_time = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "BATON_BACKOFF_MS")? {
            config.backoff_time = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "BATON_MAX_BACKOFF_MS")? {
            config.max_backoff = Some(ms);
        }
        if let Some(ms) = parse_ms(&lookup, "BATON_PROCESS_TIMEOUT_MS")? {
            config.process_timeout = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "BATON_ACTIVE_QUEUE_TIMEOUT_MS")? {
            config.active_queue_timeout = ms;
        }
        if let Some(raw) = lookup("BATON_MAX_QUEUE_LEN") {
            let max: usize = raw.trim().parse().map_err(|e| {
                QueueError::config(format!("BATON_MAX_QUEUE_LEN: invalid value '{raw}': {e}"))
            })?;
            config.trim = Some(crate::trim::cap(max));
        }

        Ok(config)
    }
}

fn parse_ms<F>(lookup: &F, key: &str) -> Result<Option<Duration>, QueueError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| QueueError::config(format!("{key}: invalid milliseconds '{raw}': {e}"))),
    }
}
