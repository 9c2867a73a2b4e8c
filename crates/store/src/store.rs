//! Persistent store abstraction.

use std::sync::Arc;

/// Key written by the capability probe.
pub const PROBE_KEY: &str = "queue-that-works";
const PROBE_VALUE: &str = "anything";

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared, type-erased store handle.
pub type SharedStore = Arc<dyn PersistentStore>;

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on key '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Key-value store of string values shared by every instance of a queue.
///
/// Implementations give read-your-latest-write semantics per key; no
/// locking or compare-and-swap is assumed beyond that.
pub trait PersistentStore: Send + Sync {
    /// Persist `value` under `key`, replacing any previous value.
    fn save(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Load the value under `key`, if any.
    fn load(&self, key: &str) -> StoreResult<Option<String>>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StoreResult<()>;

    /// Whether values survive a process restart.
    fn durable(&self) -> bool;

    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Capability probe: write, read back and remove a sentinel key.
    ///
    /// Any error counts as "does not work".
    fn works(&self) -> bool {
        let round_trip = || -> StoreResult<bool> {
            self.save(PROBE_KEY, PROBE_VALUE)?;
            let ok = self.load(PROBE_KEY)?.as_deref() == Some(PROBE_VALUE);
            self.remove(PROBE_KEY)?;
            Ok(ok)
        };

        match round_trip() {
            Ok(ok) => ok,
            Err(err) => {
                tracing::debug!(store = self.kind(), error = %err, "store probe failed");
                false
            }
        }
    }
}

impl<S> PersistentStore for Arc<S>
where
    S: PersistentStore + ?Sized,
{
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).save(key, value)
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).load(key)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }

    fn durable(&self) -> bool {
        (**self).durable()
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn works(&self) -> bool {
        (**self).works()
    }
}
