//! In-memory stores: an isolated map for tests/dev and the process-wide
//! global fallback.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::store::{PersistentStore, StoreError, StoreResult};

type Map = RwLock<HashMap<String, String>>;

fn save_in(map: &Map, key: &str, value: &str) -> StoreResult<()> {
    let mut guard = map.write().map_err(|_| StoreError::Poisoned)?;
    guard.insert(key.to_string(), value.to_string());
    Ok(())
}

fn load_in(map: &Map, key: &str) -> StoreResult<Option<String>> {
    let guard = map.read().map_err(|_| StoreError::Poisoned)?;
    Ok(guard.get(key).cloned())
}

fn remove_in(map: &Map, key: &str) -> StoreResult<()> {
    let mut guard = map.write().map_err(|_| StoreError::Poisoned)?;
    guard.remove(key);
    Ok(())
}

/// In-memory store for tests/dev.
///
/// Clones share the same map, which is how tests put several queue
/// instances on one "shared" store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Map>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for MemoryStore {
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        save_in(&self.inner, key, value)
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        load_in(&self.inner, key)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        remove_in(&self.inner, key)
    }

    fn durable(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

static GLOBAL: LazyLock<Map> = LazyLock::new(|| RwLock::new(HashMap::new()));

/// Process-wide in-memory store.
///
/// Every `GlobalStore` value reads and writes the same map, so instances in
/// one process still coordinate. Contents are lost when the process exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStore;

impl GlobalStore {
    pub fn new() -> Self {
        Self
    }
}

impl PersistentStore for GlobalStore {
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        save_in(&GLOBAL, key, value)
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        load_in(&GLOBAL, key)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        remove_in(&GLOBAL, key)
    }

    fn durable(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "global"
    }
}
