//! Typed, write-coalescing view over the persistent store.
//!
//! Only the queue itself is cached. The scalar fields (error count, backoff
//! deadline, processing flag, active owner) are how instances coordinate, so
//! every read of them goes straight to the store.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use baton_core::{InstanceId, ItemId, QueueItem, UnixMillis};
use baton_store::{PersistentStore, QueueKeys, SharedStore};

use crate::config::TrimFn;

/// Deferred-write cache for one store key.
///
/// - the first read in a tick loads and caches the value and schedules a
///   flush
/// - writes replace the cached value and mark a pending write
/// - `flush` persists a pending write (if any) and drops the cached value so
///   the next tick re-reads what other instances wrote
///
/// Any number of writes between two flushes cost one store write.
///
/// A stored value that fails to decode reads as `T::default()`, but the cell
/// will not overwrite it: writes are dropped (and logged) until the key is
/// readable again or the cell is discarded.
#[derive(Debug)]
pub struct DeferredCell<T> {
    key: String,
    cached: Option<T>,
    write_pending: bool,
    flush_scheduled: bool,
    unreadable: bool,
}

impl<T> DeferredCell<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cached: None,
            write_pending: false,
            flush_scheduled: false,
            unreadable: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_write_pending(&self) -> bool {
        self.write_pending
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    /// Whether the last load found a value that could not be decoded.
    pub fn is_unreadable(&self) -> bool {
        self.unreadable
    }

    /// Current value, loading it from `store` on a cold read.
    ///
    /// A missing or unreadable value reads as `T::default()`.
    pub fn get(&mut self, store: &dyn PersistentStore) -> &mut T {
        if self.cached.is_none() {
            self.unreadable = false;
            let value = match store.load(&self.key) {
                Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                    tracing::error!(key = %self.key, error = %err, "stored value is unreadable, writes to it are suspended");
                    self.unreadable = true;
                    T::default()
                }),
                Ok(None) => T::default(),
                Err(err) => {
                    tracing::error!(key = %self.key, error = %err, "failed to load cached value");
                    T::default()
                }
            };
            self.cached = Some(value);
            self.flush_scheduled = true;
        }
        self.cached.get_or_insert_with(T::default)
    }

    /// Replace the value; persisted at the next flush.
    pub fn set(&mut self, value: T) {
        self.cached = Some(value);
        self.write_pending = true;
        self.flush_scheduled = true;
    }

    /// Persist a pending write and invalidate the read cache.
    ///
    /// If the write fails the value stays cached and pending, so it is
    /// retried on the next flush instead of being dropped.
    pub fn flush(&mut self, store: &dyn PersistentStore) {
        self.flush_scheduled = false;

        if self.write_pending && self.unreadable {
            tracing::error!(key = %self.key, "not overwriting an unreadable stored value; write dropped");
            self.write_pending = false;
        }

        if self.write_pending {
            let Some(value) = self.cached.as_ref() else {
                self.write_pending = false;
                return;
            };
            let result = serde_json::to_string(value)
                .map_err(|e| e.to_string())
                .and_then(|raw| store.save(&self.key, &raw).map_err(|e| e.to_string()));

            match result {
                Ok(()) => self.write_pending = false,
                Err(err) => {
                    tracing::error!(key = %self.key, error = %err, "failed to persist cached value");
                    return;
                }
            }
        }

        self.cached = None;
    }

    /// Run the flush scheduled by this tick's reads/writes, if any.
    pub fn end_tick(&mut self, store: &dyn PersistentStore) {
        if self.flush_scheduled {
            self.flush(store);
        }
    }

    /// Forget the cached value and any pending write.
    pub fn discard(&mut self) {
        self.cached = None;
        self.write_pending = false;
        self.flush_scheduled = false;
        self.unreadable = false;
    }
}

/// The persisted queue.
///
/// Entries that do not decode as a [`QueueItem`] (written by another version,
/// or by hand) are never dispatched, but they are written back ahead of the
/// items so a queue write cannot destroy them.
#[derive(Debug, Clone, Default, PartialEq)]
struct QueueRecord {
    items: Vec<QueueItem>,
    foreign: Vec<Value>,
}

impl Serialize for QueueRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.foreign.len() + self.items.len()))?;
        for entry in &self.foreign {
            seq.serialize_element(entry)?;
        }
        for item in &self.items {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for QueueRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut record = QueueRecord::default();
        for entry in Vec::<Value>::deserialize(deserializer)? {
            match QueueItem::deserialize(&entry) {
                Ok(item) => record.items.push(item),
                Err(_) => record.foreign.push(entry),
            }
        }
        if !record.foreign.is_empty() {
            tracing::warn!(count = record.foreign.len(), "keeping undecodable queue entries as-is");
        }
        Ok(record)
    }
}

/// Persisted active-owner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct OwnerRecord {
    pub id: InstanceId,
    /// Claim time (unix ms).
    pub ts: UnixMillis,
}

/// Typed accessors for one queue label, backed by a shared store.
pub struct QueueCache {
    store: SharedStore,
    keys: QueueKeys,
    queue: DeferredCell<QueueRecord>,
    trim: Option<TrimFn>,
}

impl std::fmt::Debug for QueueCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCache")
            .field("store", &self.store.kind())
            .field("keys", &self.keys)
            .field("queue", &self.queue)
            .finish()
    }
}

impl QueueCache {
    pub fn new(store: SharedStore, label: &str, trim: Option<TrimFn>) -> Self {
        let keys = QueueKeys::for_label(label);
        Self {
            queue: DeferredCell::new(keys.queue.clone()),
            store,
            keys,
            trim,
        }
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ---- queue (cached) ----

    /// The whole queue, oldest first.
    pub fn queue(&mut self) -> &[QueueItem] {
        &self.queue.get(self.store.as_ref()).items
    }

    pub fn set_queue(&mut self, queue: Vec<QueueItem>) {
        let mut record = std::mem::take(self.queue.get(self.store.as_ref()));
        record.items = queue;
        self.queue.set(record);
    }

    /// Append an item and apply the trim.
    pub fn enqueue(&mut self, item: QueueItem) {
        let mut queue = std::mem::take(&mut self.queue.get(self.store.as_ref()).items);
        queue.push(item);
        let queue = match &self.trim {
            Some(trim) => trim(queue),
            None => queue,
        };
        self.set_queue(queue);
    }

    /// Up to `n` items from the head of the queue.
    pub fn head(&mut self, n: usize) -> Vec<QueueItem> {
        self.queue().iter().take(n).cloned().collect()
    }

    /// Remove the delivered items `ids`, wherever they now sit.
    ///
    /// Items that are already gone (removed by another instance, or trimmed)
    /// are skipped, and nothing else is touched, so removing a stale batch is
    /// a no-op. Returns how many items were removed.
    pub fn remove_delivered(&mut self, ids: &[ItemId]) -> usize {
        let delivered: HashSet<ItemId> = ids.iter().copied().collect();
        let queue = self.queue();
        if !queue.iter().any(|item| delivered.contains(&item.id)) {
            return 0;
        }

        let before = queue.len();
        let rest: Vec<QueueItem> = queue
            .iter()
            .filter(|item| !delivered.contains(&item.id))
            .cloned()
            .collect();
        let removed = before - rest.len();
        self.set_queue(rest);
        removed
    }

    pub fn len(&mut self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.queue().is_empty()
    }

    /// Persist pending queue writes and invalidate the read cache.
    pub fn flush(&mut self) {
        self.queue.flush(self.store.as_ref());
    }

    /// End-of-tick hook: run the deferred flush if one is scheduled.
    pub fn end_tick(&mut self) {
        self.queue.end_tick(self.store.as_ref());
    }

    pub fn has_pending_write(&self) -> bool {
        self.queue.is_write_pending()
    }

    // ---- scalar fields (never cached) ----

    pub fn error_count(&self) -> u32 {
        self.load_parsed(&self.keys.error_count).unwrap_or(0)
    }

    pub fn set_error_count(&self, count: u32) {
        self.save(&self.keys.error_count, &count.to_string());
    }

    /// Absolute backoff deadline (unix ms); 0 when unset.
    pub fn backoff_deadline(&self) -> UnixMillis {
        self.load_parsed(&self.keys.backoff_time).unwrap_or(0)
    }

    pub fn set_backoff_deadline(&self, deadline: UnixMillis) {
        self.save(&self.keys.backoff_time, &deadline.to_string());
    }

    pub fn processing(&self) -> bool {
        self.load_parsed::<i64>(&self.keys.queue_processing)
            .map(|n| n != 0)
            .unwrap_or(false)
    }

    pub fn set_processing(&self, processing: bool) {
        self.save(&self.keys.queue_processing, if processing { "1" } else { "0" });
    }

    pub fn active_owner(&self) -> Option<OwnerRecord> {
        let raw = self.load(&self.keys.active_queue)?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(key = %self.keys.active_queue, error = %err, "ignoring unreadable owner record");
                None
            }
        }
    }

    pub fn set_active_owner(&self, id: InstanceId, now: UnixMillis) {
        let record = OwnerRecord { id, ts: now };
        match serde_json::to_string(&record) {
            Ok(raw) => self.save(&self.keys.active_queue, &raw),
            Err(err) => tracing::error!(error = %err, "failed to encode owner record"),
        }
    }

    pub fn clear_active_owner(&self) {
        self.remove(&self.keys.active_queue);
    }

    /// Remove every key of this queue from the store.
    pub fn reset(&mut self) {
        self.queue.discard();
        for key in self.keys.all() {
            self.remove(key);
        }
    }

    // ---- raw store access ----

    fn load(&self, key: &str) -> Option<String> {
        match self.store.load(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(key, error = %err, "store load failed");
                None
            }
        }
    }

    fn load_parsed<V: std::str::FromStr>(&self, key: &str) -> Option<V> {
        let raw = self.load(key)?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable store value");
                None
            }
        }
    }

    fn save(&self, key: &str, value: &str) {
        if let Err(err) = self.store.save(key, value) {
            tracing::error!(key, error = %err, "store save failed");
        }
    }

    fn remove(&self, key: &str) {
        if let Err(err) = self.store.remove(key) {
            tracing::error!(key, error = %err, "store remove failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use baton_store::{MemoryStore, StoreResult};
    use proptest::prelude::*;
    use serde_json::json;

    /// MemoryStore wrapper that counts writes.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        saves: AtomicUsize,
    }

    impl PersistentStore for CountingStore {
        fn save(&self, key: &str, value: &str) -> StoreResult<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, value)
        }

        fn load(&self, key: &str) -> StoreResult<Option<String>> {
            self.inner.load(key)
        }

        fn remove(&self, key: &str) -> StoreResult<()> {
            self.inner.remove(key)
        }

        fn durable(&self) -> bool {
            false
        }

        fn kind(&self) -> &'static str {
            "counting"
        }
    }

    fn item(n: i64) -> QueueItem {
        QueueItem::new(json!({ "n": n }), n).unwrap()
    }

    fn cache_on(store: SharedStore) -> QueueCache {
        QueueCache::new(store, "test", None)
    }

    #[test]
    fn enqueue_then_read_returns_item_at_tail() {
        let mut cache = cache_on(Arc::new(MemoryStore::new()));
        cache.enqueue(item(1));
        cache.enqueue(item(2));

        let queue = cache.queue();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[1].field("n"), Some(&json!(2)));
    }

    #[test]
    fn writes_within_one_tick_coalesce_into_one_save() {
        let store = Arc::new(CountingStore::default());
        let mut cache = cache_on(store.clone());

        for n in 0..10 {
            cache.enqueue(item(n));
        }
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);
        assert!(cache.has_pending_write());

        cache.end_tick();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert!(!cache.has_pending_write());

        // Nothing scheduled: the next tick end is a no-op.
        cache.end_tick();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_without_pending_write_only_invalidates() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut mine = cache_on(store.clone());
        let mut theirs = cache_on(store.clone());

        assert!(mine.is_empty());

        theirs.enqueue(item(1));
        theirs.end_tick();

        // Still cached within this tick.
        assert!(mine.is_empty());

        mine.flush();
        assert_eq!(mine.len(), 1);
    }

    #[test]
    fn flush_is_idempotent() {
        let store = Arc::new(CountingStore::default());
        let mut cache = cache_on(store.clone());
        cache.enqueue(item(1));

        cache.flush();
        cache.flush();
        cache.flush();
        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    fn ids(cache: &mut QueueCache) -> Vec<ItemId> {
        cache.queue().iter().map(|item| item.id).collect()
    }

    #[test]
    fn remove_delivered_takes_only_the_given_items() {
        let mut cache = cache_on(Arc::new(MemoryStore::new()));
        for n in 0..4 {
            cache.enqueue(item(n));
        }
        let all = ids(&mut cache);

        assert_eq!(cache.remove_delivered(&all[..2]), 2);
        assert_eq!(ids(&mut cache), all[2..]);
    }

    #[test]
    fn removing_a_stale_batch_is_a_no_op() {
        let store = Arc::new(CountingStore::default());
        let mut cache = cache_on(store.clone());
        for n in 0..4 {
            cache.enqueue(item(n));
        }
        cache.end_tick();
        let all = ids(&mut cache);

        assert_eq!(cache.remove_delivered(&all[..2]), 2);
        cache.end_tick();
        let saves = store.saves.load(Ordering::SeqCst);

        // Same batch again: already gone, nothing is written.
        assert_eq!(cache.remove_delivered(&all[..2]), 0);
        cache.end_tick();
        assert_eq!(store.saves.load(Ordering::SeqCst), saves);
        assert_eq!(ids(&mut cache), all[2..]);
    }

    #[test]
    fn remove_delivered_skips_items_that_were_trimmed() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut cache = QueueCache::new(store, "test", Some(crate::trim::cap(3)));
        for n in 0..3 {
            cache.enqueue(item(n));
        }
        let batch = ids(&mut cache);

        // A newer item pushes the oldest delivered one out.
        cache.enqueue(item(3));
        let undelivered = ids(&mut cache)[2];

        assert_eq!(cache.remove_delivered(&batch), 2);
        assert_eq!(ids(&mut cache), vec![undelivered]);
    }

    #[test]
    fn trim_runs_after_every_enqueue() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut cache = QueueCache::new(store, "test", Some(crate::trim::cap(2)));

        for n in 0..5 {
            cache.enqueue(item(n));
        }
        let kept: Vec<_> = cache.queue().iter().map(|i| i.ts).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    #[test]
    fn scalar_fields_default_when_absent() {
        let cache = cache_on(Arc::new(MemoryStore::new()));
        assert_eq!(cache.error_count(), 0);
        assert_eq!(cache.backoff_deadline(), 0);
        assert!(!cache.processing());
        assert!(cache.active_owner().is_none());
    }

    #[test]
    fn scalar_fields_bypass_the_cache() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mine = cache_on(store.clone());
        let theirs = cache_on(store.clone());

        theirs.set_error_count(3);
        theirs.set_backoff_deadline(1_234);
        theirs.set_processing(true);
        assert_eq!(mine.error_count(), 3);
        assert_eq!(mine.backoff_deadline(), 1_234);
        assert!(mine.processing());

        let owner = InstanceId::new();
        theirs.set_active_owner(owner, 99);
        assert_eq!(mine.active_owner(), Some(OwnerRecord { id: owner, ts: 99 }));

        theirs.clear_active_owner();
        assert!(mine.active_owner().is_none());
    }

    #[test]
    fn scalar_values_use_plain_text_encoding() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone());
        cache.set_error_count(2);
        cache.set_processing(true);

        assert_eq!(store.load("test - Error Count").unwrap().as_deref(), Some("2"));
        assert_eq!(store.load("test - Queue Processing").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn garbage_in_the_store_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.save("test - Queue", "{not json").unwrap();
        store.save("test - Error Count", "many").unwrap();
        store.save("test - Active Queue", "[]").unwrap();

        let mut cache = cache_on(store.clone());
        assert!(cache.is_empty());
        assert_eq!(cache.error_count(), 0);
        assert!(cache.active_owner().is_none());
    }

    #[test]
    fn undecodable_entries_survive_a_queue_write() {
        let store = Arc::new(MemoryStore::new());
        store
            .save("test - Queue", r#"[{"id":1,"ts":1,"a":1},{"id":"legacy","ts":2}]"#)
            .unwrap();

        let mut cache = cache_on(store.clone());
        assert_eq!(cache.len(), 1);
        cache.enqueue(item(9));
        cache.end_tick();

        let raw = store.load("test - Queue").unwrap().unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(&json!({"id": "legacy", "ts": 2})));
        assert!(entries.contains(&json!({"id": 1, "ts": 1, "a": 1})));

        // The readable items keep their order behind the foreign entry.
        let kept: Vec<i64> = cache.queue().iter().map(|i| i.ts).collect();
        assert_eq!(kept, vec![1, 9]);
    }

    #[test]
    fn unreadable_queue_record_is_never_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.save("test - Queue", "{not json").unwrap();

        let mut cache = cache_on(store.clone());
        cache.enqueue(item(1));
        cache.end_tick();
        assert_eq!(store.load("test - Queue").unwrap().as_deref(), Some("{not json"));

        // Once the key is cleared the queue is writable again.
        cache.reset();
        cache.enqueue(item(2));
        cache.end_tick();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reset_removes_every_key() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = cache_on(store.clone());
        cache.enqueue(item(1));
        cache.flush();
        cache.set_error_count(1);
        cache.set_backoff_deadline(5);
        cache.set_processing(true);
        cache.set_active_owner(InstanceId::new(), 5);
        assert_eq!(store.len(), 5);

        cache.reset();
        assert!(store.is_empty());
        assert!(cache.is_empty());
    }

    proptest! {
        /// Property: any interleaving of enqueues and removals of delivered
        /// head batches keeps the surviving items in insertion order, across
        /// tick boundaries.
        #[test]
        fn order_is_preserved(ops in prop::collection::vec((any::<bool>(), 0usize..4), 1..40)) {
            let mut cache = cache_on(Arc::new(MemoryStore::new()));
            let mut model: Vec<i64> = Vec::new();
            let mut next = 0i64;

            for (is_enqueue, n) in ops {
                if is_enqueue {
                    cache.enqueue(item(next));
                    model.push(next);
                    next += 1;
                } else {
                    let batch: Vec<ItemId> = cache.head(n).iter().map(|i| i.id).collect();
                    cache.remove_delivered(&batch);
                    model.drain(..n.min(model.len()));
                }
                cache.end_tick();
            }

            let actual: Vec<i64> = cache.queue().iter().map(|i| i.ts).collect();
            prop_assert_eq!(actual, model);
        }
    }
}
