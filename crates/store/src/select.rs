//! Backend selection: probe the primary store, fall back to the global one.

use std::sync::Arc;

use crate::memory::GlobalStore;
use crate::store::{PersistentStore, SharedStore};

/// Return `primary` if it passes the capability probe, otherwise a
/// process-wide `GlobalStore`.
///
/// The probe runs once here; errors from the chosen store during normal
/// operation are left to each call.
pub fn select_store<S>(primary: S) -> SharedStore
where
    S: PersistentStore + 'static,
{
    if primary.works() {
        tracing::debug!(store = primary.kind(), durable = primary.durable(), "using primary store");
        Arc::new(primary)
    } else {
        tracing::warn!(
            store = primary.kind(),
            fallback = GlobalStore.kind(),
            "primary store failed its probe; falling back to non-durable store"
        );
        Arc::new(GlobalStore)
    }
}
