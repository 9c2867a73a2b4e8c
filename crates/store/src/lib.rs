//! `baton-store`
//!
//! **Responsibility:** the persistent key-value contract shared by every
//! queue instance, plus the reference backends.
//!
//! - `PersistentStore`: save/load/remove of string values, a capability probe
//!   and a durability flag
//! - `FileStore`: durable, one file per key
//! - `GlobalStore`: process-wide in-memory fallback (lost on restart)
//! - `MemoryStore`: isolated in-memory map for tests/dev
//! - `select_store`: probe a primary store, fall back to `GlobalStore`

pub mod file;
pub mod keys;
pub mod memory;
pub mod select;
pub mod store;

pub use file::FileStore;
pub use keys::QueueKeys;
pub use memory::{GlobalStore, MemoryStore};
pub use select::select_store;
pub use store::{PersistentStore, SharedStore, StoreError, StoreResult};
