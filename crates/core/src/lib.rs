//! `baton-core`: shared building blocks for the delivery queue.
//!
//! This crate holds the **pure** primitives (identifiers, clock, queue item)
//! that the store and queue crates agree on. No IO lives here.

pub mod clock;
pub mod error;
pub mod id;
pub mod item;

pub use clock::{Clock, ManualClock, SystemClock, UnixMillis, duration_ms};
pub use error::{CoreError, CoreResult};
pub use id::{InstanceId, ItemId};
pub use item::QueueItem;
