//! `baton-queue`
//!
//! **Responsibility:** the coordination engine of the delivery queue.
//!
//! - `cache`: typed, write-coalescing view over the persistent store
//! - `leader`: advisory leadership from a timestamped owner record
//! - `backoff`: exponential backoff deadline policy
//! - `engine`: the synchronous scheduling state machine
//! - `coordinator`: the tokio task that drives an `Engine` and runs the
//!   caller's `Processor`
//!
//! Delivery is at-least-once: a batch is removed from the head of the queue
//! only after the processor reports success, so processors must be
//! idempotent.

pub mod backoff;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod leader;
pub mod processor;
pub mod trim;

pub use backoff::BackoffPolicy;
pub use cache::{DeferredCell, OwnerRecord, QueueCache};
pub use config::{QueueConfig, TrimFn};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use engine::{CheckOutcome, CoordinatorState, Dispatch, Engine, QueueSnapshot};
pub use error::{ProcessError, QueueError, QueueResult};
pub use leader::{LeaderElection, OwnerStatus};
pub use processor::{FnProcessor, Processor, processor_fn};

pub use baton_core::{InstanceId, ItemId, QueueItem};
