//! The caller-supplied batch processor.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use baton_core::QueueItem;

use crate::error::ProcessError;

/// Delivers one batch.
///
/// Returning `Ok` removes the batch from the queue; returning an error (or
/// not returning within the process timeout) keeps it and backs off. The
/// same batch may be delivered more than once, so implementations should be
/// idempotent.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, batch: Vec<QueueItem>) -> Result<(), ProcessError>;
}

#[async_trait]
impl<P> Processor for Arc<P>
where
    P: Processor + ?Sized,
{
    async fn process(&self, batch: Vec<QueueItem>) -> Result<(), ProcessError> {
        (**self).process(batch).await
    }
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap `f` as a `Processor`.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Vec<QueueItem>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Vec<QueueItem>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    async fn process(&self, batch: Vec<QueueItem>) -> Result<(), ProcessError> {
        (self.f)(batch).await
    }
}
