//! Async driver for the [`Engine`].
//!
//! One tokio task owns the engine and is the only thing that mutates it.
//! It sleeps until the engine's next wake-up, a command from a
//! [`CoordinatorHandle`], or a processor result, whichever comes first.
//! Processor futures run on their own tasks and report back over a channel
//! tagged with their cycle number.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use baton_core::{Clock, InstanceId, ItemId, SystemClock};
use baton_store::{PersistentStore, SharedStore, select_store};

use crate::config::QueueConfig;
use crate::engine::{CheckOutcome, Dispatch, Engine, QueueSnapshot};
use crate::error::{ProcessError, QueueError, QueueResult};
use crate::processor::Processor;

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Enqueue {
        payload: Value,
        reply: Reply<QueueResult<ItemId>>,
    },
    EnqueueBatch {
        payloads: Vec<Value>,
        reply: Reply<QueueResult<Vec<ItemId>>>,
    },
    Flush {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<QueueSnapshot>,
    },
    Deactivate {
        reply: Reply<bool>,
    },
    Destroy {
        reply: Reply<()>,
    },
}

enum Event {
    Command(Option<Command>),
    Finished(u64, Result<(), ProcessError>),
    Wake,
}

/// The task that drives one queue instance.
pub struct Coordinator {
    engine: Engine,
    processor: Arc<dyn Processor>,
    commands: mpsc::Receiver<Command>,
    results_tx: mpsc::UnboundedSender<(u64, Result<(), ProcessError>)>,
    results: mpsc::UnboundedReceiver<(u64, Result<(), ProcessError>)>,
}

impl Coordinator {
    /// Start a queue instance on the current tokio runtime.
    ///
    /// `store` is probed first; if it does not work the instance falls back
    /// to the process-wide [`baton_store::GlobalStore`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, P>(config: QueueConfig, store: S, processor: P) -> QueueResult<CoordinatorHandle>
    where
        S: PersistentStore + 'static,
        P: Processor + 'static,
    {
        Self::spawn_with(config, select_store(store), Arc::new(processor), Arc::new(SystemClock))
    }

    /// Start a queue instance with an explicit store, processor and clock.
    /// The store is used as given, without a probe.
    pub fn spawn_with(
        config: QueueConfig,
        store: SharedStore,
        processor: Arc<dyn Processor>,
        clock: Arc<dyn Clock>,
    ) -> QueueResult<CoordinatorHandle> {
        let engine = Engine::new(config, store, clock)?;
        let instance = engine.instance_id();
        let durable = engine.store_is_durable();

        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (results_tx, results) = mpsc::unbounded_channel();

        let coordinator = Self {
            engine,
            processor,
            commands,
            results_tx,
            results,
        };
        tokio::spawn(coordinator.run());

        Ok(CoordinatorHandle {
            commands: commands_tx,
            instance,
            durable,
        })
    }

    async fn run(mut self) {
        let instance = self.engine.instance_id();
        tracing::info!(label = %self.engine.config().label, %instance, "queue coordinator started");

        loop {
            let delay = self.engine.time_until_wake();

            let event = tokio::select! {
                command = self.commands.recv() => Event::Command(command),
                Some((cycle, result)) = self.results.recv() => Event::Finished(cycle, result),
                _ = tokio::time::sleep(delay.unwrap_or_default()), if delay.is_some() => Event::Wake,
            };

            match event {
                Event::Command(Some(command)) => {
                    if self.handle(command).is_break() {
                        break;
                    }
                }
                Event::Command(None) => {
                    tracing::debug!(%instance, "all handles dropped");
                    self.engine.destroy();
                    break;
                }
                Event::Finished(cycle, result) => self.engine.on_result(cycle, result),
                Event::Wake => {
                    if let Some(CheckOutcome::Dispatched(dispatch)) = self.engine.on_wake() {
                        self.dispatch(dispatch);
                    }
                }
            }
        }

        tracing::info!(%instance, "queue coordinator stopped");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Enqueue { payload, reply } => {
                let _ = reply.send(self.engine.enqueue(payload));
            }
            Command::EnqueueBatch { payloads, reply } => {
                let _ = reply.send(self.engine.enqueue_batch(payloads));
            }
            Command::Flush { reply } => {
                self.engine.flush();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.engine.snapshot());
            }
            Command::Deactivate { reply } => {
                let deactivated = self.engine.deactivate();
                let _ = reply.send(deactivated);
                if deactivated {
                    return ControlFlow::Break(());
                }
            }
            Command::Destroy { reply } => {
                self.engine.destroy();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Run the processor on its own task. A processor that panics never
    /// reports back; the process timeout covers that case.
    fn dispatch(&self, dispatch: Dispatch) {
        let processor = Arc::clone(&self.processor);
        let results = self.results_tx.clone();

        tokio::spawn(async move {
            let Dispatch { cycle, batch } = dispatch;
            let result = processor.process(batch).await;
            // The coordinator may already be gone.
            let _ = results.send((cycle, result));
        });
    }
}

/// Cloneable handle to a running [`Coordinator`].
///
/// Once the instance is destroyed or deactivated every call except
/// [`CoordinatorHandle::destroy`] fails with [`QueueError::Destroyed`].
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    instance: InstanceId,
    durable: bool,
}

impl CoordinatorHandle {
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Whether the selected store survives a restart.
    pub fn store_is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Persist one item and schedule a debounced check.
    pub async fn enqueue<T>(&self, payload: &T) -> QueueResult<ItemId>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.request(|reply| Command::Enqueue { payload, reply })
            .await?
    }

    /// Persist several items with a single store write.
    pub async fn enqueue_batch<T>(&self, payloads: &[T]) -> QueueResult<Vec<ItemId>>
    where
        T: Serialize,
    {
        let payloads = payloads
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.request(|reply| Command::EnqueueBatch { payloads, reply })
            .await?
    }

    /// Check immediately instead of waiting for the debounce.
    pub async fn flush(&self) -> QueueResult<()> {
        self.request(|reply| Command::Flush { reply }).await
    }

    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Unload hook. Releases the active claim and stops the instance if it
    /// is the current owner; returns `false` otherwise (including when the
    /// instance is already gone).
    pub async fn deactivate(&self) -> bool {
        self.request(|reply| Command::Deactivate { reply })
            .await
            .unwrap_or(false)
    }

    /// Stop the instance. Idempotent.
    pub async fn destroy(&self) {
        let _ = self.request(|reply| Command::Destroy { reply }).await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> QueueResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| QueueError::Destroyed)?;
        response.await.map_err(|_| QueueError::Destroyed)
    }
}
