//! Scheduling state machine of one queue instance.
//!
//! The engine is synchronous and owns no threads or timers. It keeps every
//! pending timer as an absolute deadline and exposes the earliest one via
//! [`Engine::next_wake`]; whoever drives it (the tokio [`Coordinator`] or a
//! test with a manual clock) calls [`Engine::on_wake`] once that instant has
//! passed and [`Engine::on_result`] when a processor finishes.
//!
//! Every public step is one "tick": the queue cache's deferred flush runs
//! at its end.
//!
//! [`Coordinator`]: crate::coordinator::Coordinator

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use baton_core::{Clock, InstanceId, ItemId, QueueItem, UnixMillis, duration_ms};
use baton_store::SharedStore;

use crate::backoff::BackoffPolicy;
use crate::cache::QueueCache;
use crate::config::QueueConfig;
use crate::error::{ProcessError, QueueResult};
use crate::leader::{LeaderElection, OwnerStatus};

/// Named states of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Nothing scheduled except the periodic fallback check.
    Idle,
    /// A debounced (or flushed) check is scheduled.
    DebouncePending,
    /// Waiting out the shared backoff deadline.
    BackingOff,
    /// A batch from this instance is in flight.
    Processing,
    /// Another instance holds a live claim; only the fallback check runs.
    Deferred,
    /// Inert: no timers, results ignored.
    Destroyed,
}

/// A batch to hand to the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Tags the eventual result so late results can be recognised.
    pub cycle: u64,
    pub batch: Vec<QueueItem>,
}

/// Result of one check cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// A batch of ours is still in flight; nothing done.
    InFlight,
    /// The shared backoff deadline has not passed.
    BackingOff { until: UnixMillis },
    /// Another instance owns the queue.
    Deferred { owner: InstanceId },
    /// We own the queue but it is empty.
    Empty,
    Dispatched(Dispatch),
}

/// Point-in-time view of one instance and its shared queue state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub instance: InstanceId,
    pub label: String,
    pub state: CoordinatorState,
    pub queue_len: usize,
    pub error_count: u32,
    pub backoff_deadline: UnixMillis,
    pub processing: bool,
    pub owner: OwnerStatus,
    pub durable: bool,
}

#[derive(Debug, Clone)]
struct InFlight {
    cycle: u64,
    /// Ids of the dispatched batch, in queue order.
    ids: Vec<ItemId>,
    deadline: UnixMillis,
}

/// The coordinator state machine.
pub struct Engine {
    config: QueueConfig,
    cache: QueueCache,
    leader: LeaderElection,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,

    debounce_at: Option<UnixMillis>,
    backoff_at: Option<UnixMillis>,
    fallback_at: Option<UnixMillis>,
    in_flight: Option<InFlight>,

    deferred: bool,
    cycles: u64,
    destroyed: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.leader.instance())
            .field("label", &self.config.label)
            .field("state", &self.state())
            .field("next_wake", &self.next_wake())
            .finish()
    }
}

impl Engine {
    /// Build an engine with a fresh instance id.
    pub fn new(config: QueueConfig, store: SharedStore, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        Self::with_instance(config, store, clock, InstanceId::new())
    }

    /// Build an engine with an explicit instance id.
    ///
    /// Fails if the configuration is invalid. On success a debounced check
    /// and the periodic fallback check are already scheduled.
    pub fn with_instance(
        config: QueueConfig,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        instance: InstanceId,
    ) -> QueueResult<Self> {
        config.validate()?;

        let cache = QueueCache::new(store, &config.label, config.trim.clone());
        let leader = LeaderElection::new(instance, config.active_queue_timeout);
        let backoff = BackoffPolicy::new(config.backoff_time).with_cap(config.max_backoff);

        let mut engine = Self {
            config,
            cache,
            leader,
            backoff,
            clock,
            debounce_at: None,
            backoff_at: None,
            fallback_at: None,
            in_flight: None,
            deferred: false,
            cycles: 0,
            destroyed: false,
        };

        let now = engine.clock.now_ms();
        engine.debounce(now);
        engine.arm_fallback(now);

        info!(
            label = %engine.config.label,
            instance = %instance,
            store = engine.cache.store().kind(),
            durable = engine.cache.store().durable(),
            "initialized queue instance"
        );

        Ok(engine)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.leader.instance()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn store_is_durable(&self) -> bool {
        self.cache.store().durable()
    }

    pub fn state(&self) -> CoordinatorState {
        if self.destroyed {
            CoordinatorState::Destroyed
        } else if self.in_flight.is_some() {
            CoordinatorState::Processing
        } else if self.debounce_at.is_some() {
            CoordinatorState::DebouncePending
        } else if self.backoff_at.is_some() {
            CoordinatorState::BackingOff
        } else if self.deferred {
            CoordinatorState::Deferred
        } else {
            CoordinatorState::Idle
        }
    }

    /// Earliest instant at which [`Engine::on_wake`] has work to do.
    pub fn next_wake(&self) -> Option<UnixMillis> {
        if self.destroyed {
            return None;
        }
        [
            self.debounce_at,
            self.backoff_at,
            self.fallback_at,
            self.in_flight.as_ref().map(|f| f.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Time left until [`Engine::next_wake`], zero if already due.
    pub fn time_until_wake(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        self.next_wake()
            .map(|at| Duration::from_millis(u64::try_from(at.saturating_sub(now)).unwrap_or(0)))
    }

    /// Append one item and schedule a debounced check.
    pub fn enqueue(&mut self, payload: Value) -> QueueResult<ItemId> {
        let now = self.clock.now_ms();
        let item = QueueItem::new(payload, now)?;
        let id = item.id;

        self.cache.enqueue(item);
        debug!(label = %self.config.label, item = %id, "item queued");

        self.debounce(now);
        self.cache.end_tick();
        Ok(id)
    }

    /// Append several items in one tick (one store write).
    ///
    /// Either every payload is accepted or none is.
    pub fn enqueue_batch(&mut self, payloads: Vec<Value>) -> QueueResult<Vec<ItemId>> {
        let now = self.clock.now_ms();
        let items = payloads
            .into_iter()
            .map(|payload| QueueItem::new(payload, now))
            .collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<ItemId> = items.iter().map(|item| item.id).collect();

        for item in items {
            self.cache.enqueue(item);
        }
        debug!(label = %self.config.label, count = ids.len(), "items queued");

        self.debounce(now);
        self.cache.end_tick();
        Ok(ids)
    }

    /// Force a check as soon as possible, replacing any pending debounce.
    pub fn flush(&mut self) {
        if self.destroyed {
            return;
        }
        self.debounce_at = Some(self.clock.now_ms());
    }

    /// Run whatever is due: the process timeout first, then at most one
    /// check cycle if the debounce, backoff or fallback timer fired.
    ///
    /// Returns the check outcome, or `None` when no check ran.
    pub fn on_wake(&mut self) -> Option<CheckOutcome> {
        if self.destroyed {
            return None;
        }
        let now = self.clock.now_ms();

        if let Some(flight) = self.in_flight.take_if(|f| f.deadline <= now) {
            warn!(label = %self.config.label, cycle = flight.cycle, "batch timed out");
            self.record_failure(&ProcessError::Timeout, now);
            self.debounce(now);
        }

        let mut due = false;
        if self.debounce_at.is_some_and(|at| at <= now) {
            self.debounce_at = None;
            due = true;
        }
        if self.backoff_at.is_some_and(|at| at <= now) {
            self.backoff_at = None;
            due = true;
        }
        if self.fallback_at.is_some_and(|at| at <= now) {
            self.arm_fallback(now);
            due = true;
        }

        let outcome = due.then(|| self.check(now));
        self.cache.end_tick();
        outcome
    }

    /// Apply a processor result for `cycle`.
    ///
    /// Results for anything but the batch currently in flight (a batch that
    /// already timed out, or any result after destroy) are discarded.
    pub fn on_result(&mut self, cycle: u64, result: Result<(), ProcessError>) {
        if self.destroyed {
            debug!(cycle, "ignoring processor result after destroy");
            return;
        }
        let Some(flight) = self.in_flight.take_if(|f| f.cycle == cycle) else {
            debug!(label = %self.config.label, cycle, "discarding late processor result");
            return;
        };
        let now = self.clock.now_ms();

        match result {
            Ok(()) => {
                self.cache.set_error_count(0);
                let removed = self.cache.remove_delivered(&flight.ids);
                let remaining = self.cache.len();
                self.cache.set_processing(false);
                self.cache.flush();
                if removed < flight.ids.len() {
                    debug!(
                        label = %self.config.label,
                        cycle,
                        missing = flight.ids.len() - removed,
                        "part of the batch was already gone from the queue"
                    );
                }
                info!(
                    label = %self.config.label,
                    cycle,
                    processed = flight.ids.len(),
                    removed,
                    remaining,
                    "queue batch processed"
                );
            }
            Err(err) => self.record_failure(&err, now),
        }

        self.debounce(now);
        self.cache.end_tick();
    }

    /// Cancel every timer. The instance stays inert from here on; persisted
    /// state is left as it is.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.debounce_at = None;
        self.backoff_at = None;
        self.fallback_at = None;
        self.in_flight = None;
        info!(label = %self.config.label, instance = %self.instance_id(), "queue instance destroyed");
    }

    /// Unload hook: if this instance holds the live claim, destroy it and
    /// clear the claim so another instance can take over immediately.
    pub fn deactivate(&mut self) -> bool {
        let now = self.clock.now_ms();
        if !self.leader.inspect(&self.cache, now).is_ours() {
            return false;
        }
        self.destroy();
        let released = self.leader.release(&self.cache, now);
        info!(label = %self.config.label, instance = %self.instance_id(), "deactivated on unload");
        released
    }

    pub fn snapshot(&mut self) -> QueueSnapshot {
        let now = self.clock.now_ms();
        let snapshot = QueueSnapshot {
            instance: self.instance_id(),
            label: self.config.label.clone(),
            state: self.state(),
            queue_len: self.cache.len(),
            error_count: self.cache.error_count(),
            backoff_deadline: self.cache.backoff_deadline(),
            processing: self.cache.processing(),
            owner: self.leader.inspect(&self.cache, now),
            durable: self.store_is_durable(),
        };
        self.cache.end_tick();
        snapshot
    }

    // ---- internals ----

    fn debounce(&mut self, now: UnixMillis) {
        if self.destroyed || self.debounce_at.is_some() {
            return;
        }
        self.debounce_at = Some(now.saturating_add(duration_ms(self.config.queue_group_time)));
    }

    fn arm_fallback(&mut self, now: UnixMillis) {
        self.fallback_at = Some(now.saturating_add(duration_ms(self.config.active_queue_timeout)));
    }

    fn check(&mut self, now: UnixMillis) -> CheckOutcome {
        debug!(label = %self.config.label, instance = %self.instance_id(), "checking queue");

        if self.in_flight.is_some() {
            return CheckOutcome::InFlight;
        }

        let deadline = self.cache.backoff_deadline();
        if deadline > now {
            self.backoff_at = Some(deadline);
            debug!(label = %self.config.label, remaining_ms = deadline - now, "backing off");
            return CheckOutcome::BackingOff { until: deadline };
        }

        let status = self.leader.inspect(&self.cache, now);
        if let OwnerStatus::Theirs { owner, .. } = status {
            self.deferred = true;
            debug!(label = %self.config.label, %owner, "another instance is active");
            return CheckOutcome::Deferred { owner };
        }
        self.deferred = false;

        if !status.is_ours() {
            info!(label = %self.config.label, instance = %self.instance_id(), previous = ?status, "switching active queue");
        }
        self.leader.claim(&self.cache, now);

        let batch = self.cache.head(self.config.batch_size);
        if batch.is_empty() {
            return CheckOutcome::Empty;
        }

        self.cycles += 1;
        let cycle = self.cycles;
        self.cache.set_processing(true);
        self.cache.flush();
        self.in_flight = Some(InFlight {
            cycle,
            ids: batch.iter().map(|item| item.id).collect(),
            deadline: now.saturating_add(duration_ms(self.config.process_timeout)),
        });

        info!(label = %self.config.label, cycle, batch = batch.len(), "processing queue batch");
        CheckOutcome::Dispatched(Dispatch { cycle, batch })
    }

    fn record_failure(&mut self, err: &ProcessError, now: UnixMillis) {
        let errors = self.cache.error_count().saturating_add(1);
        self.cache.set_error_count(errors);
        let deadline = self.backoff.deadline_after(errors, now);
        self.cache.set_backoff_deadline(deadline);
        self.cache.set_processing(false);

        warn!(
            label = %self.config.label,
            error = %err,
            errors,
            backoff_ms = deadline.saturating_sub(now),
            "process error, backing off"
        );
    }
}
