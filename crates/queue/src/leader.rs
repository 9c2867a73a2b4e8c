//! Advisory leader election over the persisted active-owner record.
//!
//! The store has no locks and no compare-and-swap, so leadership is
//! inferred: the owner record is live while `now - ts < window`, and only a
//! live owner may process. Anyone may overwrite a record that is absent or
//! expired. Two instances checking within the same tick can both claim; the
//! loser simply processes a batch the winner may also process, which
//! at-least-once delivery tolerates.

use std::time::Duration;

use serde::Serialize;

use baton_core::{InstanceId, UnixMillis, duration_ms};

use crate::cache::{OwnerRecord, QueueCache};

/// What the owner record says about who may process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OwnerStatus {
    /// No record.
    Vacant,
    /// This instance holds a live claim.
    Ours { age_ms: i64 },
    /// Another instance holds a live claim.
    Theirs { owner: InstanceId, age_ms: i64 },
    /// A claim exists but its owner has gone quiet.
    Expired { owner: InstanceId, age_ms: i64 },
}

impl OwnerStatus {
    /// Whether this instance is allowed to claim and process.
    pub fn may_process(&self) -> bool {
        !matches!(self, OwnerStatus::Theirs { .. })
    }

    pub fn is_ours(&self) -> bool {
        matches!(self, OwnerStatus::Ours { .. })
    }
}

/// Claim/read/compare protocol for one instance.
#[derive(Debug, Clone, Copy)]
pub struct LeaderElection {
    instance: InstanceId,
    window_ms: i64,
}

impl LeaderElection {
    pub fn new(instance: InstanceId, liveness_window: Duration) -> Self {
        Self {
            instance,
            window_ms: duration_ms(liveness_window),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Classify a record at time `now`.
    ///
    /// A record stamped in the future (clock skew) counts as live.
    pub fn classify(&self, record: Option<OwnerRecord>, now: UnixMillis) -> OwnerStatus {
        let Some(record) = record else {
            return OwnerStatus::Vacant;
        };

        let age_ms = now.saturating_sub(record.ts);
        let live = age_ms < self.window_ms;

        match (record.id == self.instance, live) {
            (true, true) => OwnerStatus::Ours { age_ms },
            (false, true) => OwnerStatus::Theirs {
                owner: record.id,
                age_ms,
            },
            (_, false) => OwnerStatus::Expired {
                owner: record.id,
                age_ms,
            },
        }
    }

    /// Read the record fresh from the store and classify it.
    pub fn inspect(&self, cache: &QueueCache, now: UnixMillis) -> OwnerStatus {
        self.classify(cache.active_owner(), now)
    }

    /// Overwrite the record with this instance and `now`.
    pub fn claim(&self, cache: &QueueCache, now: UnixMillis) {
        cache.set_active_owner(self.instance, now);
    }

    /// Clear the record if this instance holds a live claim.
    ///
    /// Returns whether the record was cleared.
    pub fn release(&self, cache: &QueueCache, now: UnixMillis) -> bool {
        if self.inspect(cache, now).is_ours() {
            cache.clear_active_owner();
            true
        } else {
            false
        }
    }
}
