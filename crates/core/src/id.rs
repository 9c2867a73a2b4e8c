//! Strongly-typed identifiers.

use core::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::UnixMillis;
use crate::error::CoreError;

/// Identifier of one running queue instance (the owner id in the
/// active-owner record).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for InstanceId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for InstanceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| CoreError::invalid_id(format!("InstanceId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Numeric identifier of a queued item.
///
/// Generated ids are time-ordered: the high bits carry the enqueue
/// millisecond and the low 12 bits a per-process sequence, so ids minted by
/// one process never repeat and never go backwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

static LAST_ITEM_ID: AtomicU64 = AtomicU64::new(0);

impl ItemId {
    const SEQUENCE_BITS: u32 = 12;

    /// Mint the next id for an item enqueued at `now`.
    pub fn next(now: UnixMillis) -> Self {
        let floor = (now.max(0) as u64) << Self::SEQUENCE_BITS;
        let mut last = LAST_ITEM_ID.load(Ordering::Relaxed);
        loop {
            let candidate = floor.max(last + 1);
            match LAST_ITEM_ID.compare_exchange_weak(
                last,
                candidate,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ItemId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("ItemId: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_round_trips_through_display() {
        let id = InstanceId::new();
        let parsed: InstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn instance_id_rejects_garbage() {
        let err = "not-a-uuid".parse::<InstanceId>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidId(_)));
    }

    #[test]
    fn item_ids_are_strictly_increasing_within_one_millisecond() {
        let a = ItemId::next(1_000);
        let b = ItemId::next(1_000);
        let c = ItemId::next(1_000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn item_ids_never_go_backwards_when_the_clock_does() {
        let later = ItemId::next(5_000_000);
        let earlier = ItemId::next(4_000_000);
        assert!(earlier > later);
    }
}
