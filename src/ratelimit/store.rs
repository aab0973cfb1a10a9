//! Shared counter storage used by every policy.
//!
//! All quota state lives behind [`CounterStore`]. Policies never read a value
//! and write it back in a second call; every mutation is a single atomic store
//! operation, which is what keeps quotas correct when many server processes
//! share one store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use super::clock::{Clock, SystemClock};

/// Errors raised by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the command.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer within the configured bound.
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Redis protocol or connection failure.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result of [`CounterStore::acquire_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAcquisition {
    /// Whether a slot was taken. When `false` the counter was left untouched.
    pub acquired: bool,
    /// Holders on the key after the call.
    pub held: u64,
}

/// A live counter and the time left before it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterValue {
    pub count: u64,
    pub ttl: Duration,
}

/// Atomic counters with expiry, shared by all server processes.
///
/// A key that has expired is indistinguishable from one that never existed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` by one and return the post-increment value.
    ///
    /// The expiry is set only when the key did not exist; later increments
    /// within the same window leave the remaining TTL untouched.
    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<CounterValue, StoreError>;

    /// Take one of `max` slots on `key` in a single atomic step.
    ///
    /// Below the cap the count goes up by one and the expiry is pushed out
    /// to `ttl` from now, so a key with steady traffic never expires under
    /// its current holders. At the cap nothing changes.
    async fn acquire_slot(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<SlotAcquisition, StoreError>;

    /// Decrement `key`, floored at zero. A key reaching zero is removed.
    async fn decrement(&self, key: &str) -> Result<u64, StoreError>;

    /// Read a counter without touching it.
    async fn get(&self, key: &str) -> Result<Option<CounterValue>, StoreError>;

    /// Remove a counter. Returns `true` if a live counter was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: u64,
}

impl Slot {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }

    fn snapshot(&self, now: u64) -> CounterValue {
        CounterValue {
            count: self.count,
            ttl: Duration::from_millis(self.expires_at.saturating_sub(now)),
        }
    }
}

/// In-process counter store.
///
/// Correct for a single server process and for tests. Each operation holds
/// the shard lock for its key, so increments on one key are linearizable.
pub struct MemoryCounterStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired counter. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before - self.entries.len()
    }

    /// Number of stored counters, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<CounterValue, StoreError> {
        let now = self.clock.now_millis();
        let mut slot = self.entries.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: 0,
        });

        if !slot.is_live(now) {
            slot.count = 0;
            slot.expires_at = now + ttl.as_millis() as u64;
        }
        slot.count += 1;

        trace!(key = %key, count = slot.count, "Incremented counter");
        Ok(slot.snapshot(now))
    }

    async fn acquire_slot(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<SlotAcquisition, StoreError> {
        let now = self.clock.now_millis();
        let mut slot = self.entries.entry(key.to_string()).or_insert(Slot {
            count: 0,
            expires_at: 0,
        });

        if !slot.is_live(now) {
            slot.count = 0;
        }
        if slot.count >= max {
            return Ok(SlotAcquisition {
                acquired: false,
                held: slot.count,
            });
        }
        slot.count += 1;
        slot.expires_at = now + ttl.as_millis() as u64;

        trace!(key = %key, held = slot.count, "Acquired slot");
        Ok(SlotAcquisition {
            acquired: true,
            held: slot.count,
        })
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if !slot.is_live(now) || slot.count <= 1 {
                    occupied.remove();
                    Ok(0)
                } else {
                    slot.count -= 1;
                    Ok(slot.count)
                }
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CounterValue>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.snapshot(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, slot)| slot.is_live(now))
            .unwrap_or(false))
    }
}
