//! The policy abstraction shared by all quota algorithms.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::key::RateLimitKey;
use super::store::{CounterStore, StoreError};

/// The outcome of consuming a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// `retry_after_secs` is `None` when waiting a fixed delay would not help,
    /// as with concurrency slots.
    Deny { retry_after_secs: Option<u64> },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allow => None,
            Decision::Deny { retry_after_secs } => *retry_after_secs,
        }
    }
}

/// Quota usage reported back to the caller for response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Parameters for one consumption. Each policy reads only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Fixed window length.
    pub window: Duration,
    /// Requests admitted per window.
    pub max_requests: u64,
    /// Token bucket capacity restored every `burst_duration`.
    pub burst_points: u64,
    pub burst_duration: Duration,
    /// Punitive block applied once the bucket is exhausted.
    pub block_duration: Duration,
    /// Count only failed attempts (consumption happens after the outcome).
    pub skip_successful: bool,
    /// Simultaneous in-flight requests per key.
    pub max_slots: u64,
    /// Expiry on slot counters, reclaiming slots of crashed processes.
    pub slot_ttl: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            burst_points: 10,
            burst_duration: Duration::from_secs(1),
            block_duration: Duration::from_secs(60),
            skip_successful: false,
            max_slots: 5,
            slot_ttl: Duration::from_secs(300),
        }
    }
}

impl PolicyConfig {
    pub fn fixed_window(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
            ..Self::default()
        }
    }

    pub fn token_bucket(points: u64, duration: Duration, block_duration: Duration) -> Self {
        Self {
            burst_points: points,
            burst_duration: duration,
            block_duration,
            ..Self::default()
        }
    }

    pub fn concurrency(max_slots: u64, slot_ttl: Duration) -> Self {
        Self {
            max_slots,
            slot_ttl,
            ..Self::default()
        }
    }

    pub fn skipping_successful(mut self) -> Self {
        self.skip_successful = true;
        self
    }
}

/// What a single policy consumption produced.
#[derive(Debug)]
pub struct Consumption {
    pub decision: Decision,
    pub quota: Option<Quota>,
    /// Held concurrency slot, released when dropped or explicitly.
    pub slot: Option<SlotGuard>,
}

impl Consumption {
    pub fn allow(quota: Option<Quota>) -> Self {
        Self {
            decision: Decision::Allow,
            quota,
            slot: None,
        }
    }

    pub fn deny(retry_after_secs: Option<u64>, quota: Option<Quota>) -> Self {
        Self {
            decision: Decision::Deny { retry_after_secs },
            quota,
            slot: None,
        }
    }
}

/// A quota algorithm. Policies hold no per-key state; everything lives in
/// the counter store.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn consume(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError>;
}

/// Whole seconds until `ttl` elapses, never less than one.
pub(crate) fn retry_after(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

/// A held concurrency slot.
///
/// Releasing is at most once: either through [`SlotGuard::release`] or, on
/// any other exit path (error, panic, cancelled future), from `Drop`, which
/// hands the decrement to the current Tokio runtime. Every decrement is
/// bounded by the store timeout.
pub struct SlotGuard {
    store: Arc<dyn CounterStore>,
    key: String,
    timeout: Duration,
    armed: bool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("key", &self.key)
            .field("armed", &self.armed)
            .finish()
    }
}

impl SlotGuard {
    pub(crate) fn new(store: Arc<dyn CounterStore>, key: String, timeout: Duration) -> Self {
        Self {
            store,
            key,
            timeout,
            armed: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the slot now and return the holders left on the key.
    ///
    /// The guard is disarmed before the store is called. A failed or timed
    /// out decrement is logged and not retried, since the store may have
    /// applied it; the slot counter's TTL reclaims it instead.
    pub async fn release(mut self) -> Result<u64, StoreError> {
        self.armed = false;
        match decrement(self.store.as_ref(), &self.key, self.timeout).await {
            Ok(held) => {
                trace!(key = %self.key, held = held, "Released concurrency slot");
                Ok(held)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to release concurrency slot; left to expire");
                Err(e)
            }
        }
    }
}

async fn decrement(
    store: &dyn CounterStore,
    key: &str,
    timeout: Duration,
) -> Result<u64, StoreError> {
    match tokio::time::timeout(timeout, store.decrement(key)).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = decrement(store.as_ref(), &key, timeout).await {
                        warn!(key = %key, error = %e, "Failed to release concurrency slot; left to expire");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "No runtime to release concurrency slot; left to expire");
            }
        }
    }
}
