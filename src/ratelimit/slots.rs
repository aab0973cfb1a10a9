//! Caps on simultaneous in-flight requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::key::RateLimitKey;
use super::policy::{Consumption, Decision, Policy, PolicyConfig, SlotGuard};
use super::store::{CounterStore, StoreError};

/// Concurrency slot policy.
///
/// A successful acquire hands out a [`SlotGuard`]; the slot returns to the
/// pool when the guard is released or dropped. The store checks the cap and
/// increments in one step, so a denied caller never touches the count.
#[derive(Clone)]
pub struct ConcurrencySlotPolicy {
    store: Arc<dyn CounterStore>,
    release_timeout: Duration,
}

impl ConcurrencySlotPolicy {
    /// `release_timeout` bounds the decrement of every guard handed out.
    pub fn new(store: Arc<dyn CounterStore>, release_timeout: Duration) -> Self {
        Self {
            store,
            release_timeout,
        }
    }

    pub async fn acquire(
        &self,
        key: &RateLimitKey,
        max_slots: u64,
        slot_ttl: Duration,
    ) -> Result<(Decision, Option<SlotGuard>), StoreError> {
        let storage_key = key.to_string_key();
        let outcome = self
            .store
            .acquire_slot(&storage_key, max_slots, slot_ttl)
            .await?;

        if outcome.acquired {
            let guard = SlotGuard::new(self.store.clone(), storage_key, self.release_timeout);
            return Ok((Decision::Allow, Some(guard)));
        }

        debug!(key = %key, held = outcome.held, max_slots = max_slots, "Concurrency limit reached");
        Ok((
            Decision::Deny {
                retry_after_secs: None,
            },
            None,
        ))
    }

    /// Give back a slot without a guard. Releasing a key nobody holds is a
    /// no-op that leaves the count at zero.
    pub async fn release(&self, key: &RateLimitKey) -> Result<u64, StoreError> {
        self.store.decrement(&key.to_string_key()).await
    }
}

#[async_trait]
impl Policy for ConcurrencySlotPolicy {
    async fn consume(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError> {
        let (decision, slot) = self.acquire(key, config.max_slots, config.slot_ttl).await?;
        Ok(Consumption {
            decision,
            quota: None,
            slot,
        })
    }
}
