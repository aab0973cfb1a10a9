//! Burst protection with a punitive block.
//!
//! The bucket holds `burst_points` points that are fully restored at the end
//! of each `burst_duration`, measured from the first consumption. Taking a
//! point from an empty bucket places the key in a blocked state for
//! `block_duration`; while blocked every attempt is denied, even if the
//! bucket would have refilled in the meantime.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::RateLimitKey;
use super::policy::{retry_after, Consumption, Policy, PolicyConfig, Quota};
use super::store::{CounterStore, StoreError};

const BLOCK_SUFFIX: &str = "block";

/// Token bucket policy for hot endpoints.
pub struct TokenBucketPolicy {
    store: Arc<dyn CounterStore>,
}

impl TokenBucketPolicy {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Storage key of the block marker for `key`.
    pub fn block_key(key: &RateLimitKey) -> String {
        key.suffixed(BLOCK_SUFFIX)
    }
}

#[async_trait]
impl Policy for TokenBucketPolicy {
    async fn consume(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError> {
        let block_key = Self::block_key(key);

        if let Some(block) = self.store.get(&block_key).await? {
            trace!(key = %key, remaining = ?block.ttl, "Key is blocked");
            return Ok(Consumption::deny(
                Some(retry_after(block.ttl)),
                Some(Quota {
                    limit: config.burst_points,
                    remaining: 0,
                    reset_after: block.ttl,
                }),
            ));
        }

        let taken = self
            .store
            .increment_with_expiry(&key.to_string_key(), config.burst_duration)
            .await?;

        if taken.count <= config.burst_points {
            return Ok(Consumption::allow(Some(Quota {
                limit: config.burst_points,
                remaining: config.burst_points - taken.count,
                reset_after: taken.ttl,
            })));
        }

        let block = self
            .store
            .increment_with_expiry(&block_key, config.block_duration)
            .await?;

        debug!(
            key = %key,
            points = config.burst_points,
            blocked_for = ?block.ttl,
            "Burst exhausted, key blocked"
        );

        let wait = block.ttl.max(taken.ttl);
        Ok(Consumption::deny(
            Some(retry_after(wait)),
            Some(Quota {
                limit: config.burst_points,
                remaining: 0,
                reset_after: wait,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::policy::Decision;
    use crate::ratelimit::store::MemoryCounterStore;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryCounterStore>, TokenBucketPolicy) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let policy = TokenBucketPolicy::new(store.clone());
        (clock, store, policy)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("burst:/api/search", "user:1")
    }

    fn config() -> PolicyConfig {
        PolicyConfig::token_bucket(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_burst_within_capacity() {
        let (_clock, _store, policy) = setup();
        for expected_remaining in [2, 1, 0] {
            let c = policy.consume(&key(), &config()).await.unwrap();
            assert!(c.decision.is_allowed());
            assert_eq!(c.quota.unwrap().remaining, expected_remaining);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_blocks_for_block_duration() {
        let (clock, store, policy) = setup();
        for _ in 0..3 {
            policy.consume(&key(), &config()).await.unwrap();
        }

        let denied = policy.consume(&key(), &config()).await.unwrap();
        assert_eq!(
            denied.decision,
            Decision::Deny {
                retry_after_secs: Some(60)
            }
        );
        assert!(store
            .get(&TokenBucketPolicy::block_key(&key()))
            .await
            .unwrap()
            .is_some());

        // The bucket refills after one second but the block still holds.
        clock.advance(Duration::from_secs(5));
        let still_blocked = policy.consume(&key(), &config()).await.unwrap();
        assert_eq!(
            still_blocked.decision,
            Decision::Deny {
                retry_after_secs: Some(55)
            }
        );
    }

    #[tokio::test]
    async fn test_block_persists_until_deadline() {
        let (clock, _store, policy) = setup();
        let start = 1_000_000;
        for _ in 0..4 {
            policy.consume(&key(), &config()).await.unwrap();
        }
        let blocked_until = start + 60_000;

        clock.set(blocked_until - 1);
        assert!(!policy.consume(&key(), &config()).await.unwrap().decision.is_allowed());

        clock.set(blocked_until + 1);
        assert!(policy.consume(&key(), &config()).await.unwrap().decision.is_allowed());
    }

    #[tokio::test]
    async fn test_refill_without_exhaustion() {
        let (clock, _store, policy) = setup();
        for _ in 0..3 {
            policy.consume(&key(), &config()).await.unwrap();
        }

        clock.advance(Duration::from_millis(1_001));
        let c = policy.consume(&key(), &config()).await.unwrap();
        assert!(c.decision.is_allowed());
        assert_eq!(c.quota.unwrap().remaining, 2);
    }
}
