//! Fixed window counting.
//!
//! The window opens with the first hit on a key and closes when the store
//! expires the counter. Windows are fixed, not sliding: a burst straddling
//! a boundary can admit up to twice `max_requests` in one window's length.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::key::RateLimitKey;
use super::policy::{retry_after, Consumption, Policy, PolicyConfig, Quota};
use super::store::{CounterStore, CounterValue, StoreError};

/// Fixed window policy backing the general, auth, upload, API key and tiered
/// limiters. One instance serves every window size; the size comes from the
/// [`PolicyConfig`] passed to each call.
pub struct FixedWindowPolicy {
    store: Arc<dyn CounterStore>,
}

impl FixedWindowPolicy {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check a key without counting the request.
    ///
    /// Used before the outcome is known for rules that only count failures:
    /// the caller is denied once earlier failures used up the window.
    pub async fn peek(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError> {
        let current = self.store.get(&key.to_string_key()).await?;
        let Some(value) = current else {
            return Ok(Consumption::allow(Some(Quota {
                limit: config.max_requests,
                remaining: config.max_requests,
                reset_after: config.window,
            })));
        };

        let quota = quota_for(config, value);
        if value.count >= config.max_requests {
            debug!(key = %key, count = value.count, limit = config.max_requests, "Window already exhausted");
            Ok(Consumption::deny(Some(retry_after(value.ttl)), Some(quota)))
        } else {
            Ok(Consumption::allow(Some(quota)))
        }
    }
}

fn quota_for(config: &PolicyConfig, value: CounterValue) -> Quota {
    Quota {
        limit: config.max_requests,
        remaining: config.max_requests.saturating_sub(value.count),
        reset_after: value.ttl,
    }
}

#[async_trait]
impl Policy for FixedWindowPolicy {
    async fn consume(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError> {
        let value = self
            .store
            .increment_with_expiry(&key.to_string_key(), config.window)
            .await?;

        trace!(key = %key, count = value.count, limit = config.max_requests, "Counted request");

        let quota = quota_for(config, value);
        if value.count <= config.max_requests {
            Ok(Consumption::allow(Some(quota)))
        } else {
            debug!(key = %key, count = value.count, limit = config.max_requests, "Fixed window exceeded");
            Ok(Consumption::deny(Some(retry_after(value.ttl)), Some(quota)))
        }
    }
}
