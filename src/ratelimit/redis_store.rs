//! Redis-backed counter store.
//!
//! Every operation is a single Lua script or MULTI pipeline, so concurrent
//! processes sharing a key always observe a consistent sequence of counts.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::store::{CounterStore, CounterValue, SlotAcquisition, StoreError};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

const ACQUIRE_SLOT_SCRIPT: &str = r#"
local held = tonumber(redis.call('GET', KEYS[1]) or '0')
if held >= tonumber(ARGV[1]) then
  return {0, held}
end
held = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {1, held}
"#;

const DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
  redis.call('DEL', KEYS[1])
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Counter store shared by every process pointed at the same Redis.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
    increment: Script,
    acquire_slot: Script,
    decrement: Script,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis. Keys are stored as `{prefix}{key}`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        info!(prefix = %prefix, "Connecting to Redis counter store");

        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        Ok(Self {
            manager,
            prefix,
            increment: Script::new(INCREMENT_SCRIPT),
            acquire_slot: Script::new(ACQUIRE_SLOT_SCRIPT),
            decrement: Script::new(DECREMENT_SCRIPT),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn ttl_from_pttl(pttl: i64) -> Duration {
    Duration::from_millis(pttl.max(0) as u64)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<CounterValue, StoreError> {
        let mut conn = self.manager.clone();
        let (count, pttl): (u64, i64) = self
            .increment
            .key(self.full_key(key))
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(CounterValue {
            count,
            ttl: ttl_from_pttl(pttl),
        })
    }

    async fn acquire_slot(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<SlotAcquisition, StoreError> {
        let mut conn = self.manager.clone();
        let (acquired, held): (u8, u64) = self
            .acquire_slot
            .key(self.full_key(key))
            .arg(max)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(SlotAcquisition {
            acquired: acquired == 1,
            held,
        })
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        let remaining: i64 = self
            .decrement
            .key(self.full_key(key))
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining.max(0) as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<CounterValue>, StoreError> {
        let mut conn = self.manager.clone();
        let (count, pttl): (Option<u64>, i64) = redis::pipe()
            .atomic()
            .get(self.full_key(key))
            .pttl(self.full_key(key))
            .query_async(&mut conn)
            .await?;

        // PTTL is -2 for a missing key; -1 would be a counter someone else wrote
        // without expiry, which is still reported.
        Ok(count.filter(|_| pttl != -2).map(|count| CounterValue {
            count,
            ttl: ttl_from_pttl(pttl),
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        debug!(key = %key, removed = removed, "Deleted counter");
        Ok(removed > 0)
    }
}
