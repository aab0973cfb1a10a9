//! Release handles held on behalf of remote callers.
//!
//! A `Check` that acquires concurrency slots parks its [`AdmissionGuard`]
//! here under a fresh lease id. The caller gives it back with `Release`; if
//! it never does, the reaper drops the guard once the lease outlives its TTL,
//! which releases the slots.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ratelimit::AdmissionGuard;

struct Lease {
    guard: AdmissionGuard,
    issued_at: Instant,
}

/// Outstanding leases keyed by id.
pub struct LeaseTable {
    leases: DashMap<Uuid, Lease>,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            ttl,
        }
    }

    /// Park `guard` and return its lease id, or `None` when there is nothing
    /// to release later.
    pub fn issue(&self, guard: AdmissionGuard) -> Option<Uuid> {
        if guard.is_noop() {
            return None;
        }
        let id = Uuid::new_v4();
        self.leases.insert(
            id,
            Lease {
                guard,
                issued_at: Instant::now(),
            },
        );
        Some(id)
    }

    /// Release a lease. Unknown or already released ids return `false`.
    pub async fn release(&self, id: &Uuid) -> bool {
        match self.leases.remove(id) {
            Some((_, lease)) => {
                lease.guard.release().await;
                true
            }
            None => false,
        }
    }

    /// Drop every lease older than the TTL. Returns how many were reaped.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<Uuid> = self
            .leases
            .iter()
            .filter(|entry| entry.issued_at.elapsed() >= self.ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in expired {
            // Dropping the guard outside the map lock releases its slots.
            if let Some((_, lease)) = self.leases.remove(&id) {
                warn!(lease_id = %id, slots = lease.guard.len(), "Lease expired without release");
                drop(lease);
                reaped += 1;
            }
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Sweep expired leases every `interval` until the task is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let table = Arc::clone(self);
        info!(interval = ?interval, ttl = ?table.ttl, "Starting lease reaper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = table.reap_expired();
                if reaped > 0 {
                    debug!(reaped = reaped, outstanding = table.len(), "Reaped expired leases");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{
        AdmissionGate, AdmissionRequest, Bypass, GateOptions, LimitConfig, MemoryCounterStore,
        PolicySelector, RuleConfig, SystemClock, TierTableConfig,
    };
    use crate::ratelimit::{CounterStore, KeySource};

    async fn slot_guard(store: Arc<MemoryCounterStore>) -> AdmissionGuard {
        let rules = vec![RuleConfig {
            name: "concurrent".to_string(),
            paths: vec!["/".to_string()],
            limit: LimitConfig::Concurrency {
                max_slots: 10,
                slot_ttl_ms: 60_000,
            },
            key_by: KeySource::Identity,
            per_route: false,
            requires_api_key: false,
            message: None,
        }];
        let selector = PolicySelector::from_config(&rules, &TierTableConfig::default()).unwrap();
        let gate = AdmissionGate::new(
            store,
            Arc::new(SystemClock),
            Bypass::default(),
            selector,
            GateOptions::default(),
        );
        let request = AdmissionRequest::new("192.0.2.44".parse().unwrap(), "/reports");
        gate.check(&request).await.into_guard()
    }

    async fn held(store: &MemoryCounterStore) -> u64 {
        store
            .get("concurrent:192.0.2.44")
            .await
            .unwrap()
            .map(|v| v.count)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_noop_guard_gets_no_lease() {
        let table = LeaseTable::new(Duration::from_secs(60));
        assert!(table.issue(AdmissionGuard::default()).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_release_once() {
        let store = Arc::new(MemoryCounterStore::new());
        let table = LeaseTable::new(Duration::from_secs(60));

        let id = table.issue(slot_guard(store.clone()).await).unwrap();
        assert_eq!(held(&store).await, 1);

        assert!(table.release(&id).await);
        assert_eq!(held(&store).await, 0);
        assert!(!table.release(&id).await);
        assert!(!table.release(&Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_expired_leases_are_reaped() {
        let store = Arc::new(MemoryCounterStore::new());
        let table = LeaseTable::new(Duration::ZERO);

        table.issue(slot_guard(store.clone()).await).unwrap();
        table.issue(slot_guard(store.clone()).await).unwrap();
        assert_eq!(held(&store).await, 2);

        assert_eq!(table.reap_expired(), 2);
        assert!(table.is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(held(&store).await, 0);
    }

    #[tokio::test]
    async fn test_fresh_leases_survive_reaping() {
        let store = Arc::new(MemoryCounterStore::new());
        let table = LeaseTable::new(Duration::from_secs(60));
        table.issue(slot_guard(store.clone()).await).unwrap();
        assert_eq!(table.reap_expired(), 0);
        assert_eq!(table.len(), 1);
    }
}
