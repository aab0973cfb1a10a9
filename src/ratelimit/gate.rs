//! The admission gate: the single entry point the request path calls.
//!
//! Per request: bypass check, then for every matching rule derive the key,
//! pick the policy and consume it. The first denial wins and hands back any
//! concurrency slots taken earlier for the same request. Store faults never
//! escape `check`; they are turned into a decision by the configured
//! [`FailureMode`], identically for every policy.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::bucket::TokenBucketPolicy;
use super::bypass::Bypass;
use super::clock::Clock;
use super::key::{AdmissionRequest, KeyDeriver, RateLimitKey};
use super::policy::{Consumption, Decision, Policy, PolicyConfig, Quota, SlotGuard};
use super::rules::{PolicySelector, PolicyVariant, Selection};
use super::slots::ConcurrencySlotPolicy;
use super::store::{CounterStore, CounterValue, StoreError};
use super::window::FixedWindowPolicy;

/// What a store fault turns into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request and log. Quotas are briefly unenforced.
    #[default]
    Open,
    /// Deny the request. The store outage becomes a service outage.
    Closed,
}

/// Store fault handling shared by all policies.
#[derive(Debug, Clone, Copy)]
pub struct GateOptions {
    pub failure_mode: FailureMode,
    /// Upper bound on each store call.
    pub store_timeout: Duration,
    /// Retry-After sent when failing closed.
    pub closed_retry_after_secs: u64,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            failure_mode: FailureMode::Open,
            store_timeout: Duration::from_millis(250),
            closed_retry_after_secs: 1,
        }
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Everything needed to answer a denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rule: String,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl Rejection {
    pub const STATUS: u16 = 429;

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            success: false,
            message: self.message.clone(),
            retry_after: self.retry_after_secs,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.body()).unwrap_or_default()
    }
}

/// Quota figures for the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch second at which the quota resets.
    pub reset_at: u64,
}

/// Slots held on behalf of one admitted request.
///
/// Dropping the guard releases every slot; [`AdmissionGuard::release`] does
/// the same but waits for the store. Each release is bounded by the store
/// timeout.
#[derive(Debug, Default)]
pub struct AdmissionGuard {
    slots: Vec<SlotGuard>,
}

impl AdmissionGuard {
    /// Whether there is nothing to release.
    pub fn is_noop(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Release every slot now. Returns how many were released cleanly.
    pub async fn release(self) -> usize {
        let releases = self.slots.into_iter().map(SlotGuard::release);
        futures::future::join_all(releases)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }
}

/// The result of [`AdmissionGate::check`].
#[derive(Debug)]
pub struct Admission {
    decision: Decision,
    info: Option<RateLimitInfo>,
    rejection: Option<Rejection>,
    guard: AdmissionGuard,
}

impl Admission {
    fn allowed(info: Option<RateLimitInfo>, guard: AdmissionGuard) -> Self {
        Self {
            decision: Decision::Allow,
            info,
            rejection: None,
            guard,
        }
    }

    fn denied(info: Option<RateLimitInfo>, rejection: Rejection) -> Self {
        Self {
            decision: Decision::Deny {
                retry_after_secs: rejection.retry_after_secs,
            },
            info,
            rejection: Some(rejection),
            guard: AdmissionGuard::default(),
        }
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    pub fn info(&self) -> Option<RateLimitInfo> {
        self.info
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejection.as_ref()
    }

    pub fn guard(&self) -> &AdmissionGuard {
        &self.guard
    }

    /// Take the release handle. The caller must keep it alive for the whole
    /// request; dropping it releases the slots.
    pub fn into_guard(self) -> AdmissionGuard {
        self.guard
    }

    /// Response headers to add, allowed or not.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = match self.info {
            Some(info) => vec![
                ("X-RateLimit-Limit", info.limit.to_string()),
                ("X-RateLimit-Remaining", info.remaining.to_string()),
                ("X-RateLimit-Reset", info.reset_at.to_string()),
            ],
            None => vec![
                ("X-RateLimit-Limit", "unlimited".to_string()),
                ("X-RateLimit-Remaining", "unlimited".to_string()),
                ("X-RateLimit-Reset", "N/A".to_string()),
            ],
        };
        if let Some(secs) = self.decision.retry_after_secs() {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

struct Routing {
    bypass: Bypass,
    selector: PolicySelector,
}

/// Orchestrates bypass, key derivation, policy selection and consumption.
pub struct AdmissionGate {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    fixed_window: FixedWindowPolicy,
    token_bucket: TokenBucketPolicy,
    slots: ConcurrencySlotPolicy,
    routing: RwLock<Arc<Routing>>,
    options: GateOptions,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        bypass: Bypass,
        selector: PolicySelector,
        options: GateOptions,
    ) -> Self {
        Self {
            fixed_window: FixedWindowPolicy::new(store.clone()),
            token_bucket: TokenBucketPolicy::new(store.clone()),
            slots: ConcurrencySlotPolicy::new(store.clone(), options.store_timeout),
            store,
            clock,
            routing: RwLock::new(Arc::new(Routing { bypass, selector })),
            options,
        }
    }

    /// Swap bypass and rules atomically. In-flight checks finish on the old
    /// configuration.
    pub fn reload(&self, bypass: Bypass, selector: PolicySelector) {
        *self.routing.write() = Arc::new(Routing { bypass, selector });
    }

    pub fn options(&self) -> GateOptions {
        self.options
    }

    /// Decide whether `request` may proceed. Never fails: quota exhaustion is
    /// a `Deny`, store faults follow the failure mode.
    pub async fn check(&self, request: &AdmissionRequest) -> Admission {
        let routing = self.routing.read().clone();
        if routing.bypass.should_bypass(request) {
            trace!(path = %request.route_path, "Request bypasses rate limiting");
            return Admission::allowed(None, AdmissionGuard::default());
        }

        let mut guard = AdmissionGuard::default();
        let mut tightest: Option<Quota> = None;

        for selection in routing.selector.select(request) {
            let key = KeyDeriver::derive_with(request, &selection.namespace, selection.rule.key_by());
            let result = if selection.config.skip_successful {
                self.bounded(self.fixed_window.peek(&key, &selection.config))
                    .await
            } else if selection.variant == PolicyVariant::Concurrency {
                self.acquire_slot(&key, &selection.config).await
            } else {
                self.bounded(self.policy(selection.variant).consume(&key, &selection.config))
                    .await
            };
            let consumption = self.settle(&selection, &key, result);

            if let Decision::Deny { retry_after_secs } = consumption.decision {
                debug!(
                    key = %key,
                    rule = %selection.rule.name(),
                    tier = ?selection.tier,
                    retry_after = ?retry_after_secs,
                    "Request denied"
                );
                guard.release().await;
                return Admission::denied(
                    consumption.quota.map(|q| self.info(q)),
                    Rejection {
                        rule: selection.rule.name().to_string(),
                        message: selection.rule.message(retry_after_secs),
                        retry_after_secs,
                    },
                );
            }

            if let Some(slot) = consumption.slot {
                guard.slots.push(slot);
            }
            tightest = tighter(tightest, consumption.quota);
        }

        Admission::allowed(tightest.map(|q| self.info(q)), guard)
    }

    /// Count a failed attempt against every rule that only counts failures.
    ///
    /// Call after the outcome is known, e.g. on a rejected login. The
    /// returned admission tells whether this failure used up the quota.
    pub async fn record_failure(&self, request: &AdmissionRequest) -> Admission {
        let routing = self.routing.read().clone();
        if routing.bypass.should_bypass(request) {
            return Admission::allowed(None, AdmissionGuard::default());
        }

        let mut tightest: Option<Quota> = None;
        let mut denial: Option<(Rejection, Option<Quota>)> = None;

        for selection in routing.selector.select(request) {
            if !selection.config.skip_successful {
                continue;
            }
            let key = KeyDeriver::derive_with(request, &selection.namespace, selection.rule.key_by());
            let result = self
                .bounded(self.fixed_window.consume(&key, &selection.config))
                .await;
            let consumption = self.settle(&selection, &key, result);

            if let Decision::Deny { retry_after_secs } = consumption.decision {
                denial.get_or_insert_with(|| {
                    (
                        Rejection {
                            rule: selection.rule.name().to_string(),
                            message: selection.rule.message(retry_after_secs),
                            retry_after_secs,
                        },
                        consumption.quota,
                    )
                });
            } else {
                tightest = tighter(tightest, consumption.quota);
            }
        }

        match denial {
            Some((rejection, quota)) => Admission::denied(quota.map(|q| self.info(q)), rejection),
            None => Admission::allowed(tightest.map(|q| self.info(q)), AdmissionGuard::default()),
        }
    }

    /// Delete every counter held by `identity` (e.g. `user:42` or an address)
    /// across all identity-addressable namespaces. Returns `false` if any
    /// delete failed.
    pub async fn reset_key(&self, identity: &str) -> bool {
        let keys = self.admin_keys(identity);
        let deletes = keys.iter().map(|(_, key)| self.bounded(self.store.delete(key)));

        let mut ok = true;
        for ((_, key), result) in keys.iter().zip(futures::future::join_all(deletes).await) {
            if let Err(e) = result {
                error!(key = %key, error = %e, "Failed to reset rate limit counter");
                ok = false;
            }
        }
        debug!(identity = %identity, ok = ok, "Reset rate limit counters");
        ok
    }

    /// Current counters for `identity`, by namespace. Read-only.
    pub async fn inspect_key(
        &self,
        identity: &str,
    ) -> Result<BTreeMap<String, CounterValue>, StoreError> {
        let mut counters = BTreeMap::new();
        for (label, key) in self.admin_keys(identity) {
            if let Some(value) = self.bounded(self.store.get(&key)).await? {
                counters.insert(label, value);
            }
        }
        Ok(counters)
    }

    /// `(label, storage key)` pairs for every counter an identity can own.
    fn admin_keys(&self, identity: &str) -> Vec<(String, String)> {
        let routing = self.routing.read().clone();
        let mut keys = Vec::new();
        for rule in routing.selector.shared_rules() {
            let key = RateLimitKey::new(rule.name(), identity);
            if rule.variant() == PolicyVariant::TokenBucket {
                keys.push((
                    format!("{}:block", rule.name()),
                    TokenBucketPolicy::block_key(&key),
                ));
            }
            keys.push((rule.name().to_string(), key.to_string_key()));
        }
        keys
    }

    fn policy(&self, variant: PolicyVariant) -> &dyn Policy {
        match variant {
            PolicyVariant::FixedWindow => &self.fixed_window,
            PolicyVariant::TokenBucket => &self.token_bucket,
            PolicyVariant::Concurrency => &self.slots,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.options.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.options.store_timeout)),
        }
    }

    /// Acquire a slot on a task of its own. If the bound elapses first the
    /// task still runs to completion, and a slot it gets late is released
    /// straight away rather than held until its TTL.
    async fn acquire_slot(
        &self,
        key: &RateLimitKey,
        config: &PolicyConfig,
    ) -> Result<Consumption, StoreError> {
        let slots = self.slots.clone();
        let (key, config) = (key.clone(), config.clone());
        let mut task = tokio::spawn(async move { slots.consume(&key, &config).await });

        match tokio::time::timeout(self.options.store_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Unavailable(format!("slot acquire failed: {}", e))),
            Err(_) => {
                tokio::spawn(async move {
                    if let Ok(Ok(Consumption { slot: Some(slot), .. })) = task.await {
                        debug!(key = %slot.key(), "Releasing slot acquired after timeout");
                        let _ = slot.release().await;
                    }
                });
                Err(StoreError::Timeout(self.options.store_timeout))
            }
        }
    }

    fn settle(
        &self,
        selection: &Selection<'_>,
        key: &RateLimitKey,
        result: Result<Consumption, StoreError>,
    ) -> Consumption {
        let e = match result {
            Ok(consumption) => return consumption,
            Err(e) => e,
        };
        match self.options.failure_mode {
            FailureMode::Open => {
                warn!(key = %key, rule = %selection.rule.name(), error = %e, "Counter store failed, admitting request");
                Consumption::allow(None)
            }
            FailureMode::Closed => {
                error!(key = %key, rule = %selection.rule.name(), error = %e, "Counter store failed, rejecting request");
                Consumption::deny(Some(self.options.closed_retry_after_secs), None)
            }
        }
    }

    fn info(&self, quota: Quota) -> RateLimitInfo {
        let reset_at_ms = self.clock.now_millis() + quota.reset_after.as_millis() as u64;
        RateLimitInfo {
            limit: quota.limit,
            remaining: quota.remaining,
            reset_at: reset_at_ms.div_ceil(1000),
        }
    }
}

/// The quota with the fewest remaining requests.
fn tighter(current: Option<Quota>, next: Option<Quota>) -> Option<Quota> {
    match (current, next) {
        (Some(a), Some(b)) if b.remaining < a.remaining => Some(b),
        (None, next) => next,
        (current, _) => current,
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::bypass::IpNetwork;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::key::{Identity, KeySource};
    use crate::ratelimit::rules::{default_rules, LimitConfig, RuleConfig, TierTableConfig};
    use crate::ratelimit::store::{MemoryCounterStore, SlotAcquisition};
    use async_trait::async_trait;

    fn rule(name: &str, paths: &[&str], limit: LimitConfig) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            limit,
            key_by: KeySource::Identity,
            per_route: false,
            requires_api_key: false,
            message: None,
        }
    }

    fn fixed(window_ms: u64, max_requests: u64) -> LimitConfig {
        LimitConfig::FixedWindow {
            window_ms,
            max_requests,
            skip_successful: false,
        }
    }

    fn gate_with(
        rules: Vec<RuleConfig>,
        store: Arc<dyn CounterStore>,
        clock: Arc<ManualClock>,
        options: GateOptions,
    ) -> AdmissionGate {
        let selector = PolicySelector::from_config(&rules, &TierTableConfig::default()).unwrap();
        let bypass = Bypass::new(["/health"], vec!["127.0.0.1".parse::<IpNetwork>().unwrap()]);
        AdmissionGate::new(store, clock, bypass, selector, options)
    }

    fn gate(rules: Vec<RuleConfig>) -> (Arc<ManualClock>, Arc<MemoryCounterStore>, AdmissionGate) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let gate = gate_with(rules, store.clone(), clock.clone(), GateOptions::default());
        (clock, store, gate)
    }

    fn request(path: &str) -> AdmissionRequest {
        AdmissionRequest::new("203.0.113.20".parse().unwrap(), path)
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn increment_with_expiry(&self, _: &str, _: Duration) -> Result<CounterValue, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn acquire_slot(&self, _: &str, _: u64, _: Duration) -> Result<SlotAcquisition, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn decrement(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Option<CounterValue>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn increment_with_expiry(&self, _: &str, _: Duration) -> Result<CounterValue, StoreError> {
            std::future::pending().await
        }
        async fn acquire_slot(&self, _: &str, _: u64, _: Duration) -> Result<SlotAcquisition, StoreError> {
            std::future::pending().await
        }
        async fn decrement(&self, _: &str) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<CounterValue>, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    /// Hands out slots from memory; every other call stalls.
    struct SlotsOnlyStore(MemoryCounterStore);

    #[async_trait]
    impl CounterStore for SlotsOnlyStore {
        async fn increment_with_expiry(&self, _: &str, _: Duration) -> Result<CounterValue, StoreError> {
            std::future::pending().await
        }
        async fn acquire_slot(&self, key: &str, max: u64, ttl: Duration) -> Result<SlotAcquisition, StoreError> {
            self.0.acquire_slot(key, max, ttl).await
        }
        async fn decrement(&self, _: &str) -> Result<u64, StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<CounterValue>, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    /// Applies a slot acquire, then answers only after `lag`.
    struct LaggingStore {
        inner: Arc<MemoryCounterStore>,
        lag: Duration,
    }

    #[async_trait]
    impl CounterStore for LaggingStore {
        async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<CounterValue, StoreError> {
            self.inner.increment_with_expiry(key, ttl).await
        }
        async fn acquire_slot(&self, key: &str, max: u64, ttl: Duration) -> Result<SlotAcquisition, StoreError> {
            let outcome = self.inner.acquire_slot(key, max, ttl).await;
            tokio::time::sleep(self.lag).await;
            outcome
        }
        async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
            self.inner.decrement(key).await
        }
        async fn get(&self, key: &str) -> Result<Option<CounterValue>, StoreError> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }
    }

    fn concurrent(max_slots: u64) -> RuleConfig {
        rule(
            "concurrent",
            &["/api/"],
            LimitConfig::Concurrency {
                max_slots,
                slot_ttl_ms: 60_000,
            },
        )
    }

    #[tokio::test]
    async fn test_allow_then_deny_with_headers() {
        let (_clock, _store, gate) = gate(vec![rule("api", &["/api/"], fixed(60_000, 2))]);

        let first = gate.check(&request("/api/units")).await;
        assert!(first.is_allowed());
        let headers = first.headers();
        assert!(headers.contains(&("X-RateLimit-Limit", "2".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "1".to_string())));
        assert!(headers.contains(&("X-RateLimit-Reset", "1700000060".to_string())));

        gate.check(&request("/api/units")).await;
        let denied = gate.check(&request("/api/units")).await;
        assert!(!denied.is_allowed());

        let rejection = denied.rejection().unwrap();
        assert_eq!(rejection.rule, "api");
        assert_eq!(rejection.retry_after_secs, Some(60));
        assert!(denied.headers().contains(&("Retry-After", "60".to_string())));

        let body: serde_json::Value = serde_json::from_slice(&rejection.to_json()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["message"], "Too many requests, please try again later.");
    }

    #[tokio::test]
    async fn test_unlimited_sentinels_without_rules() {
        let (_clock, _store, gate) = gate(vec![]);
        let admission = gate.check(&request("/anything")).await;
        assert!(admission.is_allowed());
        assert!(admission.guard().is_noop());
        assert_eq!(
            admission.headers(),
            vec![
                ("X-RateLimit-Limit", "unlimited".to_string()),
                ("X-RateLimit-Remaining", "unlimited".to_string()),
                ("X-RateLimit-Reset", "N/A".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_bypass_skips_all_policies() {
        let (_clock, store, gate) = gate(vec![rule("api", &["/"], fixed(60_000, 1))]);

        for _ in 0..5 {
            assert!(gate.check(&request("/health")).await.is_allowed());
            let local = AdmissionRequest::new("127.0.0.1".parse().unwrap(), "/api/units");
            assert!(gate.check(&local).await.is_allowed());
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_first_denial_releases_slots_taken_earlier() {
        let rules = vec![
            rule(
                "concurrent",
                &["/api/"],
                LimitConfig::Concurrency {
                    max_slots: 2,
                    slot_ttl_ms: 60_000,
                },
            ),
            rule("api", &["/api/"], fixed(60_000, 1)),
        ];
        let (_clock, store, gate) = gate(rules);

        let admitted = gate.check(&request("/api/units")).await;
        assert!(admitted.is_allowed());
        assert_eq!(admitted.guard().len(), 1);

        let denied = gate.check(&request("/api/units")).await;
        assert_eq!(denied.rejection().unwrap().rule, "api");

        let held = store.get("concurrent:203.0.113.20").await.unwrap().unwrap();
        assert_eq!(held.count, 1);

        assert_eq!(admitted.into_guard().release().await, 1);
        assert_eq!(store.get("concurrent:203.0.113.20").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrency_denial_has_no_retry_after() {
        let rules = vec![rule(
            "concurrent",
            &["/api/"],
            LimitConfig::Concurrency {
                max_slots: 1,
                slot_ttl_ms: 60_000,
            },
        )];
        let (_clock, _store, gate) = gate(rules);

        let held = gate.check(&request("/api/reports")).await;
        assert!(held.is_allowed());

        let denied = gate.check(&request("/api/reports")).await;
        assert_eq!(denied.decision(), Decision::Deny { retry_after_secs: None });
        assert!(!denied.headers().iter().any(|(name, _)| *name == "Retry-After"));
        assert!(denied.rejection().unwrap().body().retry_after.is_none());

        drop(held);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.check(&request("/api/reports")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_skip_successful_counts_only_failures() {
        let mut auth = rule(
            "auth",
            &["/api/auth/login"],
            LimitConfig::FixedWindow {
                window_ms: 3_600_000,
                max_requests: 2,
                skip_successful: true,
            },
        );
        auth.key_by = KeySource::ClientAddress;
        let (_clock, _store, gate) = gate(vec![auth]);
        let login = request("/api/auth/login");

        // Successful logins are never counted.
        for _ in 0..10 {
            assert!(gate.check(&login).await.is_allowed());
        }

        assert!(gate.record_failure(&login).await.is_allowed());
        assert!(gate.check(&login).await.is_allowed());

        assert!(gate.record_failure(&login).await.is_allowed());
        let blocked = gate.check(&login).await;
        assert!(!blocked.is_allowed());
        assert_eq!(blocked.rejection().unwrap().retry_after_secs, Some(3600));

        let third = gate.record_failure(&login).await;
        assert!(!third.is_allowed());
    }

    #[tokio::test]
    async fn test_tiered_limits_by_role() {
        let (_clock, _store, gate) = gate(vec![rule("dynamic", &["/api/"], LimitConfig::Tiered)]);

        let tenant = request("/api/leases").with_identity(Identity::new("t1", ["tenant"]));
        let admission = gate.check(&tenant).await;
        assert_eq!(admission.info().unwrap().limit, 100);

        let admin = request("/api/leases").with_identity(Identity::new("a1", ["tenant", "system_admin"]));
        assert_eq!(gate.check(&admin).await.info().unwrap().limit, 1000);

        let anonymous = request("/api/leases");
        assert_eq!(gate.check(&anonymous).await.info().unwrap().limit, 30);
    }

    #[tokio::test]
    async fn test_burst_rule_blocks_per_route() {
        let mut burst = rule(
            "burst",
            &["/api/search", "/api/export"],
            LimitConfig::TokenBucket {
                points: 2,
                duration_ms: 1000,
                block_duration_ms: 60_000,
            },
        );
        burst.per_route = true;
        burst.message = Some("Too many requests. Please try again in {retry_after} seconds.".to_string());
        let (clock, _store, gate) = gate(vec![burst]);
        let user = Identity::new("u1", ["tenant"]);
        let search = request("/api/search").with_identity(user.clone());

        assert!(gate.check(&search).await.is_allowed());
        assert!(gate.check(&search).await.is_allowed());
        let denied = gate.check(&search).await;
        assert_eq!(
            denied.rejection().unwrap().message,
            "Too many requests. Please try again in 60 seconds."
        );

        // Other routes keep their own bucket.
        let export = request("/api/export").with_identity(user);
        assert!(gate.check(&export).await.is_allowed());

        clock.advance(Duration::from_secs(30));
        assert!(!gate.check(&search).await.is_allowed());
    }

    #[tokio::test]
    async fn test_fail_open_admits_on_store_outage() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            vec![rule("api", &["/api/"], fixed(60_000, 1))],
            Arc::new(DownStore),
            clock,
            GateOptions::default(),
        );

        for _ in 0..3 {
            let admission = gate.check(&request("/api/units")).await;
            assert!(admission.is_allowed());
            assert_eq!(admission.info(), None);
        }
    }

    #[tokio::test]
    async fn test_fail_closed_denies_on_store_outage() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            vec![rule("api", &["/api/"], fixed(60_000, 100))],
            Arc::new(DownStore),
            clock,
            GateOptions {
                failure_mode: FailureMode::Closed,
                closed_retry_after_secs: 5,
                ..GateOptions::default()
            },
        );

        let admission = gate.check(&request("/api/units")).await;
        assert_eq!(
            admission.decision(),
            Decision::Deny {
                retry_after_secs: Some(5)
            }
        );
        // No store detail leaks into the response body.
        assert!(!admission.rejection().unwrap().message.contains("refused"));
    }

    #[tokio::test]
    async fn test_stalled_store_times_out() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            vec![rule("api", &["/api/"], fixed(60_000, 1))],
            Arc::new(StalledStore),
            clock,
            GateOptions {
                store_timeout: Duration::from_millis(20),
                ..GateOptions::default()
            },
        );

        let admission = tokio::time::timeout(Duration::from_secs(2), gate.check(&request("/api/units")))
            .await
            .expect("check must not hang");
        assert!(admission.is_allowed());
    }

    #[tokio::test]
    async fn test_denial_after_slot_does_not_hang_on_release() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            vec![concurrent(2), rule("api", &["/api/"], fixed(60_000, 10))],
            Arc::new(SlotsOnlyStore(MemoryCounterStore::with_clock(clock.clone()))),
            clock,
            GateOptions {
                failure_mode: FailureMode::Closed,
                store_timeout: Duration::from_millis(20),
                ..GateOptions::default()
            },
        );

        let admission = tokio::time::timeout(Duration::from_secs(2), gate.check(&request("/api/units")))
            .await
            .expect("check must not hang");
        assert_eq!(admission.rejection().unwrap().rule, "api");
    }

    #[tokio::test]
    async fn test_admitted_guard_release_is_bounded() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(
            vec![concurrent(2)],
            Arc::new(SlotsOnlyStore(MemoryCounterStore::with_clock(clock.clone()))),
            clock,
            GateOptions {
                store_timeout: Duration::from_millis(20),
                ..GateOptions::default()
            },
        );

        let guard = gate.check(&request("/api/units")).await.into_guard();
        assert_eq!(guard.len(), 1);
        let released = tokio::time::timeout(Duration::from_secs(2), guard.release())
            .await
            .expect("release must not hang");
        assert_eq!(released, 0);
    }

    #[tokio::test]
    async fn test_slot_acquired_after_timeout_is_given_back() {
        let clock = Arc::new(ManualClock::new(0));
        let inner = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let gate = gate_with(
            vec![concurrent(1)],
            Arc::new(LaggingStore {
                inner: inner.clone(),
                lag: Duration::from_millis(100),
            }),
            clock,
            GateOptions {
                store_timeout: Duration::from_millis(20),
                ..GateOptions::default()
            },
        );

        // Fails open with nothing to release, while the store did take a slot.
        let admission = gate.check(&request("/api/units")).await;
        assert!(admission.is_allowed());
        assert!(admission.guard().is_noop());
        assert_eq!(inner.get("concurrent:203.0.113.20").await.unwrap().unwrap().count, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(inner.get("concurrent:203.0.113.20").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_and_inspect_key() {
        let (_clock, _store, gate) = gate(default_rules());
        let user = Identity::new("42", ["tenant"]);
        let upload = request("/api/properties/upload").with_identity(user);

        gate.check(&upload).await;
        gate.check(&upload).await;

        let counters = gate.inspect_key("user:42").await.unwrap();
        assert_eq!(counters.get("upload").map(|c| c.count), Some(2));
        // The api rule is keyed by address.
        assert!(!counters.contains_key("api"));

        let by_address = gate.inspect_key("203.0.113.20").await.unwrap();
        assert_eq!(by_address.get("api").map(|c| c.count), Some(2));

        assert!(gate.reset_key("user:42").await);
        assert!(gate.inspect_key("user:42").await.unwrap().is_empty());
        assert_eq!(
            gate.inspect_key("203.0.113.20").await.unwrap().get("api").map(|c| c.count),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_reset_reports_store_failure() {
        let clock = Arc::new(ManualClock::new(0));
        let gate = gate_with(default_rules(), Arc::new(DownStore), clock, GateOptions::default());
        assert!(!gate.reset_key("user:1").await);
        assert!(gate.inspect_key("user:1").await.is_err());
    }

    #[tokio::test]
    async fn test_reload_swaps_rules() {
        let (_clock, _store, gate) = gate(vec![rule("api", &["/api/"], fixed(60_000, 1))]);
        gate.check(&request("/api/units")).await;
        assert!(!gate.check(&request("/api/units")).await.is_allowed());

        let selector = PolicySelector::from_config(
            &[rule("api", &["/api/"], fixed(60_000, 10))],
            &TierTableConfig::default(),
        )
        .unwrap();
        gate.reload(Bypass::default(), selector);
        assert!(gate.check(&request("/api/units")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_most_restrictive_quota_reported() {
        let rules = vec![
            rule("api", &["/api/"], fixed(60_000, 100)),
            rule("upload", &["/api/*/upload"], fixed(3_600_000, 3)),
        ];
        let (_clock, _store, gate) = gate(rules);
        let info = gate.check(&request("/api/units/upload")).await.info().unwrap();
        assert_eq!(info.limit, 3);
        assert_eq!(info.remaining, 2);
    }
}
