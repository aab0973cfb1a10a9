//! Admission control: counters, keys, policies and the gate that ties them
//! together.

mod bucket;
mod bypass;
mod clock;
mod gate;
mod key;
mod policy;
#[cfg(feature = "redis")]
mod redis_store;
mod rules;
mod slots;
mod store;
mod window;

pub use bucket::TokenBucketPolicy;
pub use bypass::{Bypass, IpNetwork};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::{
    Admission, AdmissionGate, AdmissionGuard, FailureMode, GateOptions, RateLimitInfo, Rejection,
    RejectionBody,
};
pub use key::{client_address_key, AdmissionRequest, Identity, KeyDeriver, KeySource, RateLimitKey};
pub use policy::{Consumption, Decision, Policy, PolicyConfig, Quota, SlotGuard};
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
pub use rules::{
    default_rules, LimitConfig, PathPattern, PolicySelector, PolicyVariant, Rule, RuleConfig,
    Selection, TierConfig, TierLimit, TierTable, TierTableConfig,
};
pub use slots::ConcurrencySlotPolicy;
pub use store::{CounterStore, CounterValue, MemoryCounterStore, SlotAcquisition, StoreError};
pub use window::FixedWindowPolicy;
