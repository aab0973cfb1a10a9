//! Tollgate - Admission Control Service
//!
//! This crate decides whether an inbound HTTP request may proceed before any
//! business logic runs. Quotas are enforced per client with fixed windows,
//! token buckets with a punitive block, role-based tiers and concurrency
//! slots, over counters that can be shared between processes through Redis.
//! The gate is exposed to host services over gRPC.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
