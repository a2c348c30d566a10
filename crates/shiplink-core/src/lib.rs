//! Shiplink Core - Domain types and configuration
//!
//! This crate holds everything the resilience layer needs that does not talk
//! to the network:
//! - **Domain types** - `ItemId`, `RetryRecord`, `StatusPolicy`, `TokenState`
//! - **Domain errors** - `DomainError`
//! - **Configuration** - the YAML-backed `Config` with validation and a builder
//!
//! The network-facing components (rate limiter, retry executor, refresh
//! coordinator, token manager) live in `shiplink-client` and are configured
//! from the types defined here.

pub mod config;
pub mod domain;
