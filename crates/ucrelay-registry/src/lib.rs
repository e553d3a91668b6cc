//! ucrelay-registry: shared routing state for the relay layer.
//!
//! Maps each server to the proxy that hosts it (with a TTL) and keeps a load
//! counter per proxy. Every mutation is a single atomic operation on one key,
//! so several balancer instances can share one registry without transactions.

pub mod config;
pub mod memory;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod types;

use async_trait::async_trait;
use std::time::Duration;
use ucrelay_core::{ProxyId, RelayResult, ServerId};

pub use memory::MemoryRegistry;
pub use remote::RemoteRegistry;
pub use service::RegistryService;
pub use types::{Assignment, Lookup, ProxyAdvert, ProxyHealth, ProxyRecord, PutOutcome};

/// Atomic store for assignments and proxy records.
///
/// Expiry is logical: entries past their TTL are converted to tombstones the
/// next time they are touched.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Claim `server` for `proxy` if it has no live assignment.
    async fn put_if_absent(
        &self,
        server: &ServerId,
        proxy: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<PutOutcome>;

    /// Reassign `server` to `new` only if it is currently owned by `expected`
    /// (live or expired). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        server: &ServerId,
        expected: &ProxyId,
        new: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<bool>;

    async fn get(&self, server: &ServerId) -> RelayResult<Lookup>;

    /// Extend the TTL of a live assignment owned by `proxy`.
    async fn refresh(&self, server: &ServerId, proxy: &ProxyId, ttl: Duration) -> RelayResult<bool>;

    /// Tombstone the assignment if `proxy` owns it.
    async fn remove_if(&self, server: &ServerId, proxy: &ProxyId) -> RelayResult<bool>;

    /// Returns the new load.
    async fn increment_load(&self, proxy: &ProxyId) -> RelayResult<u64>;

    /// Returns the new load. Saturates at zero.
    async fn decrement_load(&self, proxy: &ProxyId) -> RelayResult<u64>;

    async fn set_load(&self, proxy: &ProxyId, load: u64) -> RelayResult<()>;

    /// Create or refresh a proxy record, expiring after `ttl` without a
    /// further upsert.
    async fn upsert_proxy(&self, advert: &ProxyAdvert, ttl: Duration) -> RelayResult<()>;

    async fn get_proxy(&self, proxy: &ProxyId) -> RelayResult<Option<ProxyRecord>>;

    /// Force a proxy's health to `Unhealthy` until its next heartbeat.
    async fn mark_unhealthy(&self, proxy: &ProxyId) -> RelayResult<bool>;

    /// Healthy, unexpired proxies with their current load, ordered by id.
    async fn list_healthy_proxies(&self) -> RelayResult<Vec<ProxyRecord>>;
}
