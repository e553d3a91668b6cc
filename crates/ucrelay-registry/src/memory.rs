//! In-process registry backed by sharded concurrent maps.
//!
//! Each operation runs under the shard lock of the single key it touches, which
//! is what makes `put_if_absent` and `compare_and_swap` atomic.

use crate::types::{Assignment, Lookup, ProxyAdvert, ProxyHealth, ProxyRecord, PutOutcome};
use crate::ConnectionRegistry;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info};
use ucrelay_core::{ProxyId, RelayResult, ServerId};

/// Default time an expired or removed assignment is remembered as offline.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum Slot {
    Live {
        proxy: ProxyId,
        registered_at: u64,
        expires_at: Instant,
    },
    Tombstone {
        last_proxy: ProxyId,
        purge_at: Instant,
    },
}

impl Slot {
    fn live(proxy: &ProxyId, now: Instant, ttl: Duration) -> Self {
        Slot::Live {
            proxy: proxy.clone(),
            registered_at: unix_now(),
            expires_at: now + ttl,
        }
    }

    /// Turn an expired live entry into a tombstone. Returns `false` when the
    /// slot is a tombstone past retention and should be dropped.
    fn settle(&mut self, now: Instant, retention: Duration) -> bool {
        if let Slot::Live {
            proxy, expires_at, ..
        } = self
        {
            if *expires_at <= now {
                let last_proxy = proxy.clone();
                let purge_at = *expires_at + retention;
                *self = Slot::Tombstone {
                    last_proxy,
                    purge_at,
                };
            }
        }
        match self {
            Slot::Live { .. } => true,
            Slot::Tombstone { purge_at, .. } => *purge_at > now,
        }
    }

    fn owner(&self) -> &ProxyId {
        match self {
            Slot::Live { proxy, .. } => proxy,
            Slot::Tombstone { last_proxy, .. } => last_proxy,
        }
    }

    fn lookup(&self, server: &ServerId, now: Instant) -> Lookup {
        match self {
            Slot::Live {
                proxy,
                registered_at,
                expires_at,
            } => Lookup::Live(Assignment {
                server_id: server.clone(),
                proxy_id: proxy.clone(),
                registered_at: *registered_at,
                expires_in: expires_at.saturating_duration_since(now),
            }),
            Slot::Tombstone { last_proxy, .. } => Lookup::Offline {
                last_proxy: last_proxy.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    address: String,
    health: ProxyHealth,
    last_heartbeat: Instant,
    expires_at: Instant,
}

/// Entry counts, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live: usize,
    pub offline: usize,
    pub proxies: usize,
}

/// In-memory [`ConnectionRegistry`].
pub struct MemoryRegistry {
    /// Assignments and tombstones by server.
    assignments: DashMap<ServerId, Slot>,
    /// Proxy records by proxy id.
    proxies: DashMap<ProxyId, ProxyEntry>,
    /// Load counters, kept apart from records so increments never wait on a
    /// heartbeat upsert.
    loads: DashMap<ProxyId, u64>,
    /// How long tombstones (and expired proxy records) are kept.
    retention: Duration,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOMBSTONE_RETENTION)
    }
}

impl MemoryRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            assignments: DashMap::new(),
            proxies: DashMap::new(),
            loads: DashMap::new(),
            retention,
        }
    }

    /// Drop tombstones and proxy records older than the retention period.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let retention = self.retention;
        let before = self.assignments.len() + self.proxies.len();
        self.assignments.retain(|_, slot| slot.settle(now, retention));
        self.proxies
            .retain(|_, entry| entry.expires_at + retention > now);
        let purged = before.saturating_sub(self.assignments.len() + self.proxies.len());
        if purged > 0 {
            debug!(purged, "purged stale registry entries");
        }
        purged
    }

    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let mut stats = RegistryStats {
            proxies: self.proxies.len(),
            ..Default::default()
        };
        for slot in self.assignments.iter() {
            match slot.value() {
                Slot::Live { expires_at, .. } if *expires_at > now => stats.live += 1,
                _ => stats.offline += 1,
            }
        }
        stats
    }

    fn record(&self, proxy_id: &ProxyId, entry: &ProxyEntry, now: Instant) -> ProxyRecord {
        let load = self.loads.get(proxy_id).map(|l| *l).unwrap_or(0);
        ProxyRecord {
            proxy_id: proxy_id.clone(),
            address: entry.address.clone(),
            health: entry.health,
            load,
            last_heartbeat_age: now.saturating_duration_since(entry.last_heartbeat),
            expires_in: entry.expires_at.saturating_duration_since(now),
        }
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryRegistry {
    async fn put_if_absent(
        &self,
        server: &ServerId,
        proxy: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<PutOutcome> {
        let now = Instant::now();
        let outcome = match self.assignments.entry(server.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::live(proxy, now, ttl));
                PutOutcome::Created
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.settle(now, self.retention);
                match slot {
                    Slot::Live {
                        proxy: owner,
                        expires_at,
                        ..
                    } => {
                        if owner == proxy {
                            *expires_at = now + ttl;
                            PutOutcome::AlreadyOwned
                        } else {
                            PutOutcome::OwnedElsewhere(owner.clone())
                        }
                    }
                    Slot::Tombstone { .. } => {
                        *slot = Slot::live(proxy, now, ttl);
                        PutOutcome::Created
                    }
                }
            }
        };
        debug!(server_id = %server, proxy_id = %proxy, ?outcome, "put_if_absent");
        Ok(outcome)
    }

    async fn compare_and_swap(
        &self,
        server: &ServerId,
        expected: &ProxyId,
        new: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let now = Instant::now();
        let swapped = match self.assignments.get_mut(server) {
            Some(mut slot) => {
                slot.settle(now, self.retention);
                if slot.owner() == expected {
                    *slot = Slot::live(new, now, ttl);
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if swapped {
            info!(server_id = %server, from = %expected, to = %new, "assignment moved");
        }
        Ok(swapped)
    }

    async fn get(&self, server: &ServerId) -> RelayResult<Lookup> {
        let now = Instant::now();
        match self.assignments.entry(server.clone()) {
            Entry::Vacant(_) => Ok(Lookup::Missing),
            Entry::Occupied(mut occupied) => {
                if occupied.get_mut().settle(now, self.retention) {
                    Ok(occupied.get().lookup(server, now))
                } else {
                    occupied.remove();
                    Ok(Lookup::Missing)
                }
            }
        }
    }

    async fn refresh(&self, server: &ServerId, proxy: &ProxyId, ttl: Duration) -> RelayResult<bool> {
        let now = Instant::now();
        let Some(mut slot) = self.assignments.get_mut(server) else {
            return Ok(false);
        };
        slot.settle(now, self.retention);
        match &mut *slot {
            Slot::Live {
                proxy: owner,
                expires_at,
                ..
            } if owner == proxy => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_if(&self, server: &ServerId, proxy: &ProxyId) -> RelayResult<bool> {
        let now = Instant::now();
        let Some(mut slot) = self.assignments.get_mut(server) else {
            return Ok(false);
        };
        slot.settle(now, self.retention);
        let owned_live = matches!(&*slot, Slot::Live { proxy: owner, .. } if owner == proxy);
        if owned_live {
            *slot = Slot::Tombstone {
                last_proxy: proxy.clone(),
                purge_at: now + self.retention,
            };
            debug!(server_id = %server, proxy_id = %proxy, "assignment removed");
        }
        Ok(owned_live)
    }

    async fn increment_load(&self, proxy: &ProxyId) -> RelayResult<u64> {
        let mut load = self.loads.entry(proxy.clone()).or_insert(0);
        *load = load.saturating_add(1);
        Ok(*load)
    }

    async fn decrement_load(&self, proxy: &ProxyId) -> RelayResult<u64> {
        let mut load = self.loads.entry(proxy.clone()).or_insert(0);
        *load = load.saturating_sub(1);
        Ok(*load)
    }

    async fn set_load(&self, proxy: &ProxyId, load: u64) -> RelayResult<()> {
        self.loads.insert(proxy.clone(), load);
        Ok(())
    }

    async fn upsert_proxy(&self, advert: &ProxyAdvert, ttl: Duration) -> RelayResult<()> {
        let now = Instant::now();
        let entry = ProxyEntry {
            address: advert.address.clone(),
            health: advert.health,
            last_heartbeat: now,
            expires_at: now + ttl,
        };
        if self.proxies.insert(advert.proxy_id.clone(), entry).is_none() {
            info!(proxy_id = %advert.proxy_id, address = %advert.address, "proxy joined");
        }
        Ok(())
    }

    async fn get_proxy(&self, proxy: &ProxyId) -> RelayResult<Option<ProxyRecord>> {
        let now = Instant::now();
        Ok(self
            .proxies
            .get(proxy)
            .map(|entry| self.record(proxy, entry.value(), now)))
    }

    async fn mark_unhealthy(&self, proxy: &ProxyId) -> RelayResult<bool> {
        match self.proxies.get_mut(proxy) {
            Some(mut entry) => {
                entry.health = ProxyHealth::Unhealthy;
                info!(proxy_id = %proxy, "proxy marked unhealthy");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_healthy_proxies(&self) -> RelayResult<Vec<ProxyRecord>> {
        let now = Instant::now();
        let mut healthy: Vec<ProxyRecord> = self
            .proxies
            .iter()
            .map(|entry| self.record(entry.key(), entry.value(), now))
            .filter(ProxyRecord::is_healthy)
            .collect();
        healthy.sort_by(|a, b| a.proxy_id.cmp(&b.proxy_id));
        Ok(healthy)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(30);

    fn server(id: &str) -> ServerId {
        ServerId::new(id).unwrap()
    }

    fn proxy(id: &str) -> ProxyId {
        ProxyId::new(id).unwrap()
    }

    fn advert(id: &str, health: ProxyHealth) -> ProxyAdvert {
        ProxyAdvert {
            proxy_id: proxy(id),
            address: format!("tcp://{id}:7100"),
            health,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn put_if_absent_outcomes() {
        let reg = MemoryRegistry::default();
        let s = server("srv-a");
        assert_eq!(
            reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap(),
            PutOutcome::Created
        );
        assert_eq!(
            reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap(),
            PutOutcome::AlreadyOwned
        );
        assert_eq!(
            reg.put_if_absent(&s, &proxy("p2"), TTL).await.unwrap(),
            PutOutcome::OwnedElsewhere(proxy("p1"))
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let reg = Arc::new(MemoryRegistry::default());
        let mut handles = Vec::new();
        for i in 0..32 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move {
                reg.put_if_absent(&server("srv-a"), &proxy(&format!("p{i}")), TTL)
                    .await
                    .unwrap()
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap() == PutOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert!(reg.get(&server("srv-a")).await.unwrap().live().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_leaves_tombstone_then_missing() {
        let reg = MemoryRegistry::new(Duration::from_secs(60));
        let s = server("srv-a");
        reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let live = reg.get(&s).await.unwrap();
        assert_eq!(live.live().unwrap().expires_in, Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(
            reg.get(&s).await.unwrap(),
            Lookup::Offline {
                last_proxy: proxy("p1")
            }
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(reg.get(&s).await.unwrap(), Lookup::Missing);
        assert_eq!(reg.get(&server("never")).await.unwrap(), Lookup::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_entry_can_be_reclaimed() {
        let reg = MemoryRegistry::default();
        let s = server("srv-a");
        reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap();
        tokio::time::advance(TTL).await;
        assert_eq!(
            reg.put_if_absent(&s, &proxy("p2"), TTL).await.unwrap(),
            PutOutcome::Created
        );
        assert_eq!(reg.get(&s).await.unwrap().live().unwrap().proxy_id, proxy("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_swap_checks_owner() {
        let reg = MemoryRegistry::default();
        let s = server("srv-a");
        assert!(!reg
            .compare_and_swap(&s, &proxy("p1"), &proxy("p2"), TTL)
            .await
            .unwrap());

        reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap();
        assert!(!reg
            .compare_and_swap(&s, &proxy("p3"), &proxy("p2"), TTL)
            .await
            .unwrap());
        assert!(reg
            .compare_and_swap(&s, &proxy("p1"), &proxy("p2"), TTL)
            .await
            .unwrap());
        assert_eq!(reg.get(&s).await.unwrap().live().unwrap().proxy_id, proxy("p2"));

        // A second swap from the stale owner loses.
        assert!(!reg
            .compare_and_swap(&s, &proxy("p1"), &proxy("p3"), TTL)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_and_remove_only_by_owner() {
        let reg = MemoryRegistry::default();
        let s = server("srv-a");
        reg.put_if_absent(&s, &proxy("p1"), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!reg.refresh(&s, &proxy("p2"), TTL).await.unwrap());
        assert!(reg.refresh(&s, &proxy("p1"), TTL).await.unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(reg.get(&s).await.unwrap().live().is_some());

        assert!(!reg.remove_if(&s, &proxy("p2")).await.unwrap());
        assert!(reg.remove_if(&s, &proxy("p1")).await.unwrap());
        assert!(!reg.remove_if(&s, &proxy("p1")).await.unwrap());
        assert!(matches!(reg.get(&s).await.unwrap(), Lookup::Offline { .. }));
        assert!(!reg.refresh(&s, &proxy("p1"), TTL).await.unwrap());
    }

    #[tokio::test]
    async fn load_counters() {
        let reg = MemoryRegistry::default();
        let p = proxy("p1");
        assert_eq!(reg.decrement_load(&p).await.unwrap(), 0);
        assert_eq!(reg.increment_load(&p).await.unwrap(), 1);
        assert_eq!(reg.increment_load(&p).await.unwrap(), 2);
        assert_eq!(reg.decrement_load(&p).await.unwrap(), 1);
        reg.set_load(&p, 7).await.unwrap();
        assert_eq!(reg.increment_load(&p).await.unwrap(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_health_and_listing() {
        let reg = MemoryRegistry::default();
        let ttl = Duration::from_secs(15);
        reg.upsert_proxy(&advert("p2", ProxyHealth::Healthy), ttl).await.unwrap();
        reg.upsert_proxy(&advert("p1", ProxyHealth::Healthy), ttl).await.unwrap();
        reg.upsert_proxy(&advert("p3", ProxyHealth::Degraded), ttl).await.unwrap();
        reg.increment_load(&proxy("p2")).await.unwrap();

        let healthy = reg.list_healthy_proxies().await.unwrap();
        let ids: Vec<&str> = healthy.iter().map(|r| r.proxy_id.as_str()).collect();
        assert_eq!(ids, ["p1", "p2"]);
        assert_eq!(healthy[1].load, 1);

        assert!(reg.mark_unhealthy(&proxy("p1")).await.unwrap());
        assert!(!reg.mark_unhealthy(&proxy("nope")).await.unwrap());
        let ids: Vec<ProxyId> = reg
            .list_healthy_proxies()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.proxy_id)
            .collect();
        assert_eq!(ids, [proxy("p2")]);

        // p2 stops heartbeating.
        tokio::time::advance(ttl).await;
        assert!(reg.list_healthy_proxies().await.unwrap().is_empty());
        let record = reg.get_proxy(&proxy("p2")).await.unwrap().unwrap();
        assert!(!record.is_healthy());
        assert_eq!(record.last_heartbeat_age, ttl);

        // A fresh heartbeat restores it.
        reg.upsert_proxy(&advert("p2", ProxyHealth::Healthy), ttl).await.unwrap();
        assert_eq!(reg.list_healthy_proxies().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_stale_entries() {
        let reg = MemoryRegistry::new(Duration::from_secs(60));
        reg.put_if_absent(&server("a"), &proxy("p1"), TTL).await.unwrap();
        reg.put_if_absent(&server("b"), &proxy("p1"), Duration::from_secs(600))
            .await
            .unwrap();
        reg.upsert_proxy(&advert("p1", ProxyHealth::Healthy), TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(
            reg.stats(),
            RegistryStats {
                live: 1,
                offline: 1,
                proxies: 1
            }
        );
        assert_eq!(reg.purge(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(reg.purge(), 2);
        assert_eq!(reg.get(&server("a")).await.unwrap(), Lookup::Missing);
        assert!(reg.get(&server("b")).await.unwrap().live().is_some());
    }
}
