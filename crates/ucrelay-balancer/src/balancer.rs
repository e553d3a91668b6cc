//! Placement and resolution decisions.
//!
//! The balancer holds no routing state of its own: every decision is read from
//! and written to the registry, so any number of balancers can share one.

use crate::protocol::{HeartbeatAck, Placement, ProxyHeartbeat};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ucrelay_core::{Backoff, InfraError, RelayError, RelayResult, ResolutionError, ServerId};
use ucrelay_registry::{
    ConnectionRegistry, Lookup, ProxyAdvert, ProxyHealth, ProxyRecord, PutOutcome,
};

/// Tunables for [`LoadBalancer`].
#[derive(Debug, Clone)]
pub struct BalancerSettings {
    /// TTL of a server assignment; refreshed by proxy heartbeats.
    pub assignment_ttl: Duration,
    /// Expected proxy heartbeat period.
    pub heartbeat_interval: Duration,
    /// Heartbeats a proxy may miss before it stops being healthy.
    pub missed_heartbeat_limit: u32,
    /// Upper bound for one attempt at a registry-backed operation.
    pub registry_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            assignment_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeat_limit: 3,
            registry_timeout: Duration::from_secs(2),
            backoff: Backoff::default(),
        }
    }
}

impl BalancerSettings {
    /// Lifetime of a proxy record after its last heartbeat.
    pub fn proxy_ttl(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.missed_heartbeat_limit.max(1))
    }
}

/// Least-loaded healthy proxy; ties go to the lowest proxy id.
pub fn pick_least_loaded(candidates: &[ProxyRecord]) -> Option<&ProxyRecord> {
    candidates
        .iter()
        .filter(|r| r.is_healthy())
        .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.proxy_id.cmp(&b.proxy_id)))
}

pub struct LoadBalancer {
    registry: Arc<dyn ConnectionRegistry>,
    settings: BalancerSettings,
}

impl LoadBalancer {
    pub fn new(registry: Arc<dyn ConnectionRegistry>, settings: BalancerSettings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &BalancerSettings {
        &self.settings
    }

    /// Place `server` on a proxy and return its address.
    ///
    /// Retrying after a lost response is safe: a live assignment on a healthy
    /// proxy is returned unchanged and the load is not counted twice.
    pub async fn register_server(&self, server: &ServerId) -> RelayResult<Placement> {
        let placement = self
            .settings
            .backoff
            .retry("register_server", || self.bounded(self.try_register(server)))
            .await?;
        info!(server_id = %server, proxy_id = %placement.proxy_id, "server placed");
        Ok(placement)
    }

    /// Address of the proxy currently hosting `server`.
    pub async fn resolve_server(&self, server: &ServerId) -> RelayResult<Placement> {
        self.settings
            .backoff
            .retry("resolve_server", || self.bounded(self.try_resolve(server)))
            .await
    }

    /// Record a proxy heartbeat: refresh its record, reconcile its load and
    /// extend the assignments it still owns.
    pub async fn heartbeat(&self, heartbeat: &ProxyHeartbeat) -> RelayResult<HeartbeatAck> {
        self.settings
            .backoff
            .retry("heartbeat", || self.bounded(self.try_heartbeat(heartbeat)))
            .await
    }

    /// Every proxy record currently considered healthy.
    pub async fn healthy_proxies(&self) -> RelayResult<Vec<ProxyRecord>> {
        self.settings
            .backoff
            .retry("list_proxies", || self.bounded(self.registry.list_healthy_proxies()))
            .await
    }

    async fn bounded<T>(&self, op: impl Future<Output = RelayResult<T>>) -> RelayResult<T> {
        match tokio::time::timeout(self.settings.registry_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(InfraError::Timeout(format!(
                "registry did not answer within {:?}",
                self.settings.registry_timeout
            ))
            .into()),
        }
    }

    async fn try_register(&self, server: &ServerId) -> RelayResult<Placement> {
        let reg = &self.registry;
        let ttl = self.settings.assignment_ttl;

        let current = match reg.get(server).await? {
            Lookup::Live(assignment) => Some(assignment.proxy_id),
            Lookup::Offline { .. } | Lookup::Missing => None,
        };

        if let Some(owner) = &current {
            match reg.get_proxy(owner).await? {
                Some(record) if record.is_healthy() => {
                    if reg.refresh(server, owner, ttl).await? {
                        debug!(server_id = %server, proxy_id = %owner, "already placed, refreshed");
                        return Ok(placement(server, record));
                    }
                }
                Some(record) => self.mark_if_silent(&record).await,
                None => {}
            }
        }

        let candidates = reg.list_healthy_proxies().await?;
        let chosen = pick_least_loaded(&candidates)
            .cloned()
            .ok_or(ResolutionError::NoHealthyProxy)?;

        match current {
            Some(stale_owner) if stale_owner != chosen.proxy_id => {
                if !reg
                    .compare_and_swap(server, &stale_owner, &chosen.proxy_id, ttl)
                    .await?
                {
                    return Err(self.lost_race(server).await);
                }
                info!(
                    server_id = %server,
                    from = %stale_owner,
                    to = %chosen.proxy_id,
                    "moved server off unhealthy proxy"
                );
                reg.increment_load(&chosen.proxy_id).await?;
                Ok(placement(server, chosen))
            }
            _ => match reg.put_if_absent(server, &chosen.proxy_id, ttl).await? {
                PutOutcome::Created => {
                    reg.increment_load(&chosen.proxy_id).await?;
                    Ok(placement(server, chosen))
                }
                PutOutcome::AlreadyOwned => Ok(placement(server, chosen)),
                PutOutcome::OwnedElsewhere(owner) => {
                    Err(ResolutionError::AlreadyRegisteredElsewhere {
                        server: server.to_string(),
                        proxy: owner.to_string(),
                    }
                    .into())
                }
            },
        }
    }

    async fn lost_race(&self, server: &ServerId) -> RelayError {
        let owner = match self.registry.get(server).await {
            Ok(Lookup::Live(assignment)) => assignment.proxy_id.to_string(),
            _ => String::from("unknown"),
        };
        warn!(server_id = %server, owner = %owner, "lost placement race");
        ResolutionError::AlreadyRegisteredElsewhere {
            server: server.to_string(),
            proxy: owner,
        }
        .into()
    }

    async fn try_resolve(&self, server: &ServerId) -> RelayResult<Placement> {
        let assignment = match self.registry.get(server).await? {
            Lookup::Live(assignment) => assignment,
            Lookup::Offline { .. } => {
                return Err(ResolutionError::ServerOffline(server.to_string()).into())
            }
            Lookup::Missing => {
                return Err(ResolutionError::UnknownServer(server.to_string()).into())
            }
        };

        match self.registry.get_proxy(&assignment.proxy_id).await? {
            Some(record) if record.is_healthy() => Ok(placement(server, record)),
            stale => {
                if let Some(record) = &stale {
                    self.mark_if_silent(record).await;
                }
                debug!(
                    server_id = %server,
                    proxy_id = %assignment.proxy_id,
                    "assigned proxy is not healthy"
                );
                Err(ResolutionError::ServerOffline(server.to_string()).into())
            }
        }
    }

    /// Flip a record that still claims `Healthy` past its heartbeat TTL to
    /// `Unhealthy`. The next heartbeat from the proxy restores it.
    async fn mark_if_silent(&self, record: &ProxyRecord) {
        if record.health != ProxyHealth::Healthy || !record.expires_in.is_zero() {
            return;
        }
        match self.registry.mark_unhealthy(&record.proxy_id).await {
            Ok(true) => warn!(
                proxy_id = %record.proxy_id,
                silent_for = ?record.last_heartbeat_age,
                "proxy missed its heartbeats; marked unhealthy"
            ),
            Ok(false) => {}
            Err(e) => debug!(proxy_id = %record.proxy_id, error = %e, "failed to mark proxy unhealthy"),
        }
    }

    async fn try_heartbeat(&self, heartbeat: &ProxyHeartbeat) -> RelayResult<HeartbeatAck> {
        let reg = &self.registry;
        let advert = ProxyAdvert {
            proxy_id: heartbeat.proxy_id.clone(),
            address: heartbeat.address.clone(),
            health: heartbeat.health,
        };
        reg.upsert_proxy(&advert, self.settings.proxy_ttl()).await?;
        reg.set_load(&heartbeat.proxy_id, heartbeat.load).await?;

        let mut ack = HeartbeatAck::default();
        for server in &heartbeat.servers {
            if !reg
                .refresh(server, &heartbeat.proxy_id, self.settings.assignment_ttl)
                .await?
            {
                ack.not_owned.push(server.clone());
            }
        }
        if !ack.not_owned.is_empty() {
            warn!(
                proxy_id = %heartbeat.proxy_id,
                count = ack.not_owned.len(),
                "proxy reports servers it no longer owns"
            );
        }
        debug!(
            proxy_id = %heartbeat.proxy_id,
            load = heartbeat.load,
            servers = heartbeat.servers.len(),
            "heartbeat"
        );
        Ok(ack)
    }
}

fn placement(server: &ServerId, record: ProxyRecord) -> Placement {
    Placement {
        server_id: server.clone(),
        proxy_id: record.proxy_id,
        address: record.address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ucrelay_core::ProxyId;
    use ucrelay_registry::MemoryRegistry;

    fn sid(id: &str) -> ServerId {
        ServerId::new(id).unwrap()
    }

    fn pid(id: &str) -> ProxyId {
        ProxyId::new(id).unwrap()
    }

    fn heartbeat(id: &str, load: u64, servers: &[&str]) -> ProxyHeartbeat {
        ProxyHeartbeat {
            proxy_id: pid(id),
            address: format!("tcp://{id}.local:7100"),
            load,
            health: ProxyHealth::Healthy,
            servers: servers.iter().map(|s| sid(s)).collect(),
        }
    }

    fn setup() -> (Arc<MemoryRegistry>, LoadBalancer) {
        let registry = Arc::new(MemoryRegistry::default());
        let lb = LoadBalancer::new(registry.clone(), BalancerSettings::default());
        (registry, lb)
    }

    async fn load_of(registry: &MemoryRegistry, id: &str) -> u64 {
        registry.get_proxy(&pid(id)).await.unwrap().map(|r| r.load).unwrap_or(0)
    }

    #[test]
    fn least_loaded_with_id_tie_break() {
        let rec = |id: &str, load| ProxyRecord {
            proxy_id: pid(id),
            address: String::new(),
            health: ProxyHealth::Healthy,
            load,
            last_heartbeat_age: Duration::ZERO,
            expires_in: Duration::from_secs(10),
        };
        let pool = vec![rec("p3", 1), rec("p2", 0), rec("p1", 0)];
        assert_eq!(pick_least_loaded(&pool).unwrap().proxy_id, pid("p1"));
        let pool = vec![rec("p1", 4), rec("p2", 2)];
        assert_eq!(pick_least_loaded(&pool).unwrap().proxy_id, pid("p2"));
        assert!(pick_least_loaded(&[]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn register_picks_first_idle_proxy_and_resolves() {
        let (registry, lb) = setup();
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();
        lb.heartbeat(&heartbeat("proxy-2", 0, &[])).await.unwrap();

        let placed = lb.register_server(&sid("server-a")).await.unwrap();
        assert_eq!(placed.proxy_id, pid("proxy-1"));
        assert_eq!(placed.address, "tcp://proxy-1.local:7100");
        assert_eq!(load_of(&registry, "proxy-1").await, 1);

        let resolved = lb.resolve_server(&sid("server-a")).await.unwrap();
        assert_eq!(resolved, placed);

        // The next server goes to the other, now less loaded, proxy.
        let placed = lb.register_server(&sid("server-b")).await.unwrap();
        assert_eq!(placed.proxy_id, pid("proxy-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn register_without_proxies_fails() {
        let (_registry, lb) = setup();
        let err = lb.register_server(&sid("server-a")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Resolution(ResolutionError::NoHealthyProxy)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_register_is_idempotent() {
        let (registry, lb) = setup();
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();

        let first = lb.register_server(&sid("server-a")).await.unwrap();
        let again = lb.register_server(&sid("server-a")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(load_of(&registry, "proxy-1").await, 1);
    }

    #[tokio::test]
    async fn concurrent_register_creates_once() {
        let (registry, lb) = setup();
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();
        lb.heartbeat(&heartbeat("proxy-2", 0, &[])).await.unwrap();
        let lb = Arc::new(lb);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lb = lb.clone();
            handles.push(tokio::spawn(async move {
                lb.register_server(&sid("server-a")).await
            }));
        }

        let mut owners = Vec::new();
        for h in handles {
            match h.await.unwrap() {
                Ok(p) => owners.push(p.proxy_id),
                Err(RelayError::Resolution(ResolutionError::AlreadyRegisteredElsewhere {
                    ..
                })) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(!owners.is_empty());
        assert!(owners.iter().all(|p| *p == owners[0]));

        let total = load_of(&registry, "proxy-1").await + load_of(&registry, "proxy-2").await;
        assert_eq!(total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_unknown_and_offline() {
        let (registry, lb) = setup();
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();

        let err = lb.resolve_server(&sid("nobody")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Resolution(ResolutionError::UnknownServer(_))
        ));

        lb.register_server(&sid("server-a")).await.unwrap();
        registry
            .remove_if(&sid("server-a"), &pid("proxy-1"))
            .await
            .unwrap();
        let err = lb.resolve_server(&sid("server-a")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Resolution(ResolutionError::ServerOffline(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_take_proxy_out_until_reregistration() {
        let (registry, lb) = setup();
        let interval = lb.settings().heartbeat_interval;
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();
        lb.heartbeat(&heartbeat("proxy-2", 0, &[])).await.unwrap();

        let placed = lb.register_server(&sid("server-a")).await.unwrap();
        assert_eq!(placed.proxy_id, pid("proxy-1"));

        // proxy-2 keeps reporting; proxy-1 goes silent for three intervals.
        for _ in 0..3 {
            tokio::time::advance(interval).await;
            lb.heartbeat(&heartbeat("proxy-2", 0, &[])).await.unwrap();
        }

        let err = lb.resolve_server(&sid("server-a")).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Resolution(ResolutionError::ServerOffline(_))
        ));
        let silent = registry.get_proxy(&pid("proxy-1")).await.unwrap().unwrap();
        assert_eq!(silent.health, ProxyHealth::Unhealthy);

        // Re-registration moves the server onto the healthy proxy.
        let moved = lb.register_server(&sid("server-a")).await.unwrap();
        assert_eq!(moved.proxy_id, pid("proxy-2"));
        assert_eq!(lb.resolve_server(&sid("server-a")).await.unwrap(), moved);
        assert_eq!(load_of(&registry, "proxy-2").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reconciles_load_and_reports_lost_servers() {
        let (registry, lb) = setup();
        lb.heartbeat(&heartbeat("proxy-1", 0, &[])).await.unwrap();
        lb.register_server(&sid("server-a")).await.unwrap();

        let ack = lb
            .heartbeat(&heartbeat("proxy-1", 3, &["server-a", "server-x"]))
            .await
            .unwrap();
        assert_eq!(ack.not_owned, vec![sid("server-x")]);
        assert_eq!(load_of(&registry, "proxy-1").await, 3);

        // Heartbeats keep the assignment alive past its original TTL.
        let ttl = lb.settings().assignment_ttl;
        for _ in 0..3 {
            tokio::time::advance(ttl / 2).await;
            lb.heartbeat(&heartbeat("proxy-1", 1, &["server-a"])).await.unwrap();
        }
        assert!(lb.resolve_server(&sid("server-a")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_registry_times_out() {
        struct Stalled;

        #[async_trait::async_trait]
        impl ConnectionRegistry for Stalled {
            async fn put_if_absent(&self, _: &ServerId, _: &ProxyId, _: Duration) -> RelayResult<PutOutcome> {
                std::future::pending().await
            }
            async fn compare_and_swap(&self, _: &ServerId, _: &ProxyId, _: &ProxyId, _: Duration) -> RelayResult<bool> {
                std::future::pending().await
            }
            async fn get(&self, _: &ServerId) -> RelayResult<Lookup> {
                std::future::pending().await
            }
            async fn refresh(&self, _: &ServerId, _: &ProxyId, _: Duration) -> RelayResult<bool> {
                std::future::pending().await
            }
            async fn remove_if(&self, _: &ServerId, _: &ProxyId) -> RelayResult<bool> {
                std::future::pending().await
            }
            async fn increment_load(&self, _: &ProxyId) -> RelayResult<u64> {
                std::future::pending().await
            }
            async fn decrement_load(&self, _: &ProxyId) -> RelayResult<u64> {
                std::future::pending().await
            }
            async fn set_load(&self, _: &ProxyId, _: u64) -> RelayResult<()> {
                std::future::pending().await
            }
            async fn upsert_proxy(&self, _: &ProxyAdvert, _: Duration) -> RelayResult<()> {
                std::future::pending().await
            }
            async fn get_proxy(&self, _: &ProxyId) -> RelayResult<Option<ProxyRecord>> {
                std::future::pending().await
            }
            async fn mark_unhealthy(&self, _: &ProxyId) -> RelayResult<bool> {
                std::future::pending().await
            }
            async fn list_healthy_proxies(&self) -> RelayResult<Vec<ProxyRecord>> {
                std::future::pending().await
            }
        }

        let lb = LoadBalancer::new(Arc::new(Stalled), BalancerSettings::default());
        let err = lb.resolve_server(&sid("server-a")).await.unwrap_err();
        assert!(matches!(err, RelayError::Infra(InfraError::Timeout(_))));
    }
}
