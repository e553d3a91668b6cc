//! Periodic proxy heartbeat to the balancer.
//!
//! Each beat reports load, health and hosted servers. Servers the balancer
//! says this proxy no longer owns are disconnected. After too many
//! consecutive failed beats the proxy declares itself unhealthy and drops
//! every connection so endpoints re-resolve elsewhere.

use crate::node::ProxyNode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ucrelay_balancer::{BalancerClient, HeartbeatAck, ProxyHeartbeat};
use ucrelay_core::{Backoff, CloseReason, RelayResult};
use ucrelay_registry::ProxyHealth;

pub struct HeartbeatEmitter {
    node: Arc<ProxyNode>,
    balancer: Arc<BalancerClient>,
    advertise: String,
    interval: Duration,
    missed_limit: u32,
    backoff: Backoff,
    missed: u32,
}

impl HeartbeatEmitter {
    pub fn new(
        node: Arc<ProxyNode>,
        balancer: Arc<BalancerClient>,
        advertise: impl Into<String>,
        interval: Duration,
        missed_limit: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            node,
            balancer,
            advertise: advertise.into(),
            interval,
            missed_limit: missed_limit.max(1),
            backoff,
            missed: 0,
        }
    }

    /// Consecutive failed beats so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Beat until `shutdown` fires, then report the proxy as unhealthy once
    /// so no new servers are placed on it.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            balancer = %self.balancer.addr(),
            interval = ?self.interval,
            "heartbeat started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        let farewell = self.report(ProxyHealth::Unhealthy);
        if let Err(e) = self.balancer.heartbeat(farewell).await {
            debug!(error = %e, "final heartbeat failed");
        }
    }

    /// One beat, including its retries and the reaction to the outcome.
    pub async fn tick(&mut self) {
        match self.beat().await {
            Ok(ack) => self.on_ack(ack),
            Err(e) => self.on_failure(e.to_string()),
        }
    }

    async fn beat(&self) -> RelayResult<HeartbeatAck> {
        self.backoff
            .retry("heartbeat", || {
                self.balancer.heartbeat(self.report(ProxyHealth::Healthy))
            })
            .await
    }

    fn report(&self, health: ProxyHealth) -> ProxyHeartbeat {
        ProxyHeartbeat {
            proxy_id: self.node.id().clone(),
            address: self.advertise.clone(),
            load: self.node.load(),
            health,
            servers: self.node.hosted_servers(),
        }
    }

    fn on_ack(&mut self, ack: HeartbeatAck) {
        if self.missed > 0 {
            info!(missed = self.missed, "balancer reachable again");
        }
        self.missed = 0;
        self.node.set_healthy(true);
        for server in &ack.not_owned {
            self.node
                .disconnect_server(server, CloseReason::NoLongerAssigned);
        }
    }

    fn on_failure(&mut self, error: String) {
        self.missed += 1;
        warn!(missed = self.missed, limit = self.missed_limit, %error, "heartbeat failed");
        if self.missed == self.missed_limit {
            error!("lost contact with balancer; dropping all connections");
            self.node.set_healthy(false);
            self.node.drop_all(CloseReason::ProxyUnhealthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::config::ProxySettings;
    use crate::hooks::{HookPhase, HookRegistry};
    use crate::sessions::{Closer, ServerSlot};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use ucrelay_balancer::{BalancerServer, BalancerSettings, LoadBalancer};
    use ucrelay_core::{ConnectionId, ProxyId, ServerId};
    use ucrelay_registry::{ConnectionRegistry, MemoryRegistry};

    fn node(registry: Arc<MemoryRegistry>) -> Arc<ProxyNode> {
        Arc::new(ProxyNode::new(
            ProxyId::new("p1").unwrap(),
            ProxySettings::default(),
            registry,
            Arc::new(AllowAll),
            Arc::new(HookRegistry::new(HookPhase::After, Duration::from_secs(1))),
        ))
    }

    fn host(node: &ProxyNode, server: &str) -> Arc<ServerSlot> {
        let (tx, _rx) = mpsc::channel(1);
        let slot = Arc::new(ServerSlot::new(
            ServerId::new(server).unwrap(),
            ConnectionId(1),
            tx,
            Closer::new(CancellationToken::new()),
        ));
        node.sessions().attach_server(slot.clone());
        slot
    }

    async fn balancer(registry: Arc<MemoryRegistry>) -> (Arc<BalancerClient>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let lb = LoadBalancer::new(registry, BalancerSettings::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(BalancerServer::new(Arc::new(lb)).run(listener, shutdown.clone()));
        (
            Arc::new(BalancerClient::new(addr, Duration::from_secs(2))),
            shutdown,
        )
    }

    #[tokio::test]
    async fn beat_advertises_proxy_and_drops_servers_owned_elsewhere() {
        let registry = Arc::new(MemoryRegistry::default());
        let node = node(registry.clone());
        let (client, shutdown) = balancer(registry.clone()).await;

        let ttl = Duration::from_secs(30);
        let mine = ServerId::new("srv-a").unwrap();
        let theirs = ServerId::new("srv-b").unwrap();
        registry.put_if_absent(&mine, node.id(), ttl).await.unwrap();
        registry
            .put_if_absent(&theirs, &ProxyId::new("p2").unwrap(), ttl)
            .await
            .unwrap();
        let a = host(&node, "srv-a");
        let b = host(&node, "srv-b");

        let mut emitter = HeartbeatEmitter::new(
            node.clone(),
            client,
            "tcp://127.0.0.1:7100",
            Duration::from_secs(5),
            3,
            Backoff::none(),
        );
        emitter.tick().await;
        assert_eq!(emitter.missed(), 0);
        assert!(!a.closer.is_closed());
        assert_eq!(b.closer.reason(), Some(CloseReason::NoLongerAssigned));

        let record = registry.get_proxy(node.id()).await.unwrap().unwrap();
        assert_eq!(record.address, "tcp://127.0.0.1:7100");
        assert_eq!(record.load, 2);
        assert!(record.is_healthy());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn missed_beats_mark_proxy_unhealthy_then_recover() {
        let registry = Arc::new(MemoryRegistry::default());
        let node = node(registry.clone());
        let slot = host(&node, "srv-a");

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = closed.local_addr().unwrap().to_string();
        drop(closed);
        let mut emitter = HeartbeatEmitter::new(
            node.clone(),
            Arc::new(BalancerClient::new(dead_addr, Duration::from_millis(200))),
            "tcp://127.0.0.1:7100",
            Duration::from_secs(5),
            2,
            Backoff::none(),
        );

        emitter.tick().await;
        assert!(node.is_healthy());
        assert!(!slot.closer.is_closed());

        emitter.tick().await;
        assert_eq!(emitter.missed(), 2);
        assert!(!node.is_healthy());
        assert_eq!(slot.closer.reason(), Some(CloseReason::ProxyUnhealthy));

        let (client, shutdown) = balancer(registry).await;
        emitter.balancer = client;
        emitter.tick().await;
        assert_eq!(emitter.missed(), 0);
        assert!(node.is_healthy());
        shutdown.cancel();
    }
}
