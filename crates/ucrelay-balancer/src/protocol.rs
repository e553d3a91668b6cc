//! Balancer RPC messages.

use serde::{Deserialize, Serialize};
use ucrelay_core::{ProxyId, ServerId, WireError};
use ucrelay_registry::{ProxyHealth, ProxyRecord};

/// Where a server lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub server_id: ServerId,
    pub proxy_id: ProxyId,
    /// Proxy address (`tcp://` or `ws://`).
    pub address: String,
}

/// Periodic report from a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHeartbeat {
    pub proxy_id: ProxyId,
    pub address: String,
    /// Connected servers plus active client sessions.
    pub load: u64,
    pub health: ProxyHealth,
    /// Servers currently connected to the proxy.
    pub servers: Vec<ServerId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Listed servers whose assignment no longer belongs to the reporting
    /// proxy. The proxy should disconnect them.
    pub not_owned: Vec<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerRequest {
    RegisterServer { server: ServerId },
    ResolveServer { server: ServerId },
    Heartbeat(ProxyHeartbeat),
    ListProxies,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerResponse {
    Placement(Placement),
    HeartbeatAck(HeartbeatAck),
    Proxies(Vec<ProxyRecord>),
    Error(WireError),
}
