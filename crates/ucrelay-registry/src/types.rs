//! Registry records and operation outcomes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ucrelay_core::{ProxyId, ServerId};

/// A live server-to-proxy assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub server_id: ServerId,
    pub proxy_id: ProxyId,
    /// Wall-clock registration time (unix seconds).
    pub registered_at: u64,
    /// Time left before the assignment expires.
    pub expires_in: Duration,
}

/// Result of reading an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lookup {
    Live(Assignment),
    /// The assignment expired or was removed; kept as a tombstone.
    Offline { last_proxy: ProxyId },
    /// Never registered, or the tombstone has been purged.
    Missing,
}

impl Lookup {
    pub fn live(&self) -> Option<&Assignment> {
        match self {
            Lookup::Live(a) => Some(a),
            _ => None,
        }
    }
}

/// Result of [`crate::ConnectionRegistry::put_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
    /// A new assignment was written.
    Created,
    /// Already live on the requesting proxy; TTL refreshed.
    AlreadyOwned,
    /// Live on a different proxy.
    OwnedElsewhere(ProxyId),
}

/// Health a proxy reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// What a proxy heartbeat writes into its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAdvert {
    pub proxy_id: ProxyId,
    /// Address clients and servers connect to (`tcp://` or `ws://`).
    pub address: String,
    pub health: ProxyHealth,
}

/// A proxy as seen through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub proxy_id: ProxyId,
    pub address: String,
    pub health: ProxyHealth,
    /// Active registrations plus sessions.
    pub load: u64,
    /// Time since the last heartbeat.
    pub last_heartbeat_age: Duration,
    /// Time left before the record expires. Zero once expired.
    pub expires_in: Duration,
}

impl ProxyRecord {
    /// Reported healthy and not expired.
    pub fn is_healthy(&self) -> bool {
        self.health == ProxyHealth::Healthy && !self.expires_in.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(health: ProxyHealth, expires_in: Duration) -> ProxyRecord {
        ProxyRecord {
            proxy_id: ProxyId::new("p1").unwrap(),
            address: "tcp://127.0.0.1:7100".into(),
            health,
            load: 0,
            last_heartbeat_age: Duration::ZERO,
            expires_in,
        }
    }

    #[test]
    fn healthy_requires_report_and_freshness() {
        assert!(record(ProxyHealth::Healthy, Duration::from_secs(3)).is_healthy());
        assert!(!record(ProxyHealth::Healthy, Duration::ZERO).is_healthy());
        assert!(!record(ProxyHealth::Degraded, Duration::from_secs(3)).is_healthy());
        assert!(!record(ProxyHealth::Unhealthy, Duration::from_secs(3)).is_healthy());
    }
}
