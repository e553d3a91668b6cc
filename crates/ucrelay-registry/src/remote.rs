//! [`ConnectionRegistry`] client for a registry service.

use crate::protocol::{RegistryRequest, RegistryResponse};
use crate::types::{Lookup, ProxyAdvert, ProxyRecord, PutOutcome};
use crate::ConnectionRegistry;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use ucrelay_core::rpc::RpcClient;
use ucrelay_core::{InfraError, ProxyId, RelayError, RelayResult, ServerId};

/// Connections kept open to the registry service.
const POOL_SIZE: usize = 4;

/// Remote registry. Every call is bounded by `timeout`; transport failures
/// and timeouts surface as [`InfraError::RegistryUnavailable`].
pub struct RemoteRegistry {
    client: RpcClient<RegistryRequest, RegistryResponse>,
}

impl RemoteRegistry {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: RpcClient::new(addr, timeout, POOL_SIZE),
        }
    }

    async fn call(&self, request: RegistryRequest) -> RelayResult<RegistryResponse> {
        match self.client.call(&request).await {
            Ok(RegistryResponse::Error(wire)) => Err(wire.into_error()),
            Ok(response) => Ok(response),
            Err(e) if e.is_retryable() => {
                debug!(addr = %self.client.addr(), error = %e, "registry call failed");
                Err(InfraError::RegistryUnavailable(format!("{}: {e}", self.client.addr())).into())
            }
            Err(e) => Err(e),
        }
    }
}

fn unexpected(response: RegistryResponse) -> RelayError {
    RelayError::Codec(format!("unexpected registry response: {}", response.kind()))
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl ConnectionRegistry for RemoteRegistry {
    async fn put_if_absent(
        &self,
        server: &ServerId,
        proxy: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<PutOutcome> {
        let request = RegistryRequest::PutIfAbsent {
            server: server.clone(),
            proxy: proxy.clone(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(request).await? {
            RegistryResponse::Put(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    async fn compare_and_swap(
        &self,
        server: &ServerId,
        expected: &ProxyId,
        new: &ProxyId,
        ttl: Duration,
    ) -> RelayResult<bool> {
        let request = RegistryRequest::CompareAndSwap {
            server: server.clone(),
            expected: expected.clone(),
            new: new.clone(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(request).await? {
            RegistryResponse::Applied(swapped) => Ok(swapped),
            other => Err(unexpected(other)),
        }
    }

    async fn get(&self, server: &ServerId) -> RelayResult<Lookup> {
        let request = RegistryRequest::Get {
            server: server.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Lookup(lookup) => Ok(lookup),
            other => Err(unexpected(other)),
        }
    }

    async fn refresh(&self, server: &ServerId, proxy: &ProxyId, ttl: Duration) -> RelayResult<bool> {
        let request = RegistryRequest::Refresh {
            server: server.clone(),
            proxy: proxy.clone(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(request).await? {
            RegistryResponse::Applied(applied) => Ok(applied),
            other => Err(unexpected(other)),
        }
    }

    async fn remove_if(&self, server: &ServerId, proxy: &ProxyId) -> RelayResult<bool> {
        let request = RegistryRequest::RemoveIf {
            server: server.clone(),
            proxy: proxy.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Applied(applied) => Ok(applied),
            other => Err(unexpected(other)),
        }
    }

    async fn increment_load(&self, proxy: &ProxyId) -> RelayResult<u64> {
        let request = RegistryRequest::IncrementLoad {
            proxy: proxy.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Load(load) => Ok(load),
            other => Err(unexpected(other)),
        }
    }

    async fn decrement_load(&self, proxy: &ProxyId) -> RelayResult<u64> {
        let request = RegistryRequest::DecrementLoad {
            proxy: proxy.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Load(load) => Ok(load),
            other => Err(unexpected(other)),
        }
    }

    async fn set_load(&self, proxy: &ProxyId, load: u64) -> RelayResult<()> {
        let request = RegistryRequest::SetLoad {
            proxy: proxy.clone(),
            load,
        };
        match self.call(request).await? {
            RegistryResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_proxy(&self, advert: &ProxyAdvert, ttl: Duration) -> RelayResult<()> {
        let request = RegistryRequest::UpsertProxy {
            advert: advert.clone(),
            ttl_ms: ttl_ms(ttl),
        };
        match self.call(request).await? {
            RegistryResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn get_proxy(&self, proxy: &ProxyId) -> RelayResult<Option<ProxyRecord>> {
        let request = RegistryRequest::GetProxy {
            proxy: proxy.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Proxy(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    async fn mark_unhealthy(&self, proxy: &ProxyId) -> RelayResult<bool> {
        let request = RegistryRequest::MarkUnhealthy {
            proxy: proxy.clone(),
        };
        match self.call(request).await? {
            RegistryResponse::Applied(applied) => Ok(applied),
            other => Err(unexpected(other)),
        }
    }

    async fn list_healthy_proxies(&self) -> RelayResult<Vec<ProxyRecord>> {
        match self.call(RegistryRequest::ListHealthyProxies).await? {
            RegistryResponse::Proxies(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }
}
