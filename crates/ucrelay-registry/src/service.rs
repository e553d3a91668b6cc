//! Registry RPC server: exposes a [`ConnectionRegistry`] over TCP.

use crate::protocol::{RegistryRequest, RegistryResponse};
use crate::ConnectionRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ucrelay_core::rpc::{self, RpcHandler};
use ucrelay_core::{RelayResult, WireError};

pub struct RegistryService {
    registry: Arc<dyn ConnectionRegistry>,
}

impl RegistryService {
    pub fn new(registry: Arc<dyn ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> RelayResult<()> {
        rpc::serve(listener, Arc::new(self), shutdown).await
    }

    async fn dispatch(&self, request: RegistryRequest) -> RelayResult<RegistryResponse> {
        let reg = &self.registry;
        let response = match request {
            RegistryRequest::PutIfAbsent {
                server,
                proxy,
                ttl_ms,
            } => RegistryResponse::Put(reg.put_if_absent(&server, &proxy, ms(ttl_ms)).await?),
            RegistryRequest::CompareAndSwap {
                server,
                expected,
                new,
                ttl_ms,
            } => RegistryResponse::Applied(
                reg.compare_and_swap(&server, &expected, &new, ms(ttl_ms))
                    .await?,
            ),
            RegistryRequest::Get { server } => RegistryResponse::Lookup(reg.get(&server).await?),
            RegistryRequest::Refresh {
                server,
                proxy,
                ttl_ms,
            } => RegistryResponse::Applied(reg.refresh(&server, &proxy, ms(ttl_ms)).await?),
            RegistryRequest::RemoveIf { server, proxy } => {
                RegistryResponse::Applied(reg.remove_if(&server, &proxy).await?)
            }
            RegistryRequest::IncrementLoad { proxy } => {
                RegistryResponse::Load(reg.increment_load(&proxy).await?)
            }
            RegistryRequest::DecrementLoad { proxy } => {
                RegistryResponse::Load(reg.decrement_load(&proxy).await?)
            }
            RegistryRequest::SetLoad { proxy, load } => {
                reg.set_load(&proxy, load).await?;
                RegistryResponse::Done
            }
            RegistryRequest::UpsertProxy { advert, ttl_ms } => {
                reg.upsert_proxy(&advert, ms(ttl_ms)).await?;
                RegistryResponse::Done
            }
            RegistryRequest::GetProxy { proxy } => {
                RegistryResponse::Proxy(reg.get_proxy(&proxy).await?)
            }
            RegistryRequest::MarkUnhealthy { proxy } => {
                RegistryResponse::Applied(reg.mark_unhealthy(&proxy).await?)
            }
            RegistryRequest::ListHealthyProxies => {
                RegistryResponse::Proxies(reg.list_healthy_proxies().await?)
            }
        };
        Ok(response)
    }
}

#[async_trait]
impl RpcHandler for RegistryService {
    type Request = RegistryRequest;
    type Response = RegistryResponse;

    async fn handle(&self, request: RegistryRequest) -> RegistryResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "registry request failed");
                RegistryResponse::Error(WireError::from(&e))
            }
        }
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}
