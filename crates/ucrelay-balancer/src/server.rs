//! Balancer RPC server.

use crate::balancer::LoadBalancer;
use crate::protocol::{BalancerRequest, BalancerResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ucrelay_core::rpc::{self, RpcHandler};
use ucrelay_core::{RelayError, RelayResult, WireError};

pub struct BalancerServer {
    balancer: Arc<LoadBalancer>,
}

impl BalancerServer {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self { balancer }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) -> RelayResult<()> {
        rpc::serve(listener, Arc::new(self), shutdown).await
    }

    async fn dispatch(&self, request: BalancerRequest) -> RelayResult<BalancerResponse> {
        let lb = &self.balancer;
        Ok(match request {
            BalancerRequest::RegisterServer { server } => {
                BalancerResponse::Placement(lb.register_server(&server).await?)
            }
            BalancerRequest::ResolveServer { server } => {
                BalancerResponse::Placement(lb.resolve_server(&server).await?)
            }
            BalancerRequest::Heartbeat(heartbeat) => {
                BalancerResponse::HeartbeatAck(lb.heartbeat(&heartbeat).await?)
            }
            BalancerRequest::ListProxies => BalancerResponse::Proxies(lb.healthy_proxies().await?),
        })
    }
}

#[async_trait]
impl RpcHandler for BalancerServer {
    type Request = BalancerRequest;
    type Response = BalancerResponse;

    async fn handle(&self, request: BalancerRequest) -> BalancerResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                log_failure(&e);
                BalancerResponse::Error(WireError::from(&e))
            }
        }
    }
}

fn log_failure(e: &RelayError) {
    match e {
        // Expected answers, not faults.
        RelayError::Resolution(_) => debug!(error = %e, "request refused"),
        _ => warn!(error = %e, "request failed"),
    }
}
