//! Client for the balancer RPC, used by proxies, endpoints and the CLI.

use crate::protocol::{BalancerRequest, BalancerResponse, HeartbeatAck, Placement, ProxyHeartbeat};
use std::time::Duration;
use ucrelay_core::rpc::RpcClient;
use ucrelay_core::{RelayError, RelayResult, ServerId};
use ucrelay_registry::ProxyRecord;

const POOL_SIZE: usize = 2;

pub struct BalancerClient {
    rpc: RpcClient<BalancerRequest, BalancerResponse>,
}

impl BalancerClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            rpc: RpcClient::new(addr, timeout, POOL_SIZE),
        }
    }

    pub fn addr(&self) -> &str {
        self.rpc.addr()
    }

    pub async fn register_server(&self, server: &ServerId) -> RelayResult<Placement> {
        let request = BalancerRequest::RegisterServer {
            server: server.clone(),
        };
        match self.call(&request).await? {
            BalancerResponse::Placement(placement) => Ok(placement),
            _ => Err(unexpected()),
        }
    }

    pub async fn resolve_server(&self, server: &ServerId) -> RelayResult<Placement> {
        let request = BalancerRequest::ResolveServer {
            server: server.clone(),
        };
        match self.call(&request).await? {
            BalancerResponse::Placement(placement) => Ok(placement),
            _ => Err(unexpected()),
        }
    }

    pub async fn heartbeat(&self, heartbeat: ProxyHeartbeat) -> RelayResult<HeartbeatAck> {
        match self.call(&BalancerRequest::Heartbeat(heartbeat)).await? {
            BalancerResponse::HeartbeatAck(ack) => Ok(ack),
            _ => Err(unexpected()),
        }
    }

    pub async fn list_proxies(&self) -> RelayResult<Vec<ProxyRecord>> {
        match self.call(&BalancerRequest::ListProxies).await? {
            BalancerResponse::Proxies(records) => Ok(records),
            _ => Err(unexpected()),
        }
    }

    async fn call(&self, request: &BalancerRequest) -> RelayResult<BalancerResponse> {
        match self.rpc.call(request).await? {
            BalancerResponse::Error(wire) => Err(wire.into_error()),
            response => Ok(response),
        }
    }
}

fn unexpected() -> RelayError {
    RelayError::Codec("unexpected balancer response".into())
}
