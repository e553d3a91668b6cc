//! Server and client endpoints: ask the balancer where to go, then connect.

use crate::connection::{ConnectConfig, ProxyConnection};
use std::sync::Arc;
use tracing::{debug, info};
use ucrelay_balancer::{BalancerClient, Placement};
use ucrelay_core::{
    Backoff, ClientId, ErrorCode, HandshakeError, RelayError, RelayResult, Role, ServerId,
};

/// Whether a failed connect should go back to the balancer for a new answer.
///
/// `NotAssigned` means the placement changed (or the server has not reached
/// its proxy yet); `ProxyUnhealthy` and transport failures mean the proxy went
/// away.
fn should_re_resolve(err: &RelayError) -> bool {
    matches!(
        err.code(),
        ErrorCode::NotAssigned | ErrorCode::RegistryUnavailable | ErrorCode::Timeout
    ) || matches!(
        err,
        RelayError::Transport(_) | RelayError::Io(_) | RelayError::Closed { .. }
    )
}

/// Retry `attempt` while it fails with a re-resolvable error.
async fn with_re_resolve<T, F, Fut>(backoff: &Backoff, what: &str, mut attempt: F) -> RelayResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RelayResult<T>>,
{
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if should_re_resolve(&e) && tries < backoff.max_retries => {
                let delay = backoff.delay(tries);
                debug!(op = what, attempt = tries, error = %e, "re-resolving");
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A server: gets placed by the balancer and holds a channel to its proxy.
pub struct ServerEndpoint {
    balancer: Arc<BalancerClient>,
    config: ConnectConfig,
    backoff: Backoff,
}

impl ServerEndpoint {
    pub fn new(balancer: Arc<BalancerClient>, config: ConnectConfig) -> Self {
        Self {
            balancer,
            config,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register `server` and open its channel on the assigned proxy.
    pub async fn register(&self, server: &ServerId) -> RelayResult<(Placement, ProxyConnection)> {
        let result = with_re_resolve(&self.backoff, "register", || async move {
            let placement = self.balancer.register_server(server).await?;
            let conn = ProxyConnection::connect(
                &placement.address,
                Role::Server,
                server.as_str(),
                None,
                &self.config,
            )
            .await?;
            Ok((placement, conn))
        })
        .await?;
        info!(server_id = %server, proxy_id = %result.0.proxy_id, "server online");
        Ok(result)
    }
}

/// A client: resolves a server and opens a session to it.
pub struct ClientEndpoint {
    id: ClientId,
    balancer: Arc<BalancerClient>,
    config: ConnectConfig,
    backoff: Backoff,
}

impl ClientEndpoint {
    pub fn new(id: ClientId, balancer: Arc<BalancerClient>, config: ConnectConfig) -> Self {
        Self {
            id,
            balancer,
            config,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Resolve `server` and open a session to it on its proxy.
    ///
    /// Resolution errors (`UnknownServer`, `ServerOffline`, `NoHealthyProxy`)
    /// are returned as-is; a proxy that no longer hosts the server triggers a
    /// fresh resolve.
    pub async fn connect(&self, server: &ServerId) -> RelayResult<(Placement, ProxyConnection)> {
        with_re_resolve(&self.backoff, "connect", || async move {
            let placement = self.balancer.resolve_server(server).await?;
            let conn = ProxyConnection::connect(
                &placement.address,
                Role::Client,
                self.id.as_str(),
                Some(server),
                &self.config,
            )
            .await?;
            debug!(client_id = %self.id, server_id = %server, proxy_id = %placement.proxy_id, "session open");
            Ok((placement, conn))
        })
        .await
    }
}

/// `true` if the error means the proxy does not (or no longer) host the server.
pub fn is_not_assigned(err: &RelayError) -> bool {
    matches!(err, RelayError::Handshake(HandshakeError::NotAssigned(_)))
}
