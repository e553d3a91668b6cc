//! Request/response RPC over TCP used between the proxy, the balancer and the
//! registry service.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`, one request then
//! one response per round trip. Connections are kept open and reused.

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{InfraError, RelayError, RelayResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on a single RPC message.
pub const MAX_RPC_FRAME: usize = 4 * 1024 * 1024;

/// A length-prefixed CBOR message stream.
pub struct RpcStream {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl RpcStream {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_RPC_FRAME)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }

    pub async fn connect(addr: &str) -> RelayResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::Transport(format!("connect {addr}: {e}")))?;
        Ok(Self::new(stream))
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> RelayResult<()> {
        let payload = cbor_encode(value)?;
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    /// Next message, `None` when the peer closed the connection.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> RelayResult<Option<T>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(cbor_decode(&frame)?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Server side of an RPC protocol.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + Sync + 'static;

    async fn handle(&self, request: Self::Request) -> Self::Response;
}

/// Accept connections on `listener` and answer requests with `handler` until
/// `shutdown` fires. Each connection is served on its own task; requests on
/// one connection are answered in order.
pub async fn serve<H: RpcHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> RelayResult<()> {
    let local = listener.local_addr()?;
    info!(addr = %local, "rpc listener ready");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(addr = %local, "rpc listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, handler, shutdown).await {
                        debug!(peer = %peer, error = %e, "rpc connection ended with error");
                    }
                });
            }
        }
    }
}

async fn serve_connection<H: RpcHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> RelayResult<()> {
    debug!(peer = %peer, "rpc connection opened");
    let mut stream = RpcStream::new(stream);
    loop {
        let request: H::Request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = stream.recv::<H::Request>() => match next? {
                Some(request) => request,
                None => {
                    debug!(peer = %peer, "rpc connection closed");
                    return Ok(());
                }
            },
        };
        let response = handler.handle(request).await;
        stream.send(&response).await?;
    }
}

/// Client side: a small pool of persistent connections to one address.
///
/// Each call takes one pooled connection for a full round trip. A connection
/// that fails or times out is dropped and re-established on next use.
pub struct RpcClient<Req, Resp> {
    addr: String,
    timeout: Duration,
    slots: Vec<Mutex<Option<RpcStream>>>,
    next: AtomicUsize,
    _protocol: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> RpcClient<Req, Resp>
where
    Req: Serialize + Send + Sync,
    Resp: DeserializeOwned + Send,
{
    pub fn new(addr: impl Into<String>, timeout: Duration, pool_size: usize) -> Self {
        let slots = (0..pool_size.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            addr: addr.into(),
            timeout,
            slots,
            next: AtomicUsize::new(0),
            _protocol: PhantomData,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// One request/response round trip, bounded by the client timeout.
    pub async fn call(&self, request: &Req) -> RelayResult<Resp> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[idx].lock().await;

        let exchange = async {
            let mut stream = match slot.take() {
                Some(stream) => stream,
                None => RpcStream::connect(&self.addr).await?,
            };
            stream.send(request).await?;
            let response = stream.recv::<Resp>().await?.ok_or_else(|| {
                RelayError::Transport(format!("{} closed the connection", self.addr))
            })?;
            *slot = Some(stream);
            Ok::<Resp, RelayError>(response)
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                *slot = None;
                Err(InfraError::Timeout(format!("{} after {:?}", self.addr, self.timeout)).into())
            }
        }
    }
}
