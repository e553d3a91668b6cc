//! A connection from an endpoint to its proxy.
//!
//! `ProxyConnection` runs the `Hello` handshake, then exposes the relayed
//! frames. Writes go through a background writer task so the keepalive task
//! and [`FrameSender`] clones can share the transport.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};
use ucrelay_core::control::{ClosePayload, HelloOkPayload, HelloPayload, PingPayload};
use ucrelay_core::transport::{self, Endpoint, FrameReader, FrameWriter};
use ucrelay_core::{
    CloseReason, Control, Envelope, Frame, HandshakeError, MessageType, RelayError, RelayResult,
    Role, ServerId, DEFAULT_MAX_PAYLOAD, PROTOCOL_VERSION,
};

/// Configuration for connecting to a proxy.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Credential presented in `Hello`.
    pub credential: String,
    /// Bound on connect plus handshake.
    pub timeout: Duration,
    /// Keepalive ping period. `None` follows the proxy's hint; zero disables.
    pub ping_interval: Option<Duration>,
    pub max_payload: u32,
    pub outbound_queue: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            credential: String::new(),
            timeout: Duration::from_secs(10),
            ping_interval: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            outbound_queue: 256,
        }
    }
}

/// Something that arrived from the proxy.
#[derive(Debug)]
pub enum Event {
    /// A relayed application frame.
    Message(Frame),
    /// The proxy could not deliver one of our frames. The connection stays up.
    Undeliverable(RelayError),
    /// The proxy closed the connection.
    Closed(ClosePayload),
}

/// Cloneable handle for sending on a [`ProxyConnection`].
#[derive(Debug, Clone)]
pub struct FrameSender {
    id: String,
    outgoing: mpsc::Sender<Bytes>,
}

impl FrameSender {
    /// Send an application frame from this endpoint to `target`.
    pub async fn send(
        &self,
        target: &str,
        message_type: impl Into<MessageType>,
        payload: impl Into<Bytes>,
    ) -> RelayResult<()> {
        let message_type = message_type.into();
        if message_type.is_control() {
            return Err(RelayError::Other(format!(
                "message type {message_type} is reserved for control frames"
            )));
        }
        let frame = Envelope::new(self.id.as_str(), target, message_type, payload).encode()?;
        self.send_raw(frame).await
    }

    async fn send_raw(&self, frame: Bytes) -> RelayResult<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| RelayError::Transport("connection closed".into()))
    }

    async fn send_control(&self, control: Control) -> RelayResult<()> {
        self.send_raw(control.encode(&self.id, "")?).await
    }
}

/// An authenticated connection to a proxy.
pub struct ProxyConnection {
    role: Role,
    welcome: HelloOkPayload,
    sender: FrameSender,
    reader: FrameReader,
    finished: bool,
    writer_stop: Option<oneshot::Sender<()>>,
    writer_handle: Option<JoinHandle<()>>,
    keepalive_handle: Option<JoinHandle<()>>,
}

impl ProxyConnection {
    /// Connect to the proxy at `address` (`tcp://` or `ws://`) and complete the
    /// handshake as `id`. Clients name the server they want in `server`.
    pub async fn connect(
        address: &str,
        role: Role,
        id: &str,
        server: Option<&ServerId>,
        config: &ConnectConfig,
    ) -> RelayResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let hello = HelloPayload {
            version: PROTOCOL_VERSION,
            role,
            id: id.to_string(),
            credential: config.credential.clone(),
            server_id: server.map(ToString::to_string),
        };

        let (reader, writer, welcome) =
            match time::timeout(config.timeout, handshake(&endpoint, hello, config.max_payload))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(HandshakeError::HandshakeTimeout.into()),
            };
        debug!(
            proxy_id = %welcome.proxy_id,
            connection_id = welcome.connection_id,
            %endpoint,
            "connected to proxy"
        );

        let (outgoing, outgoing_rx) = mpsc::channel(config.outbound_queue);
        let sender = FrameSender {
            id: id.to_string(),
            outgoing,
        };
        let (writer_stop, stop_rx) = oneshot::channel();
        let writer_handle = tokio::spawn(write_loop(writer, outgoing_rx, stop_rx));

        let ping_interval = config
            .ping_interval
            .unwrap_or(Duration::from_millis(welcome.heartbeat_interval_ms));
        let keepalive_handle =
            (!ping_interval.is_zero()).then(|| tokio::spawn(keepalive(sender.clone(), ping_interval)));

        Ok(Self {
            role,
            welcome,
            sender,
            reader,
            finished: false,
            writer_stop: Some(writer_stop),
            writer_handle: Some(writer_handle),
            keepalive_handle,
        })
    }

    pub fn id(&self) -> &str {
        &self.sender.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn proxy_id(&self) -> &str {
        &self.welcome.proxy_id
    }

    pub fn connection_id(&self) -> u64 {
        self.welcome.connection_id
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub async fn send(
        &self,
        target: &str,
        message_type: impl Into<MessageType>,
        payload: impl Into<Bytes>,
    ) -> RelayResult<()> {
        self.sender.send(target, message_type, payload).await
    }

    /// Next event from the proxy. Keepalive traffic is handled here and never
    /// surfaced. `None` once the connection has ended.
    pub async fn next_event(&mut self) -> Option<RelayResult<Event>> {
        if self.finished {
            return None;
        }
        loop {
            let frame = match self.reader.next_frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return None;
                }
            };
            let control = match Control::from_frame(&frame) {
                Ok(control) => control,
                Err(e) => {
                    warn!(error = %e, "bad control frame from proxy");
                    continue;
                }
            };
            match control {
                None => return Some(Ok(Event::Message(frame))),
                Some(Control::Ping(ping)) => {
                    let _ = self.sender.send_control(Control::Pong(ping)).await;
                }
                Some(Control::Pong(_)) => {}
                Some(Control::Error(report)) => {
                    return Some(Ok(Event::Undeliverable(report.error.into_error())));
                }
                Some(Control::Close(close)) => {
                    self.finished = true;
                    return Some(Ok(Event::Closed(close)));
                }
                Some(other) => debug!(kind = ?other.kind(), "ignoring control frame"),
            }
        }
    }

    /// Next relayed frame. Undeliverable reports and proxy closes become errors;
    /// `Ok(None)` on a clean end of stream.
    pub async fn recv(&mut self) -> RelayResult<Option<Frame>> {
        match self.next_event().await {
            None => Ok(None),
            Some(Ok(Event::Message(frame))) => Ok(Some(frame)),
            Some(Ok(Event::Undeliverable(e))) => Err(e),
            Some(Ok(Event::Closed(close))) => Err(close.into_error()),
            Some(Err(e)) => Err(e),
        }
    }

    /// Say goodbye and close the transport once queued frames are written.
    pub async fn close(mut self) -> RelayResult<()> {
        let bye = Control::Close(ClosePayload::new(CloseReason::Normal, "bye"));
        let result = self.sender.send_control(bye).await;
        self.stop();
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.await;
        }
        result
    }

    fn stop(&mut self) {
        if let Some(keepalive) = self.keepalive_handle.take() {
            keepalive.abort();
        }
        if let Some(stop) = self.writer_stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handshake(
    endpoint: &Endpoint,
    hello: HelloPayload,
    max_payload: u32,
) -> RelayResult<(FrameReader, FrameWriter, HelloOkPayload)> {
    let (mut reader, mut writer) = transport::connect(endpoint, max_payload).await?;
    let id = hello.id.clone();
    writer
        .send_frame(Control::Hello(hello).encode(&id, "")?)
        .await?;

    let frame = match reader.next_frame().await {
        Some(frame) => frame?,
        None => {
            return Err(RelayError::Transport(
                "proxy closed the connection during handshake".into(),
            ))
        }
    };
    match Control::from_frame(&frame)? {
        Some(Control::HelloOk(welcome)) => Ok((reader, writer, welcome)),
        Some(Control::Close(close)) => Err(close.into_error()),
        Some(other) => Err(HandshakeError::UnexpectedMessage(format!("{:?}", other.kind())).into()),
        None => Err(HandshakeError::UnexpectedMessage(format!(
            "application frame {} before HelloOk",
            frame.message_type()
        ))
        .into()),
    }
}

/// Write queued frames until every sender is gone or `stop` fires. Frames
/// already queued when `stop` fires are still written.
async fn write_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Bytes>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut stopping = false;
    loop {
        let frame = if stopping {
            rx.try_recv().ok()
        } else {
            tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = &mut stop => {
                    stopping = true;
                    continue;
                }
            }
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.send_frame(frame).await {
            debug!(error = %e, "proxy write failed");
            break;
        }
    }
    let _ = writer.close().await;
}

async fn keepalive(sender: FrameSender, interval: Duration) {
    let mut ping_id: u64 = 0;
    let mut ticker = time::interval(interval);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        ping_id += 1;
        if sender
            .send_control(Control::Ping(PingPayload { id: ping_id }))
            .await
            .is_err()
        {
            break;
        }
    }
    debug!("keepalive loop ended");
}
