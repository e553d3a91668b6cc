//! The relay proxy node.
//!
//! Accepts server and client connections over TCP and WebSocket, runs the
//! handshake, then relays frames between each client and the server it is
//! bound to. Every connection gets a reader loop (its own task) and a writer
//! task fed by a bounded queue; other connections push frames into that queue
//! to reach it.
//!
//! Cancellation is a tree: node root → server slot → client sessions. Closing
//! a server closes its sessions; shutting down closes everything.

use crate::auth::{AuthDecision, Authenticator};
use crate::config::ProxySettings;
use crate::fsm::{ConnectionState, ConnectionTable};
use crate::handshake::{self, Peer};
use crate::hooks::{Direction, HookContext, HookDispatcher, HookRegistry};
use crate::sessions::{AttachError, ClientHandle, Closer, ServerSlot, SessionTable};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use ucrelay_core::control::{ClosePayload, ErrorPayload};
use ucrelay_core::transport;
use ucrelay_core::{
    ClientId, CloseReason, ConnectionId, Control, Frame, FrameReader, FrameWriter,
    HandshakeError, ProtocolError, ProxyId, RelayError, RelayResult, Role, RoutingError,
    ServerId, TransportKind, WireError,
};
use ucrelay_registry::{ConnectionRegistry, Lookup};

/// Per-connection state shared by the handshake and relay loops.
struct Conn {
    id: ConnectionId,
    remote: String,
    outbound: mpsc::Sender<Bytes>,
}

/// How a relay loop ended.
struct Exit {
    reason: CloseReason,
    /// Close frame to send the peer; `None` when the peer already left.
    notify: Option<ClosePayload>,
}

impl Exit {
    fn local(reason: CloseReason) -> Self {
        Self {
            reason,
            notify: Some(ClosePayload::new(reason, close_message(reason))),
        }
    }

    fn failed(err: &RelayError) -> Self {
        let notify = ClosePayload::from_error(err);
        Self {
            reason: notify.reason,
            notify: Some(notify),
        }
    }

    fn peer_left(reason: CloseReason) -> Self {
        Self {
            reason,
            notify: None,
        }
    }

    fn read_failed(err: RelayError) -> Self {
        match err {
            RelayError::Protocol(_) => Self::failed(&err),
            other => {
                debug!(error = %other, "read failed");
                Self::peer_left(CloseReason::Failed(other.code()))
            }
        }
    }
}

enum Flow {
    Relay,
    Continue,
    Exit(Exit),
}

fn close_message(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::Normal => "closed",
        CloseReason::Shutdown => "proxy shutting down",
        CloseReason::ServerDisconnected => "server disconnected",
        CloseReason::IdleTimeout => "session idle",
        CloseReason::HeartbeatTimeout => "no frames within heartbeat timeout",
        CloseReason::ProxyUnhealthy => "proxy lost contact with the balancer; re-resolve",
        CloseReason::Superseded => "replaced by a newer connection",
        CloseReason::NoLongerAssigned => "server is no longer assigned to this proxy",
        CloseReason::Failed(_) => "failed",
    }
}

/// Reason a server's sessions close with when the server goes away.
fn cascade(reason: CloseReason) -> CloseReason {
    match reason {
        CloseReason::Shutdown | CloseReason::ProxyUnhealthy => reason,
        _ => CloseReason::ServerDisconnected,
    }
}

/// One relay proxy.
pub struct ProxyNode {
    id: ProxyId,
    settings: ProxySettings,
    registry: Arc<dyn ConnectionRegistry>,
    auth: Arc<dyn Authenticator>,
    hooks: Arc<HookRegistry>,
    sessions: SessionTable,
    connections: ConnectionTable,
    healthy: AtomicBool,
    /// Stops accept loops.
    listeners: CancellationToken,
    /// Parent of every connection's closer.
    root: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyNode {
    pub fn new(
        id: ProxyId,
        settings: ProxySettings,
        registry: Arc<dyn ConnectionRegistry>,
        auth: Arc<dyn Authenticator>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            id,
            settings,
            registry,
            auth,
            hooks,
            sessions: SessionTable::new(),
            connections: ConnectionTable::new(),
            healthy: AtomicBool::new(true),
            listeners: CancellationToken::new(),
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Connected servers plus active sessions.
    pub fn load(&self) -> u64 {
        self.sessions.load()
    }

    pub fn hosted_servers(&self) -> Vec<ServerId> {
        self.sessions.server_ids()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// An unhealthy proxy refuses new handshakes with `ProxyUnhealthy`.
    pub fn set_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::Relaxed);
        if was != healthy {
            info!(proxy_id = %self.id, healthy, "proxy health changed");
        }
    }

    /// Close one server connection (and its sessions).
    pub fn disconnect_server(&self, server: &ServerId, reason: CloseReason) -> bool {
        match self.sessions.get(server) {
            Some(slot) => {
                info!(server_id = %server, ?reason, "disconnecting server");
                slot.closer.close(reason);
                true
            }
            None => false,
        }
    }

    /// Close every server connection, and through them every session.
    pub fn drop_all(&self, reason: CloseReason) -> usize {
        let slots = self.sessions.slots();
        for slot in &slots {
            slot.closer.close(reason);
        }
        if !slots.is_empty() {
            warn!(servers = slots.len(), ?reason, "dropping all server channels");
        }
        slots.len()
    }

    /// Stop accepting, close every connection with `Shutdown` and wait up to
    /// `deadline` for connection tasks to release their registry state.
    pub async fn shutdown(&self, deadline: Duration) {
        info!(proxy_id = %self.id, "proxy shutting down");
        self.listeners.cancel();
        self.drop_all(CloseReason::Shutdown);
        self.root.cancel();
        self.tasks.close();
        if tokio::time::timeout(deadline, self.tasks.wait()).await.is_err() {
            warn!(
                open = self.connections.len(),
                "connections still open after shutdown deadline"
            );
        }
    }

    /// Run the TCP listener and, if given, the WebSocket listener until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        tcp: TcpListener,
        ws: Option<TcpListener>,
    ) -> RelayResult<()> {
        match ws {
            Some(ws) => {
                tokio::try_join!(self.clone().serve_tcp(tcp), self.serve_ws(ws))?;
            }
            None => self.serve_tcp(tcp).await?,
        }
        Ok(())
    }

    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        info!(addr = %listener.local_addr()?, "TCP listener started");
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let (reader, writer) = transport::tcp(stream, self.settings.max_payload);
                        let node = self.clone();
                        self.tasks.spawn(node.handle_connection(
                            TransportKind::Tcp,
                            remote.to_string(),
                            reader,
                            writer,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn serve_ws(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        info!(addr = %listener.local_addr()?, "WebSocket listener started");
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let node = self.clone();
                        self.tasks.spawn(async move {
                            let upgrade = tokio::time::timeout(
                                node.settings.handshake_timeout,
                                tokio_tungstenite::accept_async(stream),
                            )
                            .await;
                            match upgrade {
                                Ok(Ok(ws)) => {
                                    let (reader, writer) =
                                        transport::websocket(ws, node.settings.max_payload);
                                    node.handle_connection(
                                        TransportKind::WebSocket,
                                        remote.to_string(),
                                        reader,
                                        writer,
                                    )
                                    .await;
                                }
                                Ok(Err(e)) => {
                                    warn!(remote = %remote, error = %e, "WebSocket handshake failed")
                                }
                                Err(_) => warn!(remote = %remote, "WebSocket handshake timed out"),
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drive one accepted connection to completion.
    pub async fn handle_connection(
        self: Arc<Self>,
        transport: TransportKind,
        remote: String,
        mut reader: FrameReader,
        writer: FrameWriter,
    ) {
        let conn_id = self.connections.open(transport, remote.as_str());
        let (outbound, rx) = mpsc::channel(self.settings.outbound_queue);
        let writer_stop = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(
            writer,
            rx,
            writer_stop.clone(),
            self.settings.cancel_grace,
        ));
        debug!(conn_id = %conn_id, remote = %remote, ?transport, "connection accepted");

        let conn = Conn {
            id: conn_id,
            remote,
            outbound,
        };
        let admitted =
            match tokio::time::timeout(self.settings.handshake_timeout, self.admit(&mut reader))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HandshakeError::HandshakeTimeout.into()),
            };

        match admitted {
            Ok(Peer::Server(server)) => self.run_server(&conn, reader, server).await,
            Ok(Peer::Client { client, server }) => {
                self.run_client(&conn, reader, client, server).await
            }
            Err(e) => {
                warn!(conn_id = %conn.id, remote = %conn.remote, error = %e, "handshake failed");
                self.send_close(&conn, "", handshake::close_payload(&e)).await;
                self.connections.close(conn.id);
            }
        }

        drop(conn);
        writer_stop.cancel();
        let _ = writer_task.await;
    }

    async fn admit(&self, reader: &mut FrameReader) -> RelayResult<Peer> {
        let hello = handshake::read_hello(reader, &self.root).await?;
        if !self.is_healthy() {
            return Err(RelayError::Closed {
                reason: CloseReason::ProxyUnhealthy,
                message: close_message(CloseReason::ProxyUnhealthy).into(),
            });
        }
        let peer = handshake::claimed_peer(&hello)?;
        if let AuthDecision::Deny(reason) = self.auth.validate(&hello.id, &hello.credential).await {
            return Err(HandshakeError::AuthDenied(reason).into());
        }

        match &peer {
            Peer::Server(server) => match self.registry.get(server).await? {
                Lookup::Live(assignment) if assignment.proxy_id == self.id => {}
                Lookup::Live(assignment) => {
                    debug!(server_id = %server, owner = %assignment.proxy_id, "server assigned elsewhere");
                    return Err(HandshakeError::NotAssigned(server.to_string()).into());
                }
                _ => return Err(HandshakeError::NotAssigned(server.to_string()).into()),
            },
            Peer::Client { server, .. } => {
                if !self.sessions.contains(server) {
                    return Err(HandshakeError::NotAssigned(server.to_string()).into());
                }
            }
        }
        Ok(peer)
    }

    // ── Server side ────────────────────────────────────────────────────

    async fn run_server(&self, conn: &Conn, mut reader: FrameReader, server: ServerId) {
        let closer = Closer::new(self.root.child_token());
        let slot = Arc::new(ServerSlot::new(
            server.clone(),
            conn.id,
            conn.outbound.clone(),
            closer.clone(),
        ));
        if let Some(previous) = self.sessions.attach_server(slot.clone()) {
            info!(
                server_id = %server,
                old_conn = %previous.conn_id,
                conn_id = %conn.id,
                "server reconnected; superseding previous connection"
            );
            previous.closer.close(CloseReason::Superseded);
        }
        self.established(conn, Role::Server, server.as_str(), self.settings.server_heartbeat_timeout / 3)
            .await;
        info!(conn_id = %conn.id, server_id = %server, remote = %conn.remote, "server registered");

        let mut hooks = HookDispatcher::new(
            self.hooks.clone(),
            closer.token().clone(),
            self.settings.cancel_grace,
        );
        let exit = self.server_loop(conn, &mut reader, &slot, &mut hooks).await;

        let _ = self.connections.transition(conn.id, ConnectionState::Closing);
        closer.close(exit.reason);
        let sessions = slot.close_sessions(cascade(exit.reason)).await;
        self.retire_server(&server, conn.id, hooks).await;
        if let Some(payload) = exit.notify {
            self.send_close(conn, server.as_str(), payload).await;
        }
        self.connections.close(conn.id);
        info!(
            conn_id = %conn.id,
            server_id = %server,
            reason = ?exit.reason,
            sessions,
            "server disconnected"
        );
    }

    async fn server_loop(
        &self,
        conn: &Conn,
        reader: &mut FrameReader,
        slot: &ServerSlot,
        hooks: &mut HookDispatcher,
    ) -> Exit {
        let server = &slot.server_id;
        loop {
            let next = tokio::select! {
                _ = slot.closer.closed() => {
                    return Exit::local(slot.closer.reason().unwrap_or(CloseReason::Shutdown));
                }
                next = tokio::time::timeout(
                    self.settings.server_heartbeat_timeout,
                    reader.next_frame(),
                ) => next,
            };
            let frame = match next {
                Err(_) => return Exit::local(CloseReason::HeartbeatTimeout),
                Ok(None) => return Exit::peer_left(CloseReason::Normal),
                Ok(Some(Err(e))) => return Exit::read_failed(e),
                Ok(Some(Ok(frame))) => frame,
            };

            match self.inspect(conn, server.as_str(), &frame).await {
                Ok(Flow::Relay) => {}
                Ok(Flow::Continue) => continue,
                Ok(Flow::Exit(exit)) => return exit,
                Err(e) => {
                    warn!(conn_id = %conn.id, server_id = %server, error = %e, "closing server connection");
                    return Exit::failed(&e);
                }
            }

            let target = slot.client_outbound(frame.target()).await;
            self.relay(
                conn,
                hooks,
                Direction::ServerToClient,
                server,
                frame,
                target,
                slot.closer.token(),
            )
            .await;
        }
    }

    /// Detach the slot and drain its hooks. The registry assignment and load
    /// are released only if `conn_id` still owned the slot; a connection that
    /// was superseded leaves them to its replacement.
    async fn retire_server(
        &self,
        server: &ServerId,
        conn_id: ConnectionId,
        hooks: HookDispatcher,
    ) -> bool {
        let owned = self.sessions.detach_server(server, conn_id);
        hooks.shutdown().await;
        if owned {
            self.release_server(server).await;
        } else {
            debug!(server_id = %server, conn_id = %conn_id, "superseded; assignment kept");
        }
        owned
    }

    async fn release_server(&self, server: &ServerId) {
        match self.registry.remove_if(server, &self.id).await {
            Ok(true) => debug!(server_id = %server, "assignment removed"),
            Ok(false) => debug!(server_id = %server, "assignment already gone or moved"),
            Err(e) => warn!(server_id = %server, error = %e, "failed to remove assignment"),
        }
        if let Err(e) = self.registry.decrement_load(&self.id).await {
            warn!(error = %e, "failed to decrement load");
        }
    }

    // ── Client side ────────────────────────────────────────────────────

    async fn run_client(
        &self,
        conn: &Conn,
        mut reader: FrameReader,
        client: ClientId,
        server: ServerId,
    ) {
        let not_assigned = || {
            let err = RelayError::from(HandshakeError::NotAssigned(server.to_string()));
            ClosePayload::from_error(&err)
        };
        let Some(slot) = self.sessions.get(&server) else {
            self.send_close(conn, client.as_str(), not_assigned()).await;
            self.connections.close(conn.id);
            return;
        };

        let closer = slot.closer.child();
        let handle = ClientHandle {
            conn_id: conn.id,
            outbound: conn.outbound.clone(),
            closer: closer.clone(),
        };
        match slot.attach_client(client.clone(), handle).await {
            Ok(Some(previous)) => {
                info!(
                    client_id = %client,
                    old_conn = %previous.conn_id,
                    conn_id = %conn.id,
                    "client reconnected; superseding previous session"
                );
                previous.closer.close(CloseReason::Superseded);
            }
            Ok(None) => {}
            Err(AttachError::ServerClosing) => {
                self.send_close(conn, client.as_str(), not_assigned()).await;
                self.connections.close(conn.id);
                return;
            }
        }
        if let Err(e) = self.registry.increment_load(&self.id).await {
            warn!(error = %e, "failed to increment load");
        }
        self.established(conn, Role::Client, client.as_str(), self.settings.session_idle_timeout / 3)
            .await;
        info!(
            conn_id = %conn.id,
            client_id = %client,
            server_id = %server,
            remote = %conn.remote,
            "session active"
        );

        let mut hooks = HookDispatcher::new(
            self.hooks.clone(),
            closer.token().clone(),
            self.settings.cancel_grace,
        );
        let exit = self
            .client_loop(conn, &mut reader, &slot, &client, &closer, &mut hooks)
            .await;

        let _ = self.connections.transition(conn.id, ConnectionState::Closing);
        closer.close(exit.reason);
        slot.detach_client(&client, conn.id).await;
        hooks.shutdown().await;
        if let Err(e) = self.registry.decrement_load(&self.id).await {
            warn!(error = %e, "failed to decrement load");
        }
        if let Some(payload) = exit.notify {
            self.send_close(conn, client.as_str(), payload).await;
        }
        self.connections.close(conn.id);
        info!(
            conn_id = %conn.id,
            client_id = %client,
            server_id = %server,
            reason = ?exit.reason,
            "session closed"
        );
    }

    async fn client_loop(
        &self,
        conn: &Conn,
        reader: &mut FrameReader,
        slot: &ServerSlot,
        client: &ClientId,
        closer: &Closer,
        hooks: &mut HookDispatcher,
    ) -> Exit {
        loop {
            let next = tokio::select! {
                _ = closer.closed() => {
                    let reason = closer
                        .reason()
                        .or_else(|| slot.closer.reason().map(cascade))
                        .unwrap_or(CloseReason::ServerDisconnected);
                    return Exit::local(reason);
                }
                next = tokio::time::timeout(
                    self.settings.session_idle_timeout,
                    reader.next_frame(),
                ) => next,
            };
            let frame = match next {
                Err(_) => return Exit::local(CloseReason::IdleTimeout),
                Ok(None) => return Exit::peer_left(CloseReason::Normal),
                Ok(Some(Err(e))) => return Exit::read_failed(e),
                Ok(Some(Ok(frame))) => frame,
            };

            match self.inspect(conn, client.as_str(), &frame).await {
                Ok(Flow::Relay) => {}
                Ok(Flow::Continue) => continue,
                Ok(Flow::Exit(exit)) => return exit,
                Err(e) => {
                    warn!(conn_id = %conn.id, client_id = %client, error = %e, "closing session");
                    return Exit::failed(&e);
                }
            }

            let target = (frame.target() == slot.server_id.as_str()).then(|| slot.outbound.clone());
            self.relay(
                conn,
                hooks,
                Direction::ClientToServer,
                &slot.server_id,
                frame,
                target,
                closer.token(),
            )
            .await;
        }
    }

    // ── Shared ─────────────────────────────────────────────────────────

    async fn established(&self, conn: &Conn, role: Role, peer: &str, ping_interval: Duration) {
        if let Err(e) = self.connections.establish(conn.id, role, peer) {
            warn!(conn_id = %conn.id, error = %e, "connection state");
        }
        match handshake::hello_ok(&self.id, conn.id, peer, ping_interval) {
            Ok(frame) => {
                let _ = conn.outbound.send(frame).await;
            }
            Err(e) => warn!(conn_id = %conn.id, error = %e, "failed to encode HelloOk"),
        }
    }

    /// Sender check and control frames. Errors are terminal for the connection.
    async fn inspect(&self, conn: &Conn, peer: &str, frame: &Frame) -> RelayResult<Flow> {
        if frame.sender() != peer {
            return Err(ProtocolError::SenderMismatch {
                expected: peer.to_string(),
                actual: frame.sender().to_string(),
            }
            .into());
        }
        match Control::from_frame(frame)? {
            None => Ok(Flow::Relay),
            Some(Control::Ping(ping)) => {
                self.send_control(conn, peer, &Control::Pong(ping)).await;
                Ok(Flow::Continue)
            }
            Some(Control::Pong(_)) => Ok(Flow::Continue),
            Some(Control::Close(close)) => {
                debug!(conn_id = %conn.id, reason = ?close.reason, message = %close.message, "peer closed");
                Ok(Flow::Exit(Exit::peer_left(close.reason)))
            }
            Some(Control::Error(report)) => {
                debug!(conn_id = %conn.id, error = %report.error, "peer reported error");
                Ok(Flow::Continue)
            }
            Some(other) => Err(HandshakeError::UnexpectedMessage(format!(
                "{:?} after handshake",
                other.kind()
            ))
            .into()),
        }
    }

    /// Forward a frame to its bound target and run matching hooks around it.
    #[allow(clippy::too_many_arguments)]
    async fn relay(
        &self,
        conn: &Conn,
        hooks: &mut HookDispatcher,
        direction: Direction,
        server: &ServerId,
        frame: Frame,
        target: Option<mpsc::Sender<Bytes>>,
        cancel: &CancellationToken,
    ) {
        let plan = hooks.resolve(frame.message_type());
        if target.is_none() && plan.is_empty() {
            let err = RelayError::from(RoutingError::UnknownTarget(frame.target().to_string()));
            warn!(
                conn_id = %conn.id,
                sender = %frame.sender(),
                target = %frame.target(),
                message_type = %frame.message_type(),
                error = %err,
                "dropping frame"
            );
            let report = Control::Error(ErrorPayload {
                error: WireError::from(&err),
                message: err.to_string(),
            });
            self.send_control(conn, frame.sender(), &report).await;
            return;
        }

        let ctx = (!plan.is_empty()).then(|| {
            Arc::new(HookContext {
                proxy_id: self.id.clone(),
                connection_id: conn.id,
                direction,
                server_id: server.clone(),
                delivered: target.is_some(),
                frame: frame.clone(),
            })
        });
        if let Some(ctx) = &ctx {
            hooks.run_before(&plan, ctx).await;
        }

        if let Some(tx) = target {
            tokio::select! {
                sent = tx.send(frame.raw().clone()) => {
                    if sent.is_err() {
                        debug!(conn_id = %conn.id, target = %frame.target(), "target left before delivery");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        }

        if let Some(ctx) = ctx {
            hooks.spawn_after(&plan, ctx);
        }
    }

    async fn send_control(&self, conn: &Conn, target: &str, control: &Control) {
        match control.encode(self.id.as_str(), target) {
            Ok(frame) => {
                if conn.outbound.send(frame).await.is_err() {
                    debug!(conn_id = %conn.id, "connection writer gone");
                }
            }
            Err(e) => warn!(conn_id = %conn.id, error = %e, "failed to encode control frame"),
        }
    }

    async fn send_close(&self, conn: &Conn, target: &str, payload: ClosePayload) {
        self.send_control(conn, target, &Control::Close(payload)).await;
    }
}

/// Drain a connection's outbound queue into its transport. Once `stop` fires,
/// frames already queued are still written, each bounded by `grace`.
async fn write_loop(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
    grace: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = stop.cancelled() => None,
        };
        let Some(frame) = frame else { break };

        let sent = if stop.is_cancelled() {
            match tokio::time::timeout(grace, writer.send_frame(frame)).await {
                Ok(sent) => sent,
                Err(_) => Err(RelayError::Transport("write timed out".into())),
            }
        } else {
            writer.send_frame(frame).await
        };
        if let Err(e) = sent {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
    let _ = tokio::time::timeout(grace, writer.close()).await;
}
