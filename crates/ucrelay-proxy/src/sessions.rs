//! In-process session table.
//!
//! One [`ServerSlot`] per connected server, each holding its own lock over
//! the client sessions bound to it. Relay loops for different servers never
//! touch the same lock; the outer map is sharded.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use ucrelay_core::{ClientId, CloseReason, ConnectionId, ServerId};

/// Cancellation plus the reason it happened. The first reason wins.
#[derive(Debug, Clone)]
pub struct Closer {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl Closer {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// A closer cancelled whenever this one is.
    pub fn child(&self) -> Self {
        Self::new(self.token.child_token())
    }

    pub fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Reason given to [`close`](Self::close); `None` if cancelled through a parent.
    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// A client bound to a server on this proxy.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: ConnectionId,
    pub outbound: mpsc::Sender<Bytes>,
    pub closer: Closer,
}

#[derive(Debug)]
pub enum AttachError {
    /// The server connection is going away.
    ServerClosing,
}

/// A connected server and its sessions.
#[derive(Debug)]
pub struct ServerSlot {
    pub server_id: ServerId,
    pub conn_id: ConnectionId,
    pub outbound: mpsc::Sender<Bytes>,
    pub closer: Closer,
    sessions: Mutex<HashMap<ClientId, ClientHandle>>,
    session_count: AtomicUsize,
}

impl ServerSlot {
    pub fn new(
        server_id: ServerId,
        conn_id: ConnectionId,
        outbound: mpsc::Sender<Bytes>,
        closer: Closer,
    ) -> Self {
        Self {
            server_id,
            conn_id,
            outbound,
            closer,
            sessions: Mutex::new(HashMap::new()),
            session_count: AtomicUsize::new(0),
        }
    }

    /// Bind a client. A previous session of the same client is returned so
    /// the caller can supersede it.
    pub async fn attach_client(
        &self,
        client: ClientId,
        handle: ClientHandle,
    ) -> Result<Option<ClientHandle>, AttachError> {
        let mut sessions = self.sessions.lock().await;
        if self.closer.is_closed() {
            return Err(AttachError::ServerClosing);
        }
        let previous = sessions.insert(client, handle);
        if previous.is_none() {
            self.session_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(previous)
    }

    /// Unbind a client, but only if the session still belongs to `conn_id`.
    pub async fn detach_client(&self, client: &ClientId, conn_id: ConnectionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(client) {
            Some(handle) if handle.conn_id == conn_id => {
                sessions.remove(client);
                self.session_count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Outbound queue of a bound client.
    pub async fn client_outbound(&self, client: &str) -> Option<mpsc::Sender<Bytes>> {
        let sessions = self.sessions.lock().await;
        sessions.get(client).map(|h| h.outbound.clone())
    }

    /// Close every bound session with `reason`. Returns how many were closed.
    pub async fn close_sessions(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions.lock().await;
        for handle in sessions.values() {
            handle.closer.close(reason);
        }
        sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }
}

/// `serverId → ServerSlot` for one proxy.
#[derive(Default)]
pub struct SessionTable {
    servers: DashMap<ServerId, Arc<ServerSlot>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a server. Returns the slot it replaced, if any.
    pub fn attach_server(&self, slot: Arc<ServerSlot>) -> Option<Arc<ServerSlot>> {
        self.servers.insert(slot.server_id.clone(), slot)
    }

    /// Remove a server, but only if the slot still belongs to `conn_id`.
    pub fn detach_server(&self, server: &ServerId, conn_id: ConnectionId) -> bool {
        self.servers
            .remove_if(server, |_, slot| slot.conn_id == conn_id)
            .is_some()
    }

    pub fn get(&self, server: &ServerId) -> Option<Arc<ServerSlot>> {
        self.servers.get(server).map(|s| s.clone())
    }

    pub fn contains(&self, server: &ServerId) -> bool {
        self.servers.contains_key(server)
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn slots(&self) -> Vec<Arc<ServerSlot>> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn session_count(&self) -> usize {
        self.servers.iter().map(|e| e.value().session_count()).sum()
    }

    /// Registrations plus sessions: the load this proxy reports.
    pub fn load(&self) -> u64 {
        (self.server_count() + self.session_count()) as u64
    }
}
