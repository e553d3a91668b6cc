//! Connection lifecycle.
//!
//! ```text
//! CONNECTING ──► REGISTERED ─────┐
//!     │      └─► SESSION_ACTIVE ─┴─► CLOSING ──► CLOSED
//!     └────────────────────────────────────────────▲
//! ```
//!
//! Every accepted connection gets a [`ConnectionFsm`] in the proxy's
//! [`ConnectionTable`], addressed by [`ConnectionId`].

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use ucrelay_core::{ConnectionId, Role, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    /// Server connection past its handshake.
    Registered,
    /// Client connection bound to a server.
    SessionActive,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Registered => "REGISTERED",
            ConnectionState::SessionActive => "SESSION_ACTIVE",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

#[derive(Debug, Clone)]
pub struct ConnectionFsm {
    state: ConnectionState,
    entered_at: Instant,
}

impl Default for ConnectionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFsm {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the current state was entered.
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn can_transition(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self.state, to),
            (Connecting, Registered)
                | (Connecting, SessionActive)
                | (Connecting, Closed)
                | (Registered, Closing)
                | (SessionActive, Closing)
                | (Closing, Closed)
        )
    }

    pub fn transition(&mut self, to: ConnectionState) -> Result<(), IllegalTransition> {
        if !self.can_transition(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.entered_at = Instant::now();
        Ok(())
    }
}

/// One row of the connection table.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub fsm: ConnectionFsm,
    pub transport: TransportKind,
    pub remote: String,
    /// Set once the handshake succeeds.
    pub role: Option<Role>,
    pub peer_id: Option<String>,
}

/// Snapshot counts for status logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub connecting: usize,
    pub registered: usize,
    pub sessions: usize,
    pub closing: usize,
}

/// All live connections of one proxy.
pub struct ConnectionTable {
    entries: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicU64,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a freshly accepted connection in `CONNECTING`.
    pub fn open(&self, transport: TransportKind, remote: impl Into<String>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.insert(
            id,
            ConnectionEntry {
                fsm: ConnectionFsm::new(),
                transport,
                remote: remote.into(),
                role: None,
                peer_id: None,
            },
        );
        id
    }

    /// Record the authenticated identity and move to the post-handshake state.
    pub fn establish(&self, id: ConnectionId, role: Role, peer_id: &str) -> Result<(), IllegalTransition> {
        let to = match role {
            Role::Server => ConnectionState::Registered,
            Role::Client => ConnectionState::SessionActive,
        };
        let mut entry = self.entries.get_mut(&id).ok_or(IllegalTransition {
            from: ConnectionState::Closed,
            to,
        })?;
        entry.fsm.transition(to)?;
        entry.role = Some(role);
        entry.peer_id = Some(peer_id.to_string());
        Ok(())
    }

    pub fn transition(&self, id: ConnectionId, to: ConnectionState) -> Result<(), IllegalTransition> {
        let mut entry = self.entries.get_mut(&id).ok_or(IllegalTransition {
            from: ConnectionState::Closed,
            to,
        })?;
        let from = entry.fsm.state();
        entry.fsm.transition(to)?;
        debug!(conn_id = %id, %from, %to, "connection state");
        Ok(())
    }

    /// Move to `CLOSED` (through `CLOSING` when established) and drop the row.
    pub fn close(&self, id: ConnectionId) {
        if let Some((_, mut entry)) = self.entries.remove(&id) {
            if entry.fsm.can_transition(ConnectionState::Closing) {
                let _ = entry.fsm.transition(ConnectionState::Closing);
            }
            let _ = entry.fsm.transition(ConnectionState::Closed);
            debug!(conn_id = %id, "connection closed");
        }
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.entries.get(&id).map(|e| e.fsm.state())
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();
        for entry in self.entries.iter() {
            match entry.fsm.state() {
                ConnectionState::Connecting => counts.connecting += 1,
                ConnectionState::Registered => counts.registered += 1,
                ConnectionState::SessionActive => counts.sessions += 1,
                ConnectionState::Closing => counts.closing += 1,
                ConnectionState::Closed => {}
            }
        }
        counts
    }
}
