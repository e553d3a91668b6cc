//! Proxy control frames (message types `0xFF00..`), CBOR-encoded payloads.

use crate::codec::{cbor_decode, cbor_encode};
use crate::envelope::{ControlKind, Envelope, Frame};
use crate::error::{ErrorCode, ProtocolError, RelayError, RelayResult, WireError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Protocol version carried in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Which side of the relay a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// First frame on every proxy connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: u16,
    pub role: Role,
    pub id: String,
    pub credential: String,
    /// Server a client wants to be bound to. Absent for servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Handshake accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloOkPayload {
    pub proxy_id: String,
    pub connection_id: u64,
    /// How often the peer should ping to stay alive.
    pub heartbeat_interval_ms: u64,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    Shutdown,
    ServerDisconnected,
    IdleTimeout,
    HeartbeatTimeout,
    ProxyUnhealthy,
    Superseded,
    NoLongerAssigned,
    Failed(ErrorCode),
}

/// Terminal frame: the sender closes the connection right after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePayload {
    pub reason: CloseReason,
    #[serde(default)]
    pub message: String,
    /// Typed error detail when `reason` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ClosePayload {
    pub fn new(reason: CloseReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            error: None,
        }
    }

    pub fn from_error(err: &RelayError) -> Self {
        let wire = WireError::from(err);
        Self {
            reason: CloseReason::Failed(wire.code),
            message: err.to_string(),
            error: Some(wire),
        }
    }

    /// Error the receiving side should surface.
    pub fn into_error(self) -> RelayError {
        match self.error {
            Some(wire) => wire.into_error(),
            None => RelayError::Closed {
                reason: self.reason,
                message: self.message,
            },
        }
    }
}

/// Non-terminal failure report (e.g. a frame dropped for an unknown target).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: WireError,
    pub message: String,
}

/// Keepalive probe / reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub id: u64,
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Hello(HelloPayload),
    HelloOk(HelloOkPayload),
    Close(ClosePayload),
    Error(ErrorPayload),
    Ping(PingPayload),
    Pong(PingPayload),
}

impl Control {
    pub fn kind(&self) -> ControlKind {
        match self {
            Control::Hello(_) => ControlKind::Hello,
            Control::HelloOk(_) => ControlKind::HelloOk,
            Control::Close(_) => ControlKind::Close,
            Control::Error(_) => ControlKind::Error,
            Control::Ping(_) => ControlKind::Ping,
            Control::Pong(_) => ControlKind::Pong,
        }
    }

    /// Decode the control payload of `frame`. `Ok(None)` for application frames.
    pub fn from_frame(frame: &Frame) -> RelayResult<Option<Control>> {
        let kind = match frame.message_type().control_kind()? {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let payload = frame.payload();
        let control = match kind {
            ControlKind::Hello => Control::Hello(decode_payload(&payload)?),
            ControlKind::HelloOk => Control::HelloOk(decode_payload(&payload)?),
            ControlKind::Close => Control::Close(decode_payload(&payload)?),
            ControlKind::Error => Control::Error(decode_payload(&payload)?),
            ControlKind::Ping => Control::Ping(decode_payload(&payload)?),
            ControlKind::Pong => Control::Pong(decode_payload(&payload)?),
        };
        Ok(Some(control))
    }

    /// Build the envelope for this control frame.
    pub fn to_envelope(&self, sender: &str, target: &str) -> RelayResult<Envelope> {
        let payload = match self {
            Control::Hello(p) => cbor_encode(p)?,
            Control::HelloOk(p) => cbor_encode(p)?,
            Control::Close(p) => cbor_encode(p)?,
            Control::Error(p) => cbor_encode(p)?,
            Control::Ping(p) | Control::Pong(p) => cbor_encode(p)?,
        };
        Ok(Envelope::new(
            sender,
            target,
            self.kind().message_type(),
            Bytes::from(payload),
        ))
    }

    /// Encode straight to frame bytes.
    pub fn encode(&self, sender: &str, target: &str) -> RelayResult<Bytes> {
        Ok(self.to_envelope(sender, target)?.encode()?)
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> RelayResult<T> {
    cbor_decode(payload).map_err(|e| ProtocolError::InvalidControlPayload(e.to_string()).into())
}
