use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures to place or locate a server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unknown server: {0}")]
    UnknownServer(String),

    #[error("server offline: {0}")]
    ServerOffline(String),

    #[error("no healthy proxy available")]
    NoHealthyProxy,

    #[error("server {server} is already registered on proxy {proxy}")]
    AlreadyRegisteredElsewhere { server: String, proxy: String },
}

/// Failures while a connection is still in `CONNECTING`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("authentication denied: {0}")]
    AuthDenied(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("server {0} is not assigned to this proxy")]
    NotAssigned(String),

    #[error("unexpected message during handshake: {0}")]
    UnexpectedMessage(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
}

/// Wire-level violations. Terminal for the offending connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope header: {0}")]
    MalformedHeader(String),

    #[error("unsupported message type: 0x{0:04x}")]
    UnsupportedMessageType(u16),

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: u64, max: u32 },

    #[error("sender mismatch: connection is {expected}, frame claims {actual}")]
    SenderMismatch { expected: String, actual: String },

    #[error("invalid control payload: {0}")]
    InvalidControlPayload(String),
}

/// A frame could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
}

/// Shared infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfraError {
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

/// Top-level error for every ucrelay crate.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("connection closed: {reason:?} ({message})")]
    Closed {
        reason: crate::control::CloseReason,
        message: String,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Stable, serializable error code carried in RPC responses and `Close` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownServer,
    ServerOffline,
    NoHealthyProxy,
    AlreadyRegisteredElsewhere,
    AuthDenied,
    HandshakeTimeout,
    NotAssigned,
    UnexpectedMessage,
    UnsupportedVersion,
    MalformedHeader,
    UnsupportedMessageType,
    PayloadTooLarge,
    SenderMismatch,
    InvalidControlPayload,
    UnknownTarget,
    RegistryUnavailable,
    Timeout,
    InvalidId,
    Internal,
}

impl RelayError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Resolution(e) => match e {
                ResolutionError::UnknownServer(_) => ErrorCode::UnknownServer,
                ResolutionError::ServerOffline(_) => ErrorCode::ServerOffline,
                ResolutionError::NoHealthyProxy => ErrorCode::NoHealthyProxy,
                ResolutionError::AlreadyRegisteredElsewhere { .. } => {
                    ErrorCode::AlreadyRegisteredElsewhere
                }
            },
            RelayError::Handshake(e) => match e {
                HandshakeError::AuthDenied(_) => ErrorCode::AuthDenied,
                HandshakeError::HandshakeTimeout => ErrorCode::HandshakeTimeout,
                HandshakeError::NotAssigned(_) => ErrorCode::NotAssigned,
                HandshakeError::UnexpectedMessage(_) => ErrorCode::UnexpectedMessage,
                HandshakeError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            },
            RelayError::Protocol(e) => match e {
                ProtocolError::MalformedHeader(_) => ErrorCode::MalformedHeader,
                ProtocolError::UnsupportedMessageType(_) => ErrorCode::UnsupportedMessageType,
                ProtocolError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
                ProtocolError::SenderMismatch { .. } => ErrorCode::SenderMismatch,
                ProtocolError::InvalidControlPayload(_) => ErrorCode::InvalidControlPayload,
            },
            RelayError::Routing(RoutingError::UnknownTarget(_)) => ErrorCode::UnknownTarget,
            RelayError::Infra(e) => match e {
                InfraError::RegistryUnavailable(_) => ErrorCode::RegistryUnavailable,
                InfraError::Timeout(_) => ErrorCode::Timeout,
            },
            RelayError::InvalidId(_) => ErrorCode::InvalidId,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild a typed error from a code received over the wire.
    ///
    /// `subject` is the identifier the failure is about (server id, target,
    /// ...); `detail` is the variant-specific text produced by [`WireError`].
    pub fn from_wire(code: ErrorCode, subject: &str, detail: &str) -> Self {
        let subject = subject.to_string();
        let detail = detail.to_string();
        match code {
            ErrorCode::UnknownServer => ResolutionError::UnknownServer(subject).into(),
            ErrorCode::ServerOffline => ResolutionError::ServerOffline(subject).into(),
            ErrorCode::NoHealthyProxy => ResolutionError::NoHealthyProxy.into(),
            ErrorCode::AlreadyRegisteredElsewhere => ResolutionError::AlreadyRegisteredElsewhere {
                server: subject,
                proxy: detail,
            }
            .into(),
            ErrorCode::AuthDenied => HandshakeError::AuthDenied(detail).into(),
            ErrorCode::HandshakeTimeout => HandshakeError::HandshakeTimeout.into(),
            ErrorCode::NotAssigned => HandshakeError::NotAssigned(subject).into(),
            ErrorCode::UnexpectedMessage => HandshakeError::UnexpectedMessage(detail).into(),
            ErrorCode::UnsupportedVersion => {
                HandshakeError::UnsupportedVersion(detail.parse().unwrap_or_default()).into()
            }
            ErrorCode::MalformedHeader => ProtocolError::MalformedHeader(detail).into(),
            ErrorCode::UnsupportedMessageType => {
                ProtocolError::UnsupportedMessageType(detail.parse().unwrap_or_default()).into()
            }
            ErrorCode::PayloadTooLarge => {
                let (len, max) = detail.split_once('/').unwrap_or(("0", "0"));
                ProtocolError::PayloadTooLarge {
                    len: len.parse().unwrap_or_default(),
                    max: max.parse().unwrap_or_default(),
                }
                .into()
            }
            ErrorCode::SenderMismatch => ProtocolError::SenderMismatch {
                expected: subject,
                actual: detail,
            }
            .into(),
            ErrorCode::InvalidControlPayload => ProtocolError::InvalidControlPayload(detail).into(),
            ErrorCode::UnknownTarget => RoutingError::UnknownTarget(subject).into(),
            ErrorCode::RegistryUnavailable => InfraError::RegistryUnavailable(detail).into(),
            ErrorCode::Timeout => InfraError::Timeout(detail).into(),
            ErrorCode::InvalidId => RelayError::InvalidId(subject),
            ErrorCode::Internal => RelayError::Other(detail),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Infra(_) | RelayError::Io(_) | RelayError::Transport(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RelayError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transport(format!("websocket: {e}"))
    }
}

/// Serializable form of a [`RelayError`]: code plus the fields needed to
/// rebuild the typed variant on the other side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub detail: String,
}

impl From<&RelayError> for WireError {
    fn from(err: &RelayError) -> Self {
        let (subject, detail) = match err {
            RelayError::Resolution(ResolutionError::UnknownServer(s))
            | RelayError::Resolution(ResolutionError::ServerOffline(s)) => (s.clone(), String::new()),
            RelayError::Resolution(ResolutionError::AlreadyRegisteredElsewhere { server, proxy }) => {
                (server.clone(), proxy.clone())
            }
            RelayError::Handshake(HandshakeError::AuthDenied(reason)) => {
                (String::new(), reason.clone())
            }
            RelayError::Handshake(HandshakeError::NotAssigned(s)) => (s.clone(), String::new()),
            RelayError::Handshake(HandshakeError::UnexpectedMessage(m)) => (String::new(), m.clone()),
            RelayError::Handshake(HandshakeError::UnsupportedVersion(v)) => {
                (String::new(), v.to_string())
            }
            RelayError::Protocol(ProtocolError::MalformedHeader(m))
            | RelayError::Protocol(ProtocolError::InvalidControlPayload(m)) => {
                (String::new(), m.clone())
            }
            RelayError::Protocol(ProtocolError::UnsupportedMessageType(t)) => {
                (String::new(), t.to_string())
            }
            RelayError::Protocol(ProtocolError::PayloadTooLarge { len, max }) => {
                (String::new(), format!("{len}/{max}"))
            }
            RelayError::Protocol(ProtocolError::SenderMismatch { expected, actual }) => {
                (expected.clone(), actual.clone())
            }
            RelayError::Routing(RoutingError::UnknownTarget(t)) => (t.clone(), String::new()),
            RelayError::Infra(InfraError::RegistryUnavailable(m))
            | RelayError::Infra(InfraError::Timeout(m)) => (String::new(), m.clone()),
            RelayError::InvalidId(s) => (s.clone(), String::new()),
            other => (String::new(), other.to_string()),
        };
        Self {
            code: err.code(),
            subject,
            detail,
        }
    }
}

impl WireError {
    /// Convert back into a typed error.
    pub fn into_error(self) -> RelayError {
        RelayError::from_wire(self.code, &self.subject, &self.detail)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.code)?;
        if !self.subject.is_empty() {
            write!(f, " [{}]", self.subject)?;
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
