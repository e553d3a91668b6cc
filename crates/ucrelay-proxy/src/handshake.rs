//! Proxy side of the `Hello` handshake.

use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use ucrelay_core::control::{ClosePayload, HelloOkPayload, HelloPayload};
use ucrelay_core::{
    ClientId, CloseReason, ConnectionId, Control, FrameReader, HandshakeError, ProtocolError,
    ProxyId, RelayError, RelayResult, Role, ServerId, PROTOCOL_VERSION,
};

/// Identity a connection authenticated as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Server(ServerId),
    Client { client: ClientId, server: ServerId },
}

impl Peer {
    pub fn role(&self) -> Role {
        match self {
            Peer::Server(_) => Role::Server,
            Peer::Client { .. } => Role::Client,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Peer::Server(server) => server.as_str(),
            Peer::Client { client, .. } => client.as_str(),
        }
    }
}

/// Wait for the first frame and require it to be a well-formed `Hello`.
pub async fn read_hello(
    reader: &mut FrameReader,
    shutdown: &CancellationToken,
) -> RelayResult<HelloPayload> {
    let next = tokio::select! {
        _ = shutdown.cancelled() => {
            return Err(RelayError::Closed {
                reason: CloseReason::Shutdown,
                message: "proxy shutting down".into(),
            });
        }
        next = reader.next_frame() => next,
    };
    let frame = match next {
        Some(frame) => frame?,
        None => {
            return Err(RelayError::Transport(
                "connection closed during handshake".into(),
            ))
        }
    };

    let hello = match Control::from_frame(&frame)? {
        Some(Control::Hello(hello)) => hello,
        Some(other) => {
            return Err(HandshakeError::UnexpectedMessage(format!("{:?}", other.kind())).into())
        }
        None => {
            return Err(HandshakeError::UnexpectedMessage(format!(
                "application frame {}",
                frame.message_type()
            ))
            .into())
        }
    };

    if hello.version != PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(hello.version).into());
    }
    if frame.sender() != hello.id {
        return Err(ProtocolError::SenderMismatch {
            expected: hello.id,
            actual: frame.sender().to_string(),
        }
        .into());
    }
    Ok(hello)
}

/// Validate the ids a `Hello` claims.
pub fn claimed_peer(hello: &HelloPayload) -> RelayResult<Peer> {
    match hello.role {
        Role::Server => Ok(Peer::Server(ServerId::new(hello.id.as_str())?)),
        Role::Client => {
            let server = hello.server_id.as_deref().ok_or_else(|| {
                HandshakeError::UnexpectedMessage("client hello without server_id".into())
            })?;
            Ok(Peer::Client {
                client: ClientId::new(hello.id.as_str())?,
                server: ServerId::new(server)?,
            })
        }
    }
}

pub fn hello_ok(
    proxy: &ProxyId,
    conn: ConnectionId,
    peer: &str,
    heartbeat_interval: Duration,
) -> RelayResult<Bytes> {
    Control::HelloOk(HelloOkPayload {
        proxy_id: proxy.to_string(),
        connection_id: conn.0,
        heartbeat_interval_ms: u64::try_from(heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
    })
    .encode(proxy.as_str(), peer)
}

/// Terminal frame payload for a failed handshake or relay.
pub fn close_payload(err: &RelayError) -> ClosePayload {
    match err {
        RelayError::Closed { reason, message } => ClosePayload::new(*reason, message.clone()),
        other => ClosePayload::from_error(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use ucrelay_core::transport::{self, FrameWriter};
    use ucrelay_core::{Envelope, DEFAULT_MAX_PAYLOAD};

    async fn pipe() -> (FrameReader, FrameWriter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (reader, _w) = transport::tcp(server, DEFAULT_MAX_PAYLOAD);
        let (_r, writer) = transport::tcp(client, DEFAULT_MAX_PAYLOAD);
        (reader, writer)
    }

    fn hello(role: Role, id: &str, server_id: Option<&str>) -> HelloPayload {
        HelloPayload {
            version: PROTOCOL_VERSION,
            role,
            id: id.into(),
            credential: String::new(),
            server_id: server_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn accepts_hello() {
        let (mut reader, mut writer) = pipe().await;
        let h = hello(Role::Client, "phone-1", Some("srv-a"));
        writer
            .send_frame(Control::Hello(h.clone()).encode("phone-1", "").unwrap())
            .await
            .unwrap();
        let got = read_hello(&mut reader, &CancellationToken::new()).await.unwrap();
        assert_eq!(got, h);
        assert_eq!(
            claimed_peer(&got).unwrap(),
            Peer::Client {
                client: ClientId::new("phone-1").unwrap(),
                server: ServerId::new("srv-a").unwrap(),
            }
        );
    }

    #[tokio::test]
    async fn rejects_application_first_frame() {
        let (mut reader, mut writer) = pipe().await;
        let frame = Envelope::new("phone-1", "srv-a", 5u16, &b"ping"[..]).encode().unwrap();
        writer.send_frame(frame).await.unwrap();
        let err = read_hello(&mut reader, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Handshake(HandshakeError::UnexpectedMessage(_))
        ));
    }

    #[tokio::test]
    async fn rejects_spoofed_sender_and_bad_version() {
        let (mut reader, mut writer) = pipe().await;
        let h = hello(Role::Server, "srv-a", None);
        writer
            .send_frame(Control::Hello(h).encode("srv-b", "").unwrap())
            .await
            .unwrap();
        let err = read_hello(&mut reader, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::SenderMismatch { .. })
        ));

        let (mut reader, mut writer) = pipe().await;
        let mut h = hello(Role::Server, "srv-a", None);
        h.version = 99;
        writer
            .send_frame(Control::Hello(h).encode("srv-a", "").unwrap())
            .await
            .unwrap();
        let err = read_hello(&mut reader, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Handshake(HandshakeError::UnsupportedVersion(99))
        ));
    }

    #[tokio::test]
    async fn shutdown_interrupts_wait() {
        let (mut reader, _writer) = pipe().await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = read_hello(&mut reader, &shutdown).await.unwrap_err();
        assert_eq!(close_payload(&err).reason, CloseReason::Shutdown);
    }

    #[test]
    fn client_hello_needs_server_id() {
        assert!(claimed_peer(&hello(Role::Client, "phone-1", None)).is_err());
        assert!(claimed_peer(&hello(Role::Server, "", None)).is_err());
        assert_eq!(
            claimed_peer(&hello(Role::Server, "srv-a", None)).unwrap().role(),
            Role::Server
        );
    }
}
