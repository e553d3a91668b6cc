//! Frame transports between endpoints and proxies.
//!
//! Two encodings of the same envelope stream:
//! - `tcp://host:port`: envelopes back to back on a raw TCP byte stream.
//! - `ws://host:port[/path]`: one envelope per binary WebSocket message.
//!
//! Both are exposed as a split [`FrameReader`] / [`FrameWriter`] pair so the
//! relay loops never care which one they are driving.

use crate::codec::EnvelopeCodec;
use crate::envelope::Frame;
use crate::error::{RelayError, RelayResult};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Transport kind, inferred from the endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// A parsed proxy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: TransportKind,
    /// `host:port`
    pub authority: String,
    /// Original URL (used verbatim for WebSocket connects).
    pub url: String,
}

impl Endpoint {
    /// Parse `tcp://host:port`, `ws://host:port/path`, or a bare `host:port`
    /// (treated as TCP).
    pub fn parse(url: &str) -> RelayResult<Self> {
        let lower = url.to_ascii_lowercase();
        let (kind, rest) = if lower.starts_with("tcp://") {
            (TransportKind::Tcp, &url[6..])
        } else if lower.starts_with("ws://") {
            (TransportKind::WebSocket, &url[5..])
        } else if lower.contains("://") {
            return Err(RelayError::Transport(format!(
                "unsupported URL scheme: {url} (expected tcp:// or ws://)"
            )));
        } else {
            (TransportKind::Tcp, url)
        };

        let authority = rest.split('/').next().unwrap_or(rest);
        if authority.is_empty() || !authority.contains(':') {
            return Err(RelayError::Transport(format!(
                "address must include host and port: {url}"
            )));
        }

        let url = match kind {
            TransportKind::Tcp => format!("tcp://{authority}"),
            TransportKind::WebSocket => format!("ws://{rest}"),
        };

        Ok(Self {
            kind,
            authority: authority.to_string(),
            url,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

type BoxFrameStream = Pin<Box<dyn Stream<Item = RelayResult<Frame>> + Send>>;
type BoxFrameSink = Pin<Box<dyn Sink<Bytes, Error = RelayError> + Send>>;

/// Receiving half of a connection.
pub struct FrameReader {
    inner: BoxFrameStream,
}

impl FrameReader {
    /// Next complete frame, `None` on clean end of stream.
    pub async fn next_frame(&mut self) -> Option<RelayResult<Frame>> {
        self.inner.next().await
    }
}

/// Sending half of a connection.
pub struct FrameWriter {
    inner: BoxFrameSink,
}

impl FrameWriter {
    /// Write one already-encoded frame.
    pub async fn send_frame(&mut self, frame: Bytes) -> RelayResult<()> {
        self.inner.send(frame).await
    }

    /// Flush and close the write side.
    pub async fn close(&mut self) -> RelayResult<()> {
        self.inner.close().await
    }
}

/// Wrap a TCP stream.
pub fn tcp(stream: TcpStream, max_payload: u32) -> (FrameReader, FrameWriter) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let reader = FramedRead::new(read, EnvelopeCodec::new(max_payload));
    let writer = FramedWrite::new(write, EnvelopeCodec::new(max_payload));
    (
        FrameReader {
            inner: Box::pin(reader),
        },
        FrameWriter {
            inner: Box::pin(writer),
        },
    )
}

/// Wrap an established WebSocket (client or server side).
pub fn websocket<S>(ws: WebSocketStream<S>, max_payload: u32) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let reader = futures_util::stream::unfold(stream, move |mut stream| async move {
        loop {
            match stream.next().await? {
                Ok(Message::Binary(data)) => {
                    let frame = Frame::parse_exact(Bytes::from(data), max_payload)
                        .map_err(RelayError::from);
                    return Some((frame, stream));
                }
                Ok(Message::Close(_)) => return None,
                // Pings are answered by tungstenite; text is not part of the protocol.
                Ok(_) => continue,
                Err(e) => return Some((Err(RelayError::from(e)), stream)),
            }
        }
    });

    let writer = sink.with(|frame: Bytes| {
        futures_util::future::ready(Ok::<_, RelayError>(Message::Binary(frame.to_vec().into())))
    });

    (
        FrameReader {
            inner: Box::pin(reader),
        },
        FrameWriter {
            inner: Box::pin(writer),
        },
    )
}

/// Connect to a proxy endpoint.
pub async fn connect(endpoint: &Endpoint, max_payload: u32) -> RelayResult<(FrameReader, FrameWriter)> {
    match endpoint.kind {
        TransportKind::Tcp => {
            let stream = TcpStream::connect(&endpoint.authority)
                .await
                .map_err(|e| RelayError::Transport(format!("connect {}: {e}", endpoint.authority)))?;
            Ok(tcp(stream, max_payload))
        }
        TransportKind::WebSocket => {
            let (ws, _response) = tokio_tungstenite::connect_async(endpoint.url.as_str()).await?;
            Ok(websocket(ws, max_payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, DEFAULT_MAX_PAYLOAD};
    use tokio::net::TcpListener;

    #[test]
    fn parse_endpoints() {
        let tcp = Endpoint::parse("tcp://10.0.0.1:7100").unwrap();
        assert_eq!(tcp.kind, TransportKind::Tcp);
        assert_eq!(tcp.authority, "10.0.0.1:7100");

        let bare = Endpoint::parse("localhost:7100").unwrap();
        assert_eq!(bare.kind, TransportKind::Tcp);
        assert_eq!(bare.url, "tcp://localhost:7100");

        let ws = Endpoint::parse("ws://proxy.example:7101/relay").unwrap();
        assert_eq!(ws.kind, TransportKind::WebSocket);
        assert_eq!(ws.authority, "proxy.example:7101");
        assert_eq!(ws.url, "ws://proxy.example:7101/relay");
    }

    #[test]
    fn reject_bad_endpoints() {
        assert!(Endpoint::parse("http://example.com:80").is_err());
        assert!(Endpoint::parse("tcp://nohost").is_err());
        assert!(Endpoint::parse("").is_err());
    }

    #[tokio::test]
    async fn tcp_frames_arrive_byte_identical() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = tcp(stream, DEFAULT_MAX_PAYLOAD);
            reader.next_frame().await.unwrap().unwrap()
        });

        let endpoint = Endpoint::parse(&format!("tcp://{addr}")).unwrap();
        let (_reader, mut writer) = connect(&endpoint, DEFAULT_MAX_PAYLOAD).await.unwrap();
        let sent = Envelope::new("client-a", "server-a", 5u16, Bytes::from_static(b"ping"))
            .encode()
            .unwrap();
        writer.send_frame(sent.clone()).await.unwrap();

        let frame = server.await.unwrap();
        assert_eq!(frame.raw(), &sent);
    }

    #[tokio::test]
    async fn websocket_frames_arrive_byte_identical() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut reader, _writer) = websocket(ws, DEFAULT_MAX_PAYLOAD);
            reader.next_frame().await.unwrap().unwrap()
        });

        let endpoint = Endpoint::parse(&format!("ws://{addr}/relay")).unwrap();
        let (_reader, mut writer) = connect(&endpoint, DEFAULT_MAX_PAYLOAD).await.unwrap();
        let sent = Envelope::new("client-a", "server-a", 5u16, Bytes::from_static(b"ping"))
            .encode()
            .unwrap();
        writer.send_frame(sent.clone()).await.unwrap();

        let frame = server.await.unwrap();
        assert_eq!(frame.raw(), &sent);
    }
}
