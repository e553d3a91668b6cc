//! Relay envelope: routing header plus opaque payload.
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! u16 sender_len | sender | u16 target_len | target | u16 message_type | u32 payload_len | payload
//! ```
//!
//! The proxy only ever parses the header. Payload bytes are carried as an
//! opaque slice of the received frame and forwarded without re-encoding.

use crate::error::ProtocolError;
use crate::ids::MAX_ID_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 1_048_576;

/// First message type reserved for proxy control frames.
pub const CONTROL_RANGE_START: u16 = 0xFF00;

/// Smallest possible header: two empty-length prefixes, type and length.
/// Sender must be non-empty, so a valid header is always longer.
const FIXED_HEADER_LEN: usize = 2 + 2 + 2 + 4;

/// Numeric message type.
///
/// Types below [`CONTROL_RANGE_START`] belong to applications and are opaque
/// to the proxy; the reserved range carries [`ControlKind`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u16);

impl MessageType {
    pub const HELLO: MessageType = MessageType(0xFF01);
    pub const HELLO_OK: MessageType = MessageType(0xFF02);
    pub const CLOSE: MessageType = MessageType(0xFF03);
    pub const ERROR: MessageType = MessageType(0xFF04);
    pub const PING: MessageType = MessageType(0xFF05);
    pub const PONG: MessageType = MessageType(0xFF06);

    pub fn is_control(self) -> bool {
        self.0 >= CONTROL_RANGE_START
    }

    /// Control kind for a reserved type, `UnsupportedMessageType` for reserved
    /// values nobody defined, `None` for application types.
    pub fn control_kind(self) -> Result<Option<ControlKind>, ProtocolError> {
        if !self.is_control() {
            return Ok(None);
        }
        let kind = match self {
            Self::HELLO => ControlKind::Hello,
            Self::HELLO_OK => ControlKind::HelloOk,
            Self::CLOSE => ControlKind::Close,
            Self::ERROR => ControlKind::Error,
            Self::PING => ControlKind::Ping,
            Self::PONG => ControlKind::Pong,
            other => return Err(ProtocolError::UnsupportedMessageType(other.0)),
        };
        Ok(Some(kind))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for MessageType {
    fn from(v: u16) -> Self {
        MessageType(v)
    }
}

/// Proxy control frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Hello,
    HelloOk,
    Close,
    Error,
    Ping,
    Pong,
}

impl ControlKind {
    pub fn message_type(self) -> MessageType {
        match self {
            ControlKind::Hello => MessageType::HELLO,
            ControlKind::HelloOk => MessageType::HELLO_OK,
            ControlKind::Close => MessageType::CLOSE,
            ControlKind::Error => MessageType::ERROR,
            ControlKind::Ping => MessageType::PING,
            ControlKind::Pong => MessageType::PONG,
        }
    }
}

/// Parsed routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub sender: String,
    pub target: String,
    pub message_type: MessageType,
    pub payload_len: u32,
}

impl EnvelopeHeader {
    /// Encoded size of this header in bytes.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.sender.len() + self.target.len()
    }

    /// Total frame size (header + payload).
    pub fn frame_len(&self) -> usize {
        self.encoded_len() + self.payload_len as usize
    }

    /// Parse a header from the start of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold the whole header. The work
    /// done is bounded by the header size; payload bytes are never touched.
    pub fn parse(buf: &[u8], max_payload: u32) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut pos = 0usize;

        let sender = match read_id(buf, &mut pos, "sender")? {
            Some(s) => s,
            None => return Ok(None),
        };
        if sender.is_empty() {
            return Err(ProtocolError::MalformedHeader("empty sender".into()));
        }
        let target = match read_id(buf, &mut pos, "target")? {
            Some(t) => t,
            None => return Ok(None),
        };

        if buf.len() < pos + 6 {
            return Ok(None);
        }
        let message_type = MessageType(u16::from_be_bytes([buf[pos], buf[pos + 1]]));
        let payload_len =
            u32::from_be_bytes([buf[pos + 2], buf[pos + 3], buf[pos + 4], buf[pos + 5]]);
        pos += 6;

        if payload_len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len as u64,
                max: max_payload,
            });
        }

        Ok(Some((
            Self {
                sender,
                target,
                message_type,
                payload_len,
            },
            pos,
        )))
    }

    /// Append the encoded header to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(self.sender.len() as u16);
        dst.put_slice(self.sender.as_bytes());
        dst.put_u16(self.target.len() as u16);
        dst.put_slice(self.target.as_bytes());
        dst.put_u16(self.message_type.0);
        dst.put_u32(self.payload_len);
    }
}

fn read_id(buf: &[u8], pos: &mut usize, field: &str) -> Result<Option<String>, ProtocolError> {
    if buf.len() < *pos + 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    if len > MAX_ID_LEN {
        return Err(ProtocolError::MalformedHeader(format!(
            "{field} length {len} exceeds {MAX_ID_LEN}"
        )));
    }
    if buf.len() < *pos + 2 + len {
        return Ok(None);
    }
    let raw = &buf[*pos + 2..*pos + 2 + len];
    let value = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::MalformedHeader(format!("{field} is not valid UTF-8")))?;
    if value.chars().any(char::is_control) {
        return Err(ProtocolError::MalformedHeader(format!(
            "{field} contains control characters"
        )));
    }
    *pos += 2 + len;
    Ok(Some(value.to_string()))
}

/// A complete received frame: parsed header plus the exact bytes received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: EnvelopeHeader,
    header_len: usize,
    raw: Bytes,
}

impl Frame {
    /// Build a frame from a buffer that must contain exactly one envelope
    /// (message-oriented transports such as WebSocket).
    pub fn parse_exact(raw: Bytes, max_payload: u32) -> Result<Self, ProtocolError> {
        let (header, header_len) = EnvelopeHeader::parse(&raw, max_payload)?.ok_or_else(|| {
            ProtocolError::MalformedHeader(format!("truncated header ({} bytes)", raw.len()))
        })?;
        if header.frame_len() != raw.len() {
            return Err(ProtocolError::MalformedHeader(format!(
                "declared frame length {} does not match message length {}",
                header.frame_len(),
                raw.len()
            )));
        }
        Ok(Self {
            header,
            header_len,
            raw,
        })
    }

    pub(crate) fn from_parts(header: EnvelopeHeader, header_len: usize, raw: Bytes) -> Self {
        Self {
            header,
            header_len,
            raw,
        }
    }

    pub fn header(&self) -> &EnvelopeHeader {
        &self.header
    }

    pub fn sender(&self) -> &str {
        &self.header.sender
    }

    pub fn target(&self) -> &str {
        &self.header.target
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Exact frame bytes as received.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Payload slice (zero-copy).
    pub fn payload(&self) -> Bytes {
        self.raw.slice(self.header_len..)
    }

    pub fn into_envelope(self) -> Envelope {
        let payload = self.payload();
        Envelope {
            sender: self.header.sender,
            target: self.header.target,
            message_type: self.header.message_type,
            payload,
        }
    }
}

/// An owned envelope, used when building frames to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub target: String,
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        sender: impl Into<String>,
        target: impl Into<String>,
        message_type: impl Into<MessageType>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            message_type: message_type.into(),
            payload: payload.into(),
        }
    }

    /// Encode into a single frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.sender.is_empty() {
            return Err(ProtocolError::MalformedHeader("empty sender".into()));
        }
        for (field, value) in [("sender", &self.sender), ("target", &self.target)] {
            if value.len() > MAX_ID_LEN {
                return Err(ProtocolError::MalformedHeader(format!(
                    "{field} length {} exceeds {MAX_ID_LEN}",
                    value.len()
                )));
            }
        }
        let payload_len = u32::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::PayloadTooLarge {
                len: self.payload.len() as u64,
                max: u32::MAX,
            }
        })?;
        let header = EnvelopeHeader {
            sender: self.sender.clone(),
            target: self.target.clone(),
            message_type: self.message_type,
            payload_len,
        };
        let mut buf = BytesMut::with_capacity(header.frame_len());
        header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Encode and wrap as a [`Frame`] without reparsing.
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let raw = self.encode()?;
        let header_len = FIXED_HEADER_LEN + self.sender.len() + self.target.len();
        let header = EnvelopeHeader {
            payload_len: self.payload.len() as u32,
            sender: self.sender,
            target: self.target,
            message_type: self.message_type,
        };
        Ok(Frame::from_parts(header, header_len, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> Envelope {
        Envelope::new("client-a", "server-a", 5u16, Bytes::from_static(b"ping"))
    }

    #[test]
    fn header_layout() {
        let bytes = ping().encode().unwrap();
        assert_eq!(&bytes[..2], &[0, 8]);
        assert_eq!(&bytes[2..10], b"client-a");
        assert_eq!(&bytes[10..12], &[0, 8]);
        assert_eq!(&bytes[12..20], b"server-a");
        assert_eq!(&bytes[20..22], &[0, 5]);
        assert_eq!(&bytes[22..26], &[0, 0, 0, 4]);
        assert_eq!(&bytes[26..], b"ping");
    }

    #[test]
    fn parse_needs_whole_header() {
        let bytes = ping().encode().unwrap();
        for cut in 0..26 {
            assert_eq!(
                EnvelopeHeader::parse(&bytes[..cut], DEFAULT_MAX_PAYLOAD).unwrap(),
                None,
                "cut at {cut}"
            );
        }
        let (header, len) = EnvelopeHeader::parse(&bytes[..26], DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(len, 26);
        assert_eq!(header.payload_len, 4);
    }

    #[test]
    fn parse_ignores_payload_contents() {
        // Header is complete; payload absent. Parsing still succeeds.
        let mut buf = BytesMut::new();
        EnvelopeHeader {
            sender: "a".into(),
            target: "b".into(),
            message_type: MessageType(7),
            payload_len: 1000,
        }
        .write_to(&mut buf);
        let parsed = EnvelopeHeader::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(parsed.is_some());
    }

    #[test]
    fn oversize_id_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16(300);
        buf.put_slice(&[b'x'; 300]);
        let err = EnvelopeHeader::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    #[test]
    fn empty_sender_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        let err = EnvelopeHeader::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_slice(&[0xff, 0xfe]);
        let err = EnvelopeHeader::parse(&buf, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHeader(_)));
    }

    #[test]
    fn payload_limit_enforced() {
        let env = Envelope::new("a", "b", 1u16, vec![0u8; 64]);
        let bytes = env.encode().unwrap();
        let err = EnvelopeHeader::parse(&bytes, 32).unwrap_err();
        assert_eq!(err, ProtocolError::PayloadTooLarge { len: 64, max: 32 });
    }

    #[test]
    fn parse_exact_rejects_trailing_bytes() {
        let mut raw = BytesMut::from(&ping().encode().unwrap()[..]);
        raw.put_u8(0);
        assert!(Frame::parse_exact(raw.freeze(), DEFAULT_MAX_PAYLOAD).is_err());
    }

    #[test]
    fn frame_payload_is_slice_of_raw() {
        let raw = ping().encode().unwrap();
        let frame = Frame::parse_exact(raw.clone(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.raw(), &raw);
        assert_eq!(&frame.payload()[..], b"ping");
        assert_eq!(frame.sender(), "client-a");
        assert_eq!(frame.target(), "server-a");
    }

    #[test]
    fn into_frame_matches_parse() {
        let built = ping().into_frame().unwrap();
        let parsed = Frame::parse_exact(built.raw().clone(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn control_kinds() {
        assert_eq!(MessageType(5).control_kind().unwrap(), None);
        assert_eq!(
            MessageType::HELLO.control_kind().unwrap(),
            Some(ControlKind::Hello)
        );
        assert_eq!(
            MessageType(0xFF7F).control_kind().unwrap_err(),
            ProtocolError::UnsupportedMessageType(0xFF7F)
        );
    }
}
