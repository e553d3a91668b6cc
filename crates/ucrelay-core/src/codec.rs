//! Stream codecs.
//!
//! - [`EnvelopeCodec`]: relay envelopes on a byte stream, back to back.
//! - [`cbor_encode`] / [`cbor_decode`]: payload encoding for control frames
//!   and the balancer/registry RPC (see [`crate::rpc`]).

use crate::envelope::{EnvelopeHeader, Frame, DEFAULT_MAX_PAYLOAD};
use crate::error::{RelayError, RelayResult};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

/// Decodes relay envelopes from a byte stream.
///
/// The header of the next frame is parsed once, as soon as its bytes are
/// available, and cached while the payload is still arriving.
#[derive(Debug)]
pub struct EnvelopeCodec {
    max_payload: u32,
    pending: Option<(EnvelopeHeader, usize)>,
}

impl EnvelopeCodec {
    pub fn new(max_payload: u32) -> Self {
        Self {
            max_payload,
            pending: None,
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Frame;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> RelayResult<Option<Frame>> {
        if self.pending.is_none() {
            match EnvelopeHeader::parse(src, self.max_payload)? {
                Some(parsed) => self.pending = Some(parsed),
                None => return Ok(None),
            }
        }

        let frame_len = match &self.pending {
            Some((header, _)) => header.frame_len(),
            None => return Ok(None),
        };
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let raw = src.split_to(frame_len).freeze();
        match self.pending.take() {
            Some((header, header_len)) => Ok(Some(Frame::from_parts(header, header_len, raw))),
            None => Ok(None),
        }
    }
}

/// Frames are written verbatim; they were encoded (or received) whole.
impl Encoder<Bytes> for EnvelopeCodec {
    type Error = RelayError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> RelayResult<()> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Encode a value as bare CBOR (no length prefix).
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> RelayResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::ProtocolError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn cbor_value_decodes() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let bytes = cbor_encode(&msg).unwrap();
        let decoded: TestMsg = cbor_decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(cbor_decode::<TestMsg>(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let a = Envelope::new("a", "b", 1u16, Bytes::from_static(b"one"));
        let b = Envelope::new("b", "a", 2u16, Bytes::from_static(b"second"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());

        let mut codec = EnvelopeCodec::default();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(first.into_envelope(), a);
        assert_eq!(second.into_envelope(), b);
    }

    #[test]
    fn incremental_feed() {
        let env = Envelope::new("client", "server", 9u16, vec![7u8; 100]);
        let bytes = env.encode().unwrap();
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();

        // Feed one byte at a time
        for b in &bytes[..bytes.len() - 1] {
            buf.extend_from_slice(&[*b]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.raw(), &bytes);
        assert!(buf.is_empty());
    }

    #[test]
    fn malformed_header_is_an_error() {
        let mut buf = BytesMut::from(&[0x01u8, 0x00][..]);
        let mut codec = EnvelopeCodec::default();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn oversized_payload_rejected_before_buffering() {
        let env = Envelope::new("a", "b", 1u16, vec![0u8; 64]);
        let bytes = env.encode().unwrap();
        let mut codec = EnvelopeCodec::new(16);
        // Header only: the error fires without waiting for the payload.
        let mut buf = BytesMut::from(&bytes[..12]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::PayloadTooLarge { len: 64, max: 16 })
        ));
    }
}
