//! ucrelay-core: Shared protocol library for the ucrelay proxy layer.
//!
//! Provides the binary envelope format and stream codec, proxy control
//! messages, the error taxonomy, HMAC credentials, config file loading, frame
//! transports (TCP and WebSocket), the CBOR RPC used between components, and
//! retry backoff.

pub mod backoff;
pub mod codec;
pub mod config;
pub mod control;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod rpc;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use backoff::Backoff;
pub use codec::{cbor_decode, cbor_encode, EnvelopeCodec};
pub use control::{CloseReason, Control, Role, PROTOCOL_VERSION};
pub use envelope::{Envelope, Frame, MessageType, DEFAULT_MAX_PAYLOAD};
pub use error::{
    ErrorCode, HandshakeError, InfraError, ProtocolError, RelayError, RelayResult,
    ResolutionError, RoutingError, WireError,
};
pub use ids::{ClientId, ConnectionId, ProxyId, ServerId};
pub use token::{create_token, generate_secret, verify_token};
pub use transport::{Endpoint, FrameReader, FrameWriter, TransportKind};
