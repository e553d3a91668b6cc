//! ucrelay-proxy: the relay proxy.
//!
//! Servers and clients connect here after the balancer tells them where to
//! go. The proxy authenticates them, binds each client to one server and
//! relays envelope frames between the two without touching payloads.
//! Intercept hooks observe traffic by message type.

pub mod auth;
pub mod config;
pub mod fsm;
pub mod handshake;
pub mod heartbeat;
pub mod hooks;
pub mod node;
pub mod sessions;

pub use auth::{AllowAll, AuthDecision, Authenticator, HmacTokens, StaticTokens};
pub use config::{ProxyConfig, ProxySettings};
pub use fsm::{ConnectionState, ConnectionTable};
pub use heartbeat::HeartbeatEmitter;
pub use hooks::{
    Direction, HookContext, HookError, HookPhase, HookRegistry, InterceptHook, TrafficLog,
    TypeRange,
};
pub use node::ProxyNode;
pub use sessions::SessionTable;
