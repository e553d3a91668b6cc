//! ucrelay-balancer: decides which proxy hosts each server.
//!
//! Servers register to be placed on the least-loaded healthy proxy; clients
//! resolve a server to the address of its proxy; proxies report load and
//! health through heartbeats.

pub mod balancer;
pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use balancer::{pick_least_loaded, BalancerSettings, LoadBalancer};
pub use client::BalancerClient;
pub use protocol::{HeartbeatAck, Placement, ProxyHeartbeat};
pub use server::BalancerServer;
