//! ucrelay-client: endpoint library for the relay layer.
//!
//! A server registers through the balancer and keeps a channel open to the
//! proxy it was placed on. A client resolves a server through the balancer and
//! opens a session to the same proxy. Both then exchange envelope frames.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ucrelay_client::{BalancerClient, ClientEndpoint, ConnectConfig};
//! use ucrelay_core::{ClientId, ServerId};
//!
//! # async fn example() -> ucrelay_core::RelayResult<()> {
//! let balancer = Arc::new(BalancerClient::new("127.0.0.1:7300", Duration::from_secs(2)));
//! let phone = ClientEndpoint::new(ClientId::new("phone-1")?, balancer, ConnectConfig::default());
//! let (_placement, mut conn) = phone.connect(&ServerId::new("server-a")?).await?;
//! conn.send("server-a", 5u16, &b"ping"[..]).await?;
//! let reply = conn.recv().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod endpoint;

pub use connection::{ConnectConfig, Event, FrameSender, ProxyConnection};
pub use endpoint::{is_not_assigned, ClientEndpoint, ServerEndpoint};

pub use ucrelay_balancer::{BalancerClient, Placement};
