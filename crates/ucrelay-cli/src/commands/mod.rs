//! CLI subcommand implementations.

pub mod placement;
pub mod send;
pub mod serve;
pub mod token;

use std::sync::Arc;
use std::time::Duration;
use ucrelay_client::{BalancerClient, ConnectConfig};

/// Settings shared by every subcommand.
pub struct Context {
    pub balancer: String,
    pub credential: String,
    pub timeout: Duration,
}

impl Context {
    pub fn balancer_client(&self) -> Arc<BalancerClient> {
        Arc::new(BalancerClient::new(self.balancer.clone(), self.timeout))
    }

    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            credential: self.credential.clone(),
            timeout: self.timeout,
            ..ConnectConfig::default()
        }
    }
}
