//! Balancer configuration: TOML file + CLI overrides.

use crate::balancer::BalancerSettings;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use ucrelay_core::config::load_toml;
use ucrelay_core::{Backoff, RelayResult};

/// `registry` value that runs an embedded in-memory registry.
pub const EMBEDDED_REGISTRY: &str = "memory";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub balancer: BalancerSection,
    #[serde(default)]
    pub backoff: Backoff,
}

/// `[balancer]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Registry service address, or `memory`.
    #[serde(default = "default_registry")]
    pub registry: String,
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
    #[serde(default = "default_assignment_ttl_secs")]
    pub assignment_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeat_limit")]
    pub missed_heartbeat_limit: u32,
}

impl Default for BalancerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            registry: default_registry(),
            registry_timeout_ms: default_registry_timeout_ms(),
            assignment_ttl_secs: default_assignment_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7300".to_string()
}
fn default_registry() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_registry_timeout_ms() -> u64 {
    2_000
}
fn default_assignment_ttl_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_missed_heartbeat_limit() -> u32 {
    3
}

/// Resolved balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub listen: String,
    pub registry: String,
    pub settings: BalancerSettings,
}

impl BalancerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_registry: Option<&str>,
    ) -> RelayResult<Self> {
        let file: ConfigFile = load_toml(config_path)?;
        Ok(Self::from_file(file, cli_listen, cli_registry))
    }

    fn from_file(file: ConfigFile, cli_listen: Option<&str>, cli_registry: Option<&str>) -> Self {
        let section = file.balancer;
        Self {
            listen: cli_listen.map(str::to_string).unwrap_or(section.listen),
            registry: cli_registry.map(str::to_string).unwrap_or(section.registry),
            settings: BalancerSettings {
                assignment_ttl: Duration::from_secs(section.assignment_ttl_secs),
                heartbeat_interval: Duration::from_secs(section.heartbeat_interval_secs),
                missed_heartbeat_limit: section.missed_heartbeat_limit,
                registry_timeout: Duration::from_millis(section.registry_timeout_ms),
                backoff: file.backoff,
            },
        }
    }

    pub fn embedded_registry(&self) -> bool {
        self.registry == EMBEDDED_REGISTRY
    }
}
