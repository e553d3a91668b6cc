//! Proxy configuration: TOML file + CLI overrides.

use crate::auth::{AllowAll, Authenticator, HmacTokens, StaticTokens};
use crate::hooks::{HookPhase, TypeRange};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use ucrelay_core::config::load_toml;
use ucrelay_core::{
    Backoff, ProxyId, RelayError, RelayResult, TransportKind, DEFAULT_MAX_PAYLOAD,
};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub hooks: HooksSection,
    #[serde(default)]
    pub backoff: Backoff,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_listen_tcp")]
    pub listen_tcp: String,
    /// Empty disables the WebSocket listener.
    #[serde(default = "default_listen_ws")]
    pub listen_ws: String,
    /// The one address the balancer hands out for this proxy; defaults to
    /// `tcp://<listen_tcp>`. Set a `ws://` URL to route endpoints through the
    /// WebSocket listener instead, which must then be enabled.
    #[serde(default)]
    pub advertise: Option<String>,
    #[serde(default = "default_balancer")]
    pub balancer: String,
    #[serde(default = "default_registry")]
    pub registry: String,
    #[serde(default = "default_max_payload")]
    pub max_payload: u32,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_server_heartbeat_timeout_secs")]
    pub server_heartbeat_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeat_limit")]
    pub missed_heartbeat_limit: u32,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            id: default_id(),
            listen_tcp: default_listen_tcp(),
            listen_ws: default_listen_ws(),
            advertise: None,
            balancer: default_balancer(),
            registry: default_registry(),
            max_payload: default_max_payload(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            server_heartbeat_timeout_secs: default_server_heartbeat_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

fn default_id() -> String {
    "proxy-1".to_string()
}
fn default_listen_tcp() -> String {
    "127.0.0.1:7100".to_string()
}
fn default_listen_ws() -> String {
    "127.0.0.1:7101".to_string()
}
fn default_balancer() -> String {
    "127.0.0.1:7300".to_string()
}
fn default_registry() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_max_payload() -> u32 {
    DEFAULT_MAX_PAYLOAD
}
fn default_rpc_timeout_ms() -> u64 {
    2_000
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_session_idle_timeout_secs() -> u64 {
    300
}
fn default_server_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    5
}
fn default_missed_heartbeat_limit() -> u32 {
    3
}
fn default_cancel_grace_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    AllowAll,
    Static,
    Hmac,
}

/// `[auth]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub mode: AuthMode,
    /// id → token, for `mode = "static"`.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
    /// Hex HMAC secret, for `mode = "hmac"`.
    #[serde(default)]
    pub secret_hex: Option<String>,
}

impl AuthSection {
    pub fn build(&self) -> RelayResult<Arc<dyn Authenticator>> {
        match self.mode {
            AuthMode::AllowAll => Ok(Arc::new(AllowAll)),
            AuthMode::Static => {
                if self.tokens.is_empty() {
                    return Err(RelayError::Config(
                        "auth mode \"static\" needs [auth.tokens]".into(),
                    ));
                }
                Ok(Arc::new(StaticTokens::new(self.tokens.clone())))
            }
            AuthMode::Hmac => {
                let secret_hex = self.secret_hex.as_deref().ok_or_else(|| {
                    RelayError::Config("auth mode \"hmac\" needs secret_hex".into())
                })?;
                let secret = hex::decode(secret_hex.trim())
                    .map_err(|e| RelayError::Config(format!("invalid secret_hex: {e}")))?;
                if secret.is_empty() {
                    return Err(RelayError::Config("secret_hex is empty".into()));
                }
                Ok(Arc::new(HmacTokens::new(secret)))
            }
        }
    }
}

/// `[hooks]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct HooksSection {
    /// Phase for hooks that do not choose one.
    #[serde(default = "default_hook_order")]
    pub order: HookPhase,
    #[serde(default = "default_hook_timeout_ms")]
    pub timeout_ms: u64,
    /// Message types for the built-in traffic log (`"5"`, `"0x100-0x1ff"`).
    #[serde(default)]
    pub log_types: Vec<String>,
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            order: default_hook_order(),
            timeout_ms: default_hook_timeout_ms(),
            log_types: Vec::new(),
        }
    }
}

fn default_hook_order() -> HookPhase {
    HookPhase::After
}
fn default_hook_timeout_ms() -> u64 {
    1_000
}

impl HooksSection {
    pub fn log_ranges(&self) -> RelayResult<Vec<TypeRange>> {
        self.log_types
            .iter()
            .map(|s| s.parse::<TypeRange>().map_err(RelayError::Config))
            .collect()
    }
}

/// Timing and limits for a running proxy node.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_payload: u32,
    pub handshake_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub server_heartbeat_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub missed_heartbeat_limit: u32,
    pub cancel_grace: Duration,
    /// Frames queued per connection before relaying applies backpressure.
    pub outbound_queue: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            handshake_timeout: Duration::from_millis(default_handshake_timeout_ms()),
            session_idle_timeout: Duration::from_secs(default_session_idle_timeout_secs()),
            server_heartbeat_timeout: Duration::from_secs(default_server_heartbeat_timeout_secs()),
            heartbeat_interval: Duration::from_secs(default_heartbeat_interval_secs()),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
            cancel_grace: Duration::from_millis(default_cancel_grace_ms()),
            outbound_queue: 256,
        }
    }
}

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub id: ProxyId,
    pub listen_tcp: String,
    pub listen_ws: Option<String>,
    pub advertise: String,
    pub balancer: String,
    pub registry: String,
    pub rpc_timeout: Duration,
    pub settings: ProxySettings,
    pub backoff: Backoff,
    pub auth: AuthSection,
    pub hooks: HooksSection,
}

/// CLI values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides<'a> {
    pub id: Option<&'a str>,
    pub listen_tcp: Option<&'a str>,
    pub listen_ws: Option<&'a str>,
    pub advertise: Option<&'a str>,
    pub balancer: Option<&'a str>,
    pub registry: Option<&'a str>,
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides<'_>) -> RelayResult<Self> {
        let file: ConfigFile = load_toml(config_path)?;
        Self::from_file(file, overrides)
    }

    pub fn from_file(file: ConfigFile, overrides: &Overrides<'_>) -> RelayResult<Self> {
        let section = file.proxy;
        let id = ProxyId::new(overrides.id.unwrap_or(section.id.as_str()))?;
        let listen_tcp = overrides
            .listen_tcp
            .map(str::to_string)
            .unwrap_or(section.listen_tcp);
        let listen_ws = overrides
            .listen_ws
            .map(str::to_string)
            .unwrap_or(section.listen_ws);
        let advertise = overrides
            .advertise
            .map(str::to_string)
            .or(section.advertise)
            .unwrap_or_else(|| format!("tcp://{listen_tcp}"));
        let advertised = ucrelay_core::Endpoint::parse(&advertise)
            .map_err(|e| RelayError::Config(format!("advertise: {e}")))?;
        if advertised.kind == TransportKind::WebSocket && listen_ws.is_empty() {
            return Err(RelayError::Config(format!(
                "advertise is {advertise} but the WebSocket listener is disabled (listen_ws)"
            )));
        }

        file.hooks.log_ranges()?;

        Ok(Self {
            id,
            listen_tcp,
            listen_ws: Some(listen_ws).filter(|s| !s.is_empty()),
            advertise,
            balancer: overrides
                .balancer
                .map(str::to_string)
                .unwrap_or(section.balancer),
            registry: overrides
                .registry
                .map(str::to_string)
                .unwrap_or(section.registry),
            rpc_timeout: Duration::from_millis(section.rpc_timeout_ms),
            settings: ProxySettings {
                max_payload: section.max_payload,
                handshake_timeout: Duration::from_millis(section.handshake_timeout_ms),
                session_idle_timeout: Duration::from_secs(section.session_idle_timeout_secs),
                server_heartbeat_timeout: Duration::from_secs(
                    section.server_heartbeat_timeout_secs,
                ),
                heartbeat_interval: Duration::from_secs(section.heartbeat_interval_secs),
                missed_heartbeat_limit: section.missed_heartbeat_limit,
                cancel_grace: Duration::from_millis(section.cancel_grace_ms),
                ..ProxySettings::default()
            },
            backoff: file.backoff,
            auth: file.auth,
            hooks: file.hooks,
        })
    }
}
