//! CLI configuration at `~/.ucrelay/cli.toml`.
//!
//! Provides the default balancer address and credential. CLI flags always
//! override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

/// Default connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Balancer address (host:port).
    #[serde(default = "default_balancer")]
    pub balancer: String,

    /// Credential presented to proxies.
    #[serde(default)]
    pub credential: String,

    /// Timeout for balancer calls and proxy handshakes.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            balancer: default_balancer(),
            credential: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_balancer() -> String {
    "127.0.0.1:7300".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Config {
    /// Load configuration, returning defaults if the file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        ucrelay_core::config::load_toml(Some(Path::new(path)))
            .with_context(|| format!("failed to load {path}"))
    }
}

impl DefaultConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[default]\ncredential = \"abc\"").unwrap();
        let cfg = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.default.credential, "abc");
        assert_eq!(cfg.default.balancer, "127.0.0.1:7300");
        assert_eq!(cfg.default.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_default() {
        let cfg = Config::load("/nonexistent/ucrelay/cli.toml").unwrap();
        assert_eq!(cfg.default.timeout_ms, 5_000);
    }
}
