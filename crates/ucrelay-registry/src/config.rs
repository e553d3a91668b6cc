//! Registry configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use ucrelay_core::config::load_toml;
use ucrelay_core::RelayResult;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub registry: RegistrySection,
}

/// `[registry]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_secs: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tombstone_retention_secs: default_tombstone_retention(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:7400".to_string()
}
fn default_tombstone_retention() -> u64 {
    86_400
}
fn default_purge_interval() -> u64 {
    60
}

/// Resolved registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub listen: String,
    pub tombstone_retention: Duration,
    pub purge_interval: Duration,
}

impl RegistryConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_retention_secs: Option<u64>,
    ) -> RelayResult<Self> {
        let file: ConfigFile = load_toml(config_path)?;
        Ok(Self {
            listen: cli_listen
                .map(str::to_string)
                .unwrap_or(file.registry.listen),
            tombstone_retention: Duration::from_secs(
                cli_retention_secs.unwrap_or(file.registry.tombstone_retention_secs),
            ),
            purge_interval: Duration::from_secs(file.registry.purge_interval_secs.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = RegistryConfig::load(None, None, None).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:7400");
        assert_eq!(cfg.tombstone_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn cli_overrides_file() {
        let parsed: ConfigFile =
            toml::from_str("[registry]\nlisten = \"0.0.0.0:9000\"\ntombstone_retention_secs = 10\n")
                .unwrap();
        assert_eq!(parsed.registry.listen, "0.0.0.0:9000");
        assert_eq!(parsed.registry.purge_interval_secs, 60);

        let cfg = RegistryConfig::load(None, Some("127.0.0.1:1"), Some(5)).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:1");
        assert_eq!(cfg.tombstone_retention, Duration::from_secs(5));
    }
}
