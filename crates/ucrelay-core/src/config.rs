//! Config file helpers shared by the ucrelay binaries.

use crate::error::{RelayError, RelayResult};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load a TOML config file. A missing file (or no path at all) yields the
/// defaults; a file that exists but does not parse is an error.
pub fn load_toml<T: DeserializeOwned + Default>(path: Option<&Path>) -> RelayResult<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(T::default());
    }

    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str::<T>(&content)
        .map_err(|e| RelayError::Config(format!("{}: {e}", expanded.display())))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        name: String,
        #[serde(default)]
        port: u16,
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: Sample = load_toml(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(cfg, Sample::default());
        let cfg: Sample = load_toml(None).unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn parses_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"relay\"\nport = 7100").unwrap();
        let cfg: Sample = load_toml(Some(file.path())).unwrap();
        assert_eq!(cfg.name, "relay");
        assert_eq!(cfg.port, 7100);
    }

    #[test]
    fn bad_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a number\"").unwrap();
        let err = load_toml::<Sample>(Some(file.path())).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x.toml"), home.join("x.toml"));
        }
        assert_eq!(expand_tilde_str("/etc/x.toml"), PathBuf::from("/etc/x.toml"));
    }
}
