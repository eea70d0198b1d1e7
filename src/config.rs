//! Configuration loading and persistence.
//!
//! Settings are resolved in three layers, later ones winning:
//!
//! 1. Built-in defaults (see [`crate::constants`]).
//! 2. A JSON file: `--config PATH`, or `<config dir>/board-link/config.json`.
//! 3. `BOARD_LINK_*` environment variables.
//!
//! Command-line flags are applied on top by the binary.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HOST, DEFAULT_NAME, DEFAULT_PORT,
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_RECONNECT_INTERVAL,
};
use crate::link::PeerEndpoint;

/// Connection settings for one board.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LinkConfig {
    /// Label used in log lines.
    pub name: String,
    /// Host name or IP address of the board.
    pub host: String,
    /// TCP port of the board.
    pub port: u16,
    /// Timeout in seconds for one connect attempt.
    pub connect_timeout: u64,
    /// Bytes requested from the socket per read.
    pub buffer_size: usize,
    /// Seconds to wait between failed connect attempts.
    pub reconnect_interval: u64,
    /// Seconds between heartbeat pings.
    pub heartbeat_interval: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL.as_secs(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        }
    }
}

impl LinkConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("board-link")
            .join("config.json"))
    }

    /// Load configuration with environment overrides.
    ///
    /// An explicit `path` must exist. Without one, a missing default file
    /// just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_path() {
                Ok(path) if path.exists() => Self::load_from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file. Missing keys take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Persist this configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply `BOARD_LINK_*` overrides from `lookup`.
    ///
    /// Unparseable numeric values are an error rather than silently ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("BOARD_LINK_NAME") {
            self.name = name;
        }
        if let Some(host) = lookup("BOARD_LINK_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("BOARD_LINK_PORT") {
            self.port = parse_override("BOARD_LINK_PORT", &port)?;
        }
        if let Some(timeout) = lookup("BOARD_LINK_CONNECT_TIMEOUT") {
            self.connect_timeout = parse_override("BOARD_LINK_CONNECT_TIMEOUT", &timeout)?;
        }
        if let Some(size) = lookup("BOARD_LINK_BUFFER_SIZE") {
            self.buffer_size = parse_override("BOARD_LINK_BUFFER_SIZE", &size)?;
        }
        if let Some(interval) = lookup("BOARD_LINK_RECONNECT_INTERVAL") {
            self.reconnect_interval = parse_override("BOARD_LINK_RECONNECT_INTERVAL", &interval)?;
        }
        if let Some(interval) = lookup("BOARD_LINK_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = parse_override("BOARD_LINK_HEARTBEAT_INTERVAL", &interval)?;
        }
        Ok(())
    }

    /// Reject settings the link cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.buffer_size == 0 {
            bail!("buffer_size must be at least 1");
        }
        if self.connect_timeout == 0 {
            bail!("connect_timeout must be at least 1 second");
        }
        if self.heartbeat_interval == 0 {
            bail!("heartbeat_interval must be at least 1 second");
        }
        Ok(())
    }

    /// Connection parameters for a [`PeerLink`](crate::link::PeerLink).
    pub fn endpoint(&self) -> PeerEndpoint {
        PeerEndpoint::new(self.host.clone(), self.port)
            .with_name(self.name.clone())
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_read_buffer_size(self.buffer_size)
            .with_reconnect_interval(Duration::from_secs(self.reconnect_interval))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval))
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {key}={value}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.port, 5000);
        assert_eq!(config.connect_timeout, 5);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.reconnect_interval, 5);
        assert_eq!(config.heartbeat_interval, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_carries_every_field() {
        let config = LinkConfig {
            name: "lights".to_string(),
            host: "10.1.1.1".to_string(),
            port: 6000,
            connect_timeout: 2,
            buffer_size: 512,
            reconnect_interval: 3,
            heartbeat_interval: 4,
        };
        let endpoint = config.endpoint();
        assert_eq!(endpoint.name, "lights");
        assert_eq!(endpoint.address(), "10.1.1.1:6000");
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(2));
        assert_eq!(endpoint.read_buffer_size, 512);
        assert_eq!(endpoint.reconnect_interval, Duration::from_secs(3));
        assert_eq!(endpoint.heartbeat_interval, Duration::from_secs(4));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"host": "board.local", "heartbeat_interval": 2}"#).unwrap();

        let config = LinkConfig::load_from_file(&path).unwrap();
        assert_eq!(config.host, "board.local");
        assert_eq!(config.heartbeat_interval, 2);
        assert_eq!(config.port, 5000);
        assert_eq!(config.name, "board");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = LinkConfig {
            name: "rig-a".to_string(),
            port: 5100,
            ..LinkConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(LinkConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LinkConfig::load(Some(&dir.path().join("absent.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let err = LinkConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = LinkConfig::default();
        config
            .apply_overrides(lookup(&[
                ("BOARD_LINK_NAME", "bench"),
                ("BOARD_LINK_HOST", "127.0.0.1"),
                ("BOARD_LINK_PORT", "7000"),
                ("BOARD_LINK_CONNECT_TIMEOUT", "1"),
                ("BOARD_LINK_BUFFER_SIZE", "64"),
                ("BOARD_LINK_RECONNECT_INTERVAL", "2"),
                ("BOARD_LINK_HEARTBEAT_INTERVAL", " 3 "),
            ]))
            .unwrap();
        assert_eq!(config.name, "bench");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.connect_timeout, 1);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.reconnect_interval, 2);
        assert_eq!(config.heartbeat_interval, 3);
    }

    #[test]
    fn test_bad_numeric_override_is_error() {
        let mut config = LinkConfig::default();
        let err = config
            .apply_overrides(lookup(&[("BOARD_LINK_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("BOARD_LINK_PORT"));
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        let zero_buffer = LinkConfig {
            buffer_size: 0,
            ..LinkConfig::default()
        };
        assert!(zero_buffer.validate().is_err());

        let empty_host = LinkConfig {
            host: "  ".to_string(),
            ..LinkConfig::default()
        };
        assert!(empty_host.validate().is_err());

        let zero_heartbeat = LinkConfig {
            heartbeat_interval: 0,
            ..LinkConfig::default()
        };
        assert!(zero_heartbeat.validate().is_err());
    }
}
