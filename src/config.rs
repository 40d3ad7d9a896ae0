//! Daemon configuration.
//!
//! YAML files loaded from a cascading set of paths, later files
//! overriding earlier ones:
//! 1. `/etc/lar/lar.yaml` (lowest priority)
//! 2. `<config_dir>/lar/lar.yaml`
//! 3. `./lar.yaml` (highest priority)
//!
//! ```yaml
//! listen_port: 8695
//! data_dir: /var/lib/lar
//! chain:
//!   endpoint: "127.0.0.1:18777"
//! identity:
//!   endpoint: "127.0.0.1:18778"
//! sync:
//!   chain_interval_secs: 600
//!   balance_interval_secs: 60
//!   table_pull_interval_secs: 600
//! session:
//!   max_frame_len: 65535
//!   probe_timeout_secs: 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "lar.yaml";

/// Default TCP port for peer and destination connections.
pub const DEFAULT_PORT: u16 = 8695;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// A bridge endpoint (`chain.*` / `identity.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `host:port` of the service bridge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Background synchronizer intervals (`sync.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between chain scans for new registrations.
    pub chain_interval_secs: u64,
    /// Seconds between local channel balance refreshes.
    pub balance_interval_secs: u64,
    /// Seconds between table pulls on each peer session.
    pub table_pull_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain_interval_secs: 600,
            balance_interval_secs: 60,
            table_pull_interval_secs: 600,
        }
    }
}

/// Session limits (`session.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on an encrypted frame read from a peer.
    pub max_frame_len: usize,
    /// Deadline for a probe's reverse delivery; 0 waits forever.
    pub probe_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: u16::MAX as usize,
            probe_timeout_secs: 60,
        }
    }
}

impl SessionConfig {
    /// The probe deadline, if one is configured.
    pub fn probe_timeout(&self) -> Option<Duration> {
        (self.probe_timeout_secs > 0).then(|| Duration::from_secs(self.probe_timeout_secs))
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port to listen on (`listen_port`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Data directory holding `address.db` and `routing.db` (`data_dir`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Chain service bridge (`chain.*`).
    pub chain: EndpointConfig,

    /// Identity service bridge (`identity.*`).
    pub identity: EndpointConfig,

    /// Synchronizer intervals (`sync.*`).
    pub sync: SyncConfig,

    /// Session limits (`session.*`).
    pub session: SessionConfig,
}

impl Config {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths, merged in
    /// priority order. Returns the paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load and merge configuration from specific paths, later paths
    /// overriding earlier ones. Missing files are skipped.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded = Vec::new();
        for path in paths {
            if path.exists() {
                config.merge(Self::load_file(path)?);
                loaded.push(path.clone());
            }
        }
        Ok((config, loaded))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The standard search paths, lowest priority first.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/lar").join(CONFIG_FILENAME)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("lar").join(CONFIG_FILENAME));
        }
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));
        paths
    }

    /// Merge another configuration into this one; values present in
    /// `other` win.
    pub fn merge(&mut self, other: Config) {
        if other.listen_port.is_some() {
            self.listen_port = other.listen_port;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.chain.endpoint.is_some() {
            self.chain.endpoint = other.chain.endpoint;
        }
        if other.identity.endpoint.is_some() {
            self.identity.endpoint = other.identity.endpoint;
        }
        if other.sync != SyncConfig::default() {
            self.sync = other.sync;
        }
        if other.session != SessionConfig::default() {
            self.session = other.session;
        }
    }

    /// The listening port.
    pub fn port(&self) -> u16 {
        self.listen_port.unwrap_or(DEFAULT_PORT)
    }

    /// The effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".lar")
                .join("data")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.sync.chain_interval_secs, 600);
        assert_eq!(config.sync.balance_interval_secs, 60);
        assert_eq!(config.session.max_frame_len, 65_535);
        assert_eq!(
            config.session.probe_timeout(),
            Some(Duration::from_secs(60))
        );
        assert!(config.chain.endpoint.is_none());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
listen_port: 9000
data_dir: /tmp/lar-test
chain:
  endpoint: "127.0.0.1:18777"
identity:
  endpoint: "127.0.0.1:18778"
sync:
  chain_interval_secs: 30
  balance_interval_secs: 5
  table_pull_interval_secs: 60
session:
  max_frame_len: 4096
  probe_timeout_secs: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port(), 9000);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/lar-test"));
        assert_eq!(config.chain.endpoint.as_deref(), Some("127.0.0.1:18777"));
        assert_eq!(config.sync.table_pull_interval_secs, 60);
        assert_eq!(config.session.max_frame_len, 4096);
        assert_eq!(config.session.probe_timeout(), None);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config: Config = serde_yaml::from_str("listen_port: 9001\n").unwrap();
        assert_eq!(config.port(), 9001);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_merge_overrides() {
        let mut base: Config =
            serde_yaml::from_str("listen_port: 9000\nchain:\n  endpoint: a:1\n").unwrap();
        let over: Config =
            serde_yaml::from_str("chain:\n  endpoint: b:2\nsync:\n  chain_interval_secs: 5\n")
                .unwrap();
        base.merge(over);
        assert_eq!(base.port(), 9000);
        assert_eq!(base.chain.endpoint.as_deref(), Some("b:2"));
        assert_eq!(base.sync.chain_interval_secs, 5);
    }

    #[test]
    fn test_merge_keeps_base_when_other_empty() {
        let mut base: Config = serde_yaml::from_str("listen_port: 9000\n").unwrap();
        base.merge(Config::default());
        assert_eq!(base.port(), 9000);
    }

    #[test]
    fn test_load_from_paths_merges_in_order() {
        let dir = TempDir::new().unwrap();
        let low = dir.path().join("low.yaml");
        let high = dir.path().join("high.yaml");
        fs::write(&low, "listen_port: 9000\ndata_dir: /low\n").unwrap();
        fs::write(&high, "data_dir: /high\n").unwrap();

        let missing = dir.path().join("missing.yaml");
        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), missing, high.clone()]).unwrap();
        assert_eq!(loaded, vec![low, high]);
        assert_eq!(config.port(), 9000);
        assert_eq!(config.data_dir(), PathBuf::from("/high"));
    }

    #[test]
    fn test_search_paths_include_expected() {
        let paths = Config::search_paths();
        assert!(paths.iter().any(|p| p.starts_with("/etc/lar")));
        assert!(paths.iter().all(|p| p.ends_with(CONFIG_FILENAME)));
    }
}
