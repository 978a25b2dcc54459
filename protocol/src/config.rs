//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MeshError, Result};
use crate::persist::PeerAddress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Interface the HTTP server binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the HTTP server binds to; 0 picks a free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host name peers should use in download URLs, if it differs from `host`
    #[serde(default)]
    pub public_host: Option<String>,

    /// Peers registered at startup, as `host:port`
    #[serde(default)]
    pub seed_peers: Vec<String>,

    /// Peer list and container cache live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name prefix of the per-server staging directory
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Minimum time between two liveness probes of the same peer
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long `stop` waits for the server task to finish
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8085 }
fn default_staging_prefix() -> String { "kmesh-staging-".to_string() }
fn default_probe_timeout() -> u64 { 10 }
fn default_probe_interval() -> u64 { 300 }
fn default_request_timeout() -> u64 { 30 }
fn default_stop_grace() -> u64 { 5 }

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("kmesh"))
        .unwrap_or_else(|| PathBuf::from("./kmesh-data"))
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_host: None,
            seed_peers: Vec::new(),
            data_dir: default_data_dir(),
            staging_prefix: default_staging_prefix(),
            probe_timeout_secs: default_probe_timeout(),
            probe_interval_secs: default_probe_interval(),
            request_timeout_secs: default_request_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

impl NodeConfig {
    /// Config for a node whose files live under `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| MeshError::Config(format!("{}: {e}", path.display())))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn peers_file(&self) -> PathBuf {
        self.data_dir.join("peers.json")
    }

    /// Downloaded containers are cached here
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn seed_addresses(&self) -> Result<Vec<PeerAddress>> {
        self.seed_peers.iter().map(|s| s.parse()).collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.probe_timeout_secs, 10);
        assert_eq!(config.stop_grace_secs, 5);
        assert_eq!(config.probe_interval_secs, 300);
        assert!(config.seed_peers.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");

        let mut config = NodeConfig::with_data_dir(dir.path().join("data"));
        config.port = 9001;
        config.seed_peers = vec!["alpha:8085".into()];
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.port, 9001);
        assert_eq!(loaded.seed_peers, vec!["alpha:8085".to_string()]);
        assert_eq!(loaded.peers_file(), dir.path().join("data").join("peers.json"));
        assert_eq!(loaded.seed_addresses().unwrap()[0], PeerAddress::new("alpha", 8085));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "port = 0\nseed_peers = [\"beta:1\"]\n").unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_bad_seed_peer_is_config_error() {
        let mut config = NodeConfig::default();
        config.seed_peers = vec!["no-port".into()];
        assert!(matches!(config.seed_addresses(), Err(MeshError::Config(_))));
    }
}
