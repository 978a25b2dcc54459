//! Durable peer list
//!
//! Only `(host, port)` pairs survive a restart; liveness is rebuilt by
//! probing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host:port`.
impl FromStr for PeerAddress {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| MeshError::Config(format!("peer address '{s}' lacks a port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| MeshError::Config(format!("bad port in peer address '{s}'")))?;
        if host.is_empty() {
            return Err(MeshError::Config(format!("peer address '{s}' lacks a host")));
        }
        Ok(Self::new(host, port))
    }
}

#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Fails with [`MeshError::DuplicatePeer`] if the pair is already stored.
    async fn add_peer(&self, host: &str, port: u16) -> Result<()>;

    /// Removing an unknown pair is not an error.
    async fn remove_peer(&self, host: &str, port: u16) -> Result<()>;

    /// Stored pairs in insertion order
    async fn list_peers(&self) -> Result<Vec<PeerAddress>>;
}

fn insert_unique(peers: &mut Vec<PeerAddress>, host: &str, port: u16) -> Result<()> {
    if peers.iter().any(|p| p.host == host && p.port == port) {
        return Err(MeshError::DuplicatePeer {
            host: host.to_string(),
            port,
        });
    }
    peers.push(PeerAddress::new(host, port));
    Ok(())
}

/// Peer list that lives only as long as the process
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: Mutex<Vec<PeerAddress>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn add_peer(&self, host: &str, port: u16) -> Result<()> {
        insert_unique(&mut *self.peers.lock().await, host, port)
    }

    async fn remove_peer(&self, host: &str, port: u16) -> Result<()> {
        self.peers
            .lock()
            .await
            .retain(|p| !(p.host == host && p.port == port));
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerAddress>> {
        Ok(self.peers.lock().await.clone())
    }
}

/// Peer list persisted as a JSON array
pub struct JsonFilePeerStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl JsonFilePeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<PeerAddress>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, peers: &[PeerAddress]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(peers)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerStore for JsonFilePeerStore {
    async fn add_peer(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut peers = self.load().await?;
        insert_unique(&mut peers, host, port)?;
        self.save(&peers).await
    }

    async fn remove_peer(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut peers = self.load().await?;
        let before = peers.len();
        peers.retain(|p| !(p.host == host && p.port == port));
        if peers.len() != before {
            self.save(&peers).await?;
        }
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerAddress>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_peer_address() {
        let addr: PeerAddress = "node-b.example:8085".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("node-b.example", 8085));
        assert_eq!(addr.to_string(), "node-b.example:8085");

        assert!("node-b.example".parse::<PeerAddress>().is_err());
        assert!("node-b.example:http".parse::<PeerAddress>().is_err());
        assert!(":8085".parse::<PeerAddress>().is_err());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("peers.json");

        let store = JsonFilePeerStore::new(&path);
        assert!(store.list_peers().await.unwrap().is_empty());
        store.add_peer("alpha", 8000).await.unwrap();
        store.add_peer("beta", 8001).await.unwrap();

        let reopened = JsonFilePeerStore::new(&path);
        let peers = reopened.list_peers().await.unwrap();
        assert_eq!(
            peers,
            vec![PeerAddress::new("alpha", 8000), PeerAddress::new("beta", 8001)]
        );

        reopened.remove_peer("alpha", 8000).await.unwrap();
        reopened.remove_peer("gamma", 1).await.unwrap();
        assert_eq!(
            store.list_peers().await.unwrap(),
            vec![PeerAddress::new("beta", 8001)]
        );
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let store = MemoryPeerStore::new();
        store.add_peer("alpha", 8000).await.unwrap();
        let err = store.add_peer("alpha", 8000).await.unwrap_err();
        assert!(matches!(err, MeshError::DuplicatePeer { port: 8000, .. }));
        assert_eq!(store.list_peers().await.unwrap().len(), 1);
    }
}
