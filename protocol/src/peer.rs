use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::client::PeerClient;
use crate::error::{MeshError, Result};
use crate::persist::PeerStore;
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Online,
    /// Last probe failed; re-probed once the probe interval has passed
    Offline,
    /// Switched off by the user; only [`PeerRegistry::enable`] brings it back
    Disabled,
}

/// A remote node and what we last learned about it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub uuid: Option<NodeId>,
    pub liveness: Liveness,
    pub last_probe: Option<DateTime<Utc>>,
    pub probe_interval_secs: u64,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16, probe_interval: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            uuid: None,
            liveness: Liveness::Offline,
            last_probe: None,
            probe_interval_secs: probe_interval.as_secs(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_online(&self) -> bool {
        self.liveness == Liveness::Online
    }

    /// Whether liveness should be re-evaluated before the peer is used
    pub fn probe_due(&self) -> bool {
        if self.liveness == Liveness::Disabled {
            return false;
        }
        match self.last_probe {
            None => true,
            Some(at) => {
                let age = Utc::now().signed_duration_since(at);
                age.num_seconds() > self.probe_interval_secs as i64
            }
        }
    }

    fn is(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase()
}

/// The peer registry: known peers in registration order.
///
/// Registration order is the order the resolver asks peers in.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<Vec<Peer>>>,
    store: Arc<dyn PeerStore>,
    client: PeerClient,
    probe_interval: Duration,
}

impl PeerRegistry {
    /// Rebuild the registry from the persisted peer list. Every restored peer
    /// starts offline with a probe due.
    pub async fn restore(
        store: Arc<dyn PeerStore>,
        client: PeerClient,
        probe_interval: Duration,
    ) -> Result<Self> {
        let peers = store
            .list_peers()
            .await?
            .into_iter()
            .map(|addr| Peer::new(addr.host, addr.port, probe_interval))
            .collect::<Vec<_>>();
        if !peers.is_empty() {
            tracing::info!(peers = peers.len(), "Restored peer list");
        }
        Ok(Self {
            peers: Arc::new(RwLock::new(peers)),
            store,
            client,
            probe_interval,
        })
    }

    /// Register a peer and persist it.
    pub async fn add(&self, host: &str, port: u16) -> Result<()> {
        let host = normalize_host(host);
        let mut peers = self.peers.write().await;
        if peers.iter().any(|p| p.is(&host, port)) {
            tracing::warn!(peer = %format!("{host}:{port}"), "Peer already registered");
            return Err(MeshError::DuplicatePeer { host, port });
        }
        if let Err(e) = self.store.add_peer(&host, port).await {
            tracing::warn!(peer = %format!("{host}:{port}"), error = %e, "Failed to persist peer");
            return Err(e);
        }
        tracing::info!(peer = %format!("{host}:{port}"), "🌐 Registered peer");
        peers.push(Peer::new(host, port, self.probe_interval));
        Ok(())
    }

    /// Unregister a peer. Unknown peers are ignored with a warning.
    pub async fn remove(&self, host: &str, port: u16) -> Result<()> {
        let host = normalize_host(host);
        let mut peers = self.peers.write().await;
        let Some(index) = peers.iter().position(|p| p.is(&host, port)) else {
            tracing::warn!(peer = %format!("{host}:{port}"), "Peer is not registered");
            return Ok(());
        };
        self.store.remove_peer(&host, port).await?;
        peers.remove(index);
        tracing::info!(peer = %format!("{host}:{port}"), "Removed peer");
        Ok(())
    }

    /// Snapshot of all peers in registration order
    pub async fn list(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn get(&self, host: &str, port: u16) -> Option<Peer> {
        let host = normalize_host(host);
        let peers = self.peers.read().await;
        peers.iter().find(|p| p.is(&host, port)).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Contact the peer's identity endpoint and record the outcome.
    ///
    /// Never fails: any network error or malformed answer marks the peer
    /// offline. Disabled and unknown peers are left alone. The registry lock
    /// is not held while the probe is in flight.
    pub async fn probe(&self, host: &str, port: u16) -> Option<Liveness> {
        let peer = self.get(host, port).await?;
        if peer.liveness == Liveness::Disabled {
            return Some(Liveness::Disabled);
        }

        let outcome = self.client.identity(&peer.base_url()).await;

        let mut peers = self.peers.write().await;
        let entry = peers.iter_mut().find(|p| p.is(&peer.host, peer.port))?;
        entry.last_probe = Some(Utc::now());
        if entry.liveness == Liveness::Disabled {
            return Some(Liveness::Disabled);
        }
        match outcome {
            Ok(uuid) => {
                if entry.uuid != Some(uuid) {
                    tracing::debug!(peer = %entry.address(), uuid = %uuid, "Learned peer identity");
                }
                entry.uuid = Some(uuid);
                entry.liveness = Liveness::Online;
            }
            Err(e) => {
                if entry.liveness == Liveness::Online {
                    tracing::warn!(peer = %entry.address(), error = %e, "Peer is not responding");
                } else {
                    tracing::debug!(peer = %entry.address(), error = %e, "Peer still not responding");
                }
                entry.liveness = Liveness::Offline;
            }
        }
        Some(entry.liveness)
    }

    /// Record an identity learned outside of probing. Disabled and unknown
    /// peers are left alone.
    pub async fn record_identity(&self, host: &str, port: u16, uuid: NodeId) -> Option<Liveness> {
        let host = normalize_host(host);
        let mut peers = self.peers.write().await;
        let peer = peers.iter_mut().find(|p| p.is(&host, port))?;
        if peer.liveness != Liveness::Disabled {
            peer.uuid = Some(uuid);
            peer.liveness = Liveness::Online;
            peer.last_probe = Some(Utc::now());
        }
        Some(peer.liveness)
    }

    /// Record a failed call to a peer outside of probing.
    pub async fn record_failure(&self, host: &str, port: u16) {
        let host = normalize_host(host);
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.iter_mut().find(|p| p.is(&host, port)) {
            if peer.liveness == Liveness::Online {
                peer.liveness = Liveness::Offline;
                peer.last_probe = Some(Utc::now());
            }
        }
    }

    /// Probe the peer if its liveness is stale and return a fresh snapshot.
    pub async fn refresh(&self, peer: &Peer) -> Peer {
        if peer.probe_due() {
            self.probe(&peer.host, peer.port).await;
        }
        self.get(&peer.host, peer.port)
            .await
            .unwrap_or_else(|| peer.clone())
    }

    /// Stop using a peer until it is explicitly enabled again.
    pub async fn disable(&self, host: &str, port: u16) -> bool {
        let host = normalize_host(host);
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.is(&host, port)) {
            Some(peer) => {
                peer.liveness = Liveness::Disabled;
                peer.last_probe = None;
                tracing::info!(peer = %peer.address(), "Disabled peer");
                true
            }
            None => false,
        }
    }

    /// Re-enable a disabled peer and probe it right away.
    pub async fn enable(&self, host: &str, port: u16) -> Option<Liveness> {
        let host = normalize_host(host);
        {
            let mut peers = self.peers.write().await;
            let peer = peers.iter_mut().find(|p| p.is(&host, port))?;
            if peer.liveness == Liveness::Disabled {
                peer.liveness = Liveness::Offline;
                peer.last_probe = None;
                tracing::info!(peer = %peer.address(), "Enabled peer");
            }
        }
        self.probe(&host, port).await
    }
}
