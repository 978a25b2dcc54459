use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::client::PeerClient;
use crate::codec::{ContainerCodec, JsonContainerCodec};
use crate::config::NodeConfig;
use crate::error::{MeshError, Result};
use crate::object::DataObject;
use crate::peer::PeerRegistry;
use crate::persist::{JsonFilePeerStore, PeerAddress, PeerStore};
use crate::resolve::Resolver;
use crate::routes::{self, ServerState};
use crate::staging::StagingArea;
use crate::store::{CachePolicy, ObjectStore};
use crate::types::*;

struct RunningServer {
    addr: SocketAddr,
    base_url: String,
    advertised: PeerAddress,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    staging: Arc<StagingArea>,
}

/// A knowledge node: local object store, peer registry and resolver, plus
/// the HTTP server that lets peers query it.
///
/// The node is a client as soon as it is built. Peers can only reach it
/// between [`start`](Self::start) and [`stop`](Self::stop).
pub struct KnowledgeNode {
    config: NodeConfig,
    uuid: NodeId,
    store: Arc<ObjectStore>,
    registry: PeerRegistry,
    resolver: Resolver,
    client: PeerClient,
    queries: Arc<AtomicU64>,
    server: Mutex<Option<RunningServer>>,
}

impl KnowledgeNode {
    pub async fn new(
        config: NodeConfig,
        codec: Arc<dyn ContainerCodec>,
        peer_store: Arc<dyn PeerStore>,
    ) -> Result<Self> {
        let uuid = NodeId::new_v4();
        let client = PeerClient::new(config.request_timeout(), config.probe_timeout())?;
        let registry =
            PeerRegistry::restore(peer_store, client.clone(), config.probe_interval()).await?;

        for seed in config.seed_addresses()? {
            match registry.add(&seed.host, seed.port).await {
                Ok(()) | Err(MeshError::DuplicatePeer { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let resolver = Resolver::new(uuid, registry.clone(), client.clone(), config.cache_dir());
        tracing::info!(
            uuid = %uuid,
            peers = registry.len().await,
            data_dir = %config.data_dir.display(),
            "🧠 Knowledge node ready"
        );

        Ok(Self {
            config,
            uuid,
            store: Arc::new(ObjectStore::new(codec)),
            registry,
            resolver,
            client,
            queries: Arc::new(AtomicU64::new(0)),
            server: Mutex::new(None),
        })
    }

    /// Node with the JSON container codec and a peer list persisted under
    /// the configured data directory
    pub async fn open(config: NodeConfig) -> Result<Self> {
        let peer_store = Arc::new(JsonFilePeerStore::new(config.peers_file()));
        Self::new(config, Arc::new(JsonContainerCodec), peer_store).await
    }

    pub fn uuid(&self) -> NodeId {
        self.uuid
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Contact a remote node and register it as a peer.
    ///
    /// With `share` set and the server running, the remote is asked to
    /// register this node back. Nothing is registered if the remote cannot
    /// be reached. Registering a known peer only refreshes its identity.
    pub async fn register_peer(&self, host: &str, port: u16, share: bool) -> Result<NodeId> {
        let remote = PeerAddress::new(host, port);
        let base_url = format!("http://{remote}");
        let advertised = if share {
            self.server.lock().await.as_ref().map(|s| s.advertised.clone())
        } else {
            None
        };

        let uuid = match &advertised {
            Some(callback) => self.client.introduce(&base_url, callback).await?,
            None => {
                if share {
                    tracing::warn!(peer = %remote, "Server not running, cannot share this node");
                }
                self.client.identity(&base_url).await?
            }
        };

        match self.registry.add(host, port).await {
            Ok(()) | Err(MeshError::DuplicatePeer { .. }) => {}
            Err(e) => return Err(e),
        }
        self.registry.record_identity(host, port, uuid).await;
        tracing::info!(peer = %remote, uuid = %uuid, shared = advertised.is_some(), "🤝 Peer connected");
        Ok(uuid)
    }

    /// Return the object for `id`, asking the mesh if it is not held locally.
    pub async fn get(&self, id: &Identifier) -> Result<Arc<DataObject>> {
        if let Some(object) = self.store.resolve_local(id, CachePolicy::Promote).await? {
            return Ok(object);
        }
        tracing::debug!(id = %id, "Not held locally, asking peers");
        self.resolver.fetch(id, &self.store).await
    }

    /// Make an object available to peers. Unsealed objects are sealed first.
    pub async fn publish(&self, object: DataObject) -> Result<Identifier> {
        let object = if object.id().is_none() {
            object.seal()
        } else {
            object
        };
        let object = self.store.register(object).await?;
        let id = object.verified_id()?.clone();
        tracing::info!(id = %id, name = %object.longname(), "Published object");
        Ok(id)
    }

    /// Make every object inside a container file available to peers.
    pub async fn publish_file(&self, path: &Path) -> Result<Vec<Identifier>> {
        let path = tokio::fs::canonicalize(path).await?;
        let source_url = format!("file://{}", path.display());
        self.store.register_container(&source_url, &path).await
    }

    /// Start serving peer requests, replacing a server that is already
    /// running. Returns the bound address; port 0 picks a free port.
    pub async fn start(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.take() {
            tracing::info!(addr = %running.addr, "Restarting server");
            self.shutdown(running).await;
        }

        let listener = tokio::net::TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let advertised = PeerAddress::new(self.advertised_host(host), addr.port());
        let base_url = format!("http://{advertised}");
        let staging = Arc::new(StagingArea::create(&self.config.staging_prefix)?);

        let state = Arc::new(ServerState {
            uuid: self.uuid,
            base_url: base_url.clone(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            staging: staging.clone(),
            queries: self.queries.clone(),
        });
        let app = routes::create_router(state);

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    signal.await.ok();
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Server failed");
            }
        });

        tracing::info!(addr = %addr, base_url = %base_url, "🚀 Serving peers");
        *server = Some(RunningServer {
            addr,
            base_url,
            advertised,
            shutdown,
            handle,
            staging,
        });
        Ok(addr)
    }

    /// Stop serving and delete the staging area. Stopping a node that is not
    /// running only logs a warning.
    pub async fn stop(&self) {
        let Some(running) = self.server.lock().await.take() else {
            tracing::warn!("Stop requested but server is not running");
            return;
        };
        self.shutdown(running).await;
    }

    async fn shutdown(&self, running: RunningServer) {
        let RunningServer {
            addr,
            shutdown,
            mut handle,
            staging,
            ..
        } = running;

        shutdown.send(()).ok();
        let grace = self.config.stop_grace();
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!(addr = %addr, grace_secs = grace.as_secs(), "Server did not stop in time, aborting");
            handle.abort();
        }
        staging.teardown().await;
        tracing::info!(addr = %addr, "Server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    /// Base URL peers reach this node under
    pub async fn base_url(&self) -> Result<String> {
        self.server
            .lock()
            .await
            .as_ref()
            .map(|s| s.base_url.clone())
            .ok_or(MeshError::ServerNotRunning)
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            uuid: self.uuid,
            base_url: self.base_url().await.ok(),
            objects: self.store.len().await,
            resolve_queries: self.queries.load(std::sync::atomic::Ordering::Relaxed),
            peers: self.registry.list().await,
        }
    }

    fn advertised_host(&self, host: &str) -> String {
        if let Some(public) = &self.config.public_host {
            return public.clone();
        }
        match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => "127.0.0.1".to_string(),
            _ => host.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LeafObject;
    use crate::persist::MemoryPeerStore;
    use tempfile::TempDir;

    async fn node(dir: &TempDir) -> KnowledgeNode {
        let config = NodeConfig::with_data_dir(dir.path());
        KnowledgeNode::new(config, Arc::new(JsonContainerCodec), Arc::new(MemoryPeerStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_binds_free_port_and_stop_cleans_up() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        assert!(!node.is_running().await);
        assert!(matches!(node.base_url().await, Err(MeshError::ServerNotRunning)));

        let addr = node.start("127.0.0.1", 0).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(node.is_running().await);
        assert_eq!(node.base_url().await.unwrap(), format!("http://127.0.0.1:{}", addr.port()));

        node.stop().await;
        assert!(!node.is_running().await);
        // Stopping twice only warns.
        node.stop().await;
    }

    #[tokio::test]
    async fn test_restart_replaces_server() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        node.start("127.0.0.1", 0).await.unwrap();
        let second = node.start("127.0.0.1", 0).await.unwrap();
        assert!(node.is_running().await);
        assert_eq!(node.base_url().await.unwrap(), format!("http://127.0.0.1:{}", second.port()));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_publish_then_get_is_local() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let leaf = LeafObject::new("Temperature", "T", "K", vec![293.0, 294.5]);

        let id = node.publish(leaf.into()).await.unwrap();
        let object = node.get(&id).await.unwrap();
        assert_eq!(object.longname(), "Temperature");
        assert_eq!(node.status().await.objects, 1);
    }

    #[tokio::test]
    async fn test_get_without_peers_is_not_found() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let id = Identifier::new("deadbeef", ObjectKind::Leaf);
        assert!(matches!(node.get(&id).await, Err(MeshError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_seed_peers_are_registered_once() {
        let dir = TempDir::new().unwrap();
        let mut config = NodeConfig::with_data_dir(dir.path());
        config.seed_peers = vec!["alpha:1".into(), "alpha:1".into(), "beta:2".into()];
        let node = KnowledgeNode::open(config).await.unwrap();
        assert_eq!(node.registry().len().await, 2);
        assert!(dir.path().join("peers.json").exists());
    }

    #[tokio::test]
    async fn test_register_unreachable_peer_registers_nothing() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir).await;
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = node.register_peer("127.0.0.1", port, false).await.unwrap_err();
        assert!(matches!(err, MeshError::Unreachable { .. }));
        assert!(node.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_register_peer_without_server_does_not_share() {
        let dir = TempDir::new().unwrap();
        let local = node(&dir).await;
        let remote_dir = TempDir::new().unwrap();
        let remote = node(&remote_dir).await;
        let addr = remote.start("127.0.0.1", 0).await.unwrap();

        let uuid = local.register_peer("127.0.0.1", addr.port(), true).await.unwrap();
        assert_eq!(uuid, remote.uuid());
        assert!(local.registry().get("127.0.0.1", addr.port()).await.unwrap().is_online());
        assert!(remote.registry().is_empty().await);
        remote.stop().await;
    }
}
