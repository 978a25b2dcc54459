//! Resolution engine
//!
//! Peers are asked one at a time in registration order. Every query carries
//! the skip list of peers already consulted in this chain; a peer on the list
//! is never asked again, which bounds a lookup to one query per peer no
//! matter how the mesh is wired.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::PeerClient;
use crate::error::{MeshError, Result};
use crate::object::DataObject;
use crate::peer::{Peer, PeerRegistry};
use crate::store::ObjectStore;
use crate::types::{Identifier, NodeId, ResolveStatus, SkipList};
use crate::codec::CONTAINER_SUFFIX;

/// Result of a lookup across the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found { url: String, skip: SkipList },
    NotFound { skip: SkipList },
}

impl Lookup {
    pub fn skip(&self) -> &SkipList {
        match self {
            Lookup::Found { skip, .. } | Lookup::NotFound { skip } => skip,
        }
    }
}

/// What one consulted peer said
#[derive(Debug)]
enum PeerAnswer {
    Found { url: String, skip: SkipList },
    Miss { skip: SkipList },
    Unreachable(MeshError),
}

#[derive(Clone)]
pub struct Resolver {
    self_id: NodeId,
    registry: PeerRegistry,
    client: PeerClient,
    cache_dir: PathBuf,
}

impl Resolver {
    pub fn new(
        self_id: NodeId,
        registry: PeerRegistry,
        client: PeerClient,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            self_id,
            registry,
            client,
            cache_dir: cache_dir.into(),
        }
    }

    /// Ask peers where `id` can be downloaded from.
    ///
    /// `skip` is extended with our own identity before anyone is asked. Only
    /// peers that were actually queried extend it further; peers passed over
    /// because they are offline or disabled were never asked.
    pub async fn locate(&self, id: &Identifier, mut skip: SkipList) -> Lookup {
        skip.insert(self.self_id);

        for listed in self.registry.list().await {
            if listed.uuid.is_some_and(|uuid| skip.contains(&uuid)) {
                debug!(peer = %listed.address(), "Skipping peer already consulted");
                continue;
            }
            let peer = self.registry.refresh(&listed).await;
            if !peer.is_online() {
                debug!(peer = %peer.address(), liveness = ?peer.liveness, "Passing over peer");
                continue;
            }
            if peer.uuid.is_some_and(|uuid| skip.contains(&uuid)) {
                debug!(peer = %peer.address(), "Skipping peer already consulted");
                continue;
            }

            match self.ask(&peer, id, &skip).await {
                PeerAnswer::Found { url, skip: returned } => {
                    skip.adopt(returned);
                    if let Some(uuid) = peer.uuid {
                        skip.insert(uuid);
                    }
                    debug!(peer = %peer.address(), id = %id, url = %url, "Object located");
                    return Lookup::Found { url, skip };
                }
                PeerAnswer::Miss { skip: returned } => {
                    skip.adopt(returned);
                    if let Some(uuid) = peer.uuid {
                        skip.insert(uuid);
                    }
                }
                PeerAnswer::Unreachable(e) => {
                    warn!(peer = %peer.address(), error = %e, "Peer failed during lookup");
                    self.registry.record_failure(&peer.host, peer.port).await;
                    if let Some(uuid) = peer.uuid {
                        skip.insert(uuid);
                    }
                }
            }
        }

        debug!(id = %id, consulted = skip.len(), "Object not located");
        Lookup::NotFound { skip }
    }

    async fn ask(&self, peer: &Peer, id: &Identifier, skip: &SkipList) -> PeerAnswer {
        match self.client.resolve(&peer.base_url(), id, skip).await {
            Ok(answer) => match (answer.status, answer.url) {
                (ResolveStatus::Found, Some(url)) => PeerAnswer::Found {
                    url,
                    skip: answer.skip,
                },
                _ => PeerAnswer::Miss { skip: answer.skip },
            },
            Err(e) => PeerAnswer::Unreachable(e),
        }
    }

    /// Locate `id`, download its container, verify it and register it.
    ///
    /// A holder whose download fails is left on the skip list and the lookup
    /// continues with the remaining peers. Integrity failures are not
    /// retried. The requested object becomes resident; any other object
    /// bundled in the same container is registered lazily against the
    /// cached copy.
    pub async fn fetch(&self, id: &Identifier, store: &ObjectStore) -> Result<Arc<DataObject>> {
        let mut skip = SkipList::default();
        loop {
            let (url, found) = match self.locate(id, skip.clone()).await {
                Lookup::Found { url, skip } => (url, skip),
                Lookup::NotFound { .. } => return Err(MeshError::NotFound(id.clone())),
            };

            match self.client.download(&url).await {
                Ok(bytes) => return self.admit(id, &url, bytes, store).await,
                Err(e) if e.is_peer_failure() => {
                    warn!(id = %id, url = %url, error = %e, "Download failed, asking remaining peers");
                    if found.len() <= skip.len() {
                        return Err(MeshError::NotFound(id.clone()));
                    }
                    skip = found;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn admit(
        &self,
        id: &Identifier,
        url: &str,
        bytes: Vec<u8>,
        store: &ObjectStore,
    ) -> Result<Arc<DataObject>> {
        let codec = store.codec();
        let object = codec.decode(&bytes)?;
        let actual = object.verified_id()?;
        if actual != id {
            return Err(MeshError::integrity(id, actual));
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let cached = self.cache_dir.join(format!("{}{CONTAINER_SUFFIX}", id.hash()));
        tokio::fs::write(&cached, &bytes).await?;
        for entry in codec.list_entries(&bytes)? {
            if entry.id != *id {
                store
                    .register_lazy(entry.id, url, &cached, entry.internal_path)
                    .await;
            }
        }

        let object = store.register(object).await?;
        info!(id = %id, source = %url, bytes = bytes.len(), "📥 Fetched object from mesh");
        Ok(object)
    }
}
