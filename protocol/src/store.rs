//! Local reference table
//!
//! Maps identifiers to objects held in memory (resident) or to objects
//! sitting in a container file on disk that have not been decoded yet (lazy).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::ContainerCodec;
use crate::error::{MeshError, Result};
use crate::object::DataObject;
use crate::types::Identifier;

/// Where a lazily registered object can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyRef {
    /// URL the container was obtained from
    pub source_url: String,
    /// Cached copy of the container
    pub local_path: PathBuf,
    /// Location of the object inside the container
    pub internal_path: String,
}

#[derive(Debug, Clone)]
pub enum LocalRef {
    Resident(Arc<DataObject>),
    Lazy(LazyRef),
}

/// What to do with an object decoded from a lazy reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Keep the decoded object in memory
    #[default]
    Promote,
    /// Keep the reference lazy and decode again on the next access
    Transient,
}

pub struct ObjectStore {
    refs: RwLock<HashMap<Identifier, LocalRef>>,
    codec: Arc<dyn ContainerCodec>,
}

impl ObjectStore {
    pub fn new(codec: Arc<dyn ContainerCodec>) -> Self {
        Self {
            refs: RwLock::new(HashMap::new()),
            codec,
        }
    }

    pub fn codec(&self) -> &Arc<dyn ContainerCodec> {
        &self.codec
    }

    /// Register a sealed object as resident.
    ///
    /// Registering the same content again is a no-op. A payload that does not
    /// hash to its identifier, or a table with a column that does not, is an
    /// integrity violation. The columns of a table become resident too.
    pub async fn register(&self, object: DataObject) -> Result<Arc<DataObject>> {
        let id = object.verified_id()?.clone();
        let object = Arc::new(object);

        let mut refs = self.refs.write().await;
        // Both sides hash to `id`, so they hold the same content.
        if let Some(LocalRef::Resident(existing)) = refs.get(&id) {
            debug!(id = %id, "Object already registered");
            return Ok(existing.clone());
        }

        if let DataObject::Table(table) = object.as_ref() {
            for column in &table.columns {
                let column_id = column.verified_id()?;
                if !matches!(refs.get(column_id), Some(LocalRef::Resident(_))) {
                    refs.insert(
                        column_id.clone(),
                        LocalRef::Resident(Arc::new(DataObject::Leaf(column.clone()))),
                    );
                }
            }
        }

        refs.insert(id.clone(), LocalRef::Resident(object.clone()));
        debug!(id = %id, "Registered resident object");
        Ok(object)
    }

    /// Record where an object can be decoded from later. Reachability of the
    /// file is not checked here. A resident entry is never downgraded.
    pub async fn register_lazy(
        &self,
        id: Identifier,
        source_url: impl Into<String>,
        local_path: impl Into<PathBuf>,
        internal_path: impl Into<String>,
    ) {
        let lazy = LazyRef {
            source_url: source_url.into(),
            local_path: local_path.into(),
            internal_path: internal_path.into(),
        };
        let mut refs = self.refs.write().await;
        if matches!(refs.get(&id), Some(LocalRef::Resident(_))) {
            return;
        }
        debug!(id = %id, path = %lazy.local_path.display(), "Registered lazy reference");
        refs.insert(id, LocalRef::Lazy(lazy));
    }

    /// Register every object inside a container file as a lazy reference.
    pub async fn register_container(
        &self,
        source_url: &str,
        local_path: &Path,
    ) -> Result<Vec<Identifier>> {
        let bytes = tokio::fs::read(local_path).await?;
        let entries = self.codec.list_entries(&bytes)?;
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            self.register_lazy(
                entry.id.clone(),
                source_url,
                local_path,
                entry.internal_path,
            )
            .await;
            ids.push(entry.id);
        }
        info!(
            source = %source_url,
            path = %local_path.display(),
            objects = ids.len(),
            "Registered container"
        );
        Ok(ids)
    }

    /// Look an object up without touching the network.
    ///
    /// Lazy references are decoded from their cached file and checked
    /// against the identifier. If the cached file is gone the stale reference
    /// is dropped and the lookup reports a miss.
    pub async fn resolve_local(
        &self,
        id: &Identifier,
        policy: CachePolicy,
    ) -> Result<Option<Arc<DataObject>>> {
        let entry = self.refs.read().await.get(id).cloned();
        let lazy = match entry {
            None => return Ok(None),
            Some(LocalRef::Resident(object)) => return Ok(Some(object)),
            Some(LocalRef::Lazy(lazy)) => lazy,
        };

        let bytes = match tokio::fs::read(&lazy.local_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    id = %id,
                    path = %lazy.local_path.display(),
                    "Cached container vanished, dropping reference"
                );
                let mut refs = self.refs.write().await;
                if matches!(refs.get(id), Some(LocalRef::Lazy(current)) if *current == lazy) {
                    refs.remove(id);
                }
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let object = self.codec.decode_entry(&bytes, &lazy.internal_path)?;
        let actual = object.verified_id()?;
        if actual != id {
            return Err(MeshError::integrity(id, actual));
        }
        let object = Arc::new(object);

        if policy == CachePolicy::Promote {
            let mut refs = self.refs.write().await;
            if matches!(refs.get(id), Some(LocalRef::Lazy(_))) {
                refs.insert(id.clone(), LocalRef::Resident(object.clone()));
            }
        }
        Ok(Some(object))
    }

    pub async fn has(&self, id: &Identifier) -> bool {
        self.refs.read().await.contains_key(id)
    }

    pub async fn is_resident(&self, id: &Identifier) -> bool {
        matches!(self.refs.read().await.get(id), Some(LocalRef::Resident(_)))
    }

    pub async fn remove(&self, id: &Identifier) -> bool {
        self.refs.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.refs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.refs.read().await.is_empty()
    }

    pub async fn identifiers(&self) -> Vec<Identifier> {
        self.refs.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{internal_path, JsonContainerCodec};
    use crate::object::{LeafObject, TableObject};
    use tempfile::TempDir;

    fn store() -> ObjectStore {
        ObjectStore::new(Arc::new(JsonContainerCodec))
    }

    fn leaf(name: &str) -> DataObject {
        DataObject::from(LeafObject::new(name, name, "m", vec![1.0, 2.0, 3.0]).seal())
    }

    async fn write_container(dir: &TempDir, object: &DataObject) -> PathBuf {
        let path = dir.path().join("container.kmc");
        let bytes = JsonContainerCodec.encode(object).unwrap();
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = store();
        let object = leaf("x");
        let id = object.id().unwrap().clone();

        store.register(object.clone()).await.unwrap();
        store.register(object).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.is_resident(&id).await);
    }

    #[tokio::test]
    async fn test_register_rejects_forged_payload() {
        let store = store();
        let DataObject::Leaf(mut forged) = leaf("x") else { unreachable!() };
        forged.data = vec![9.0];

        let err = store.register(DataObject::Leaf(forged)).await.unwrap_err();
        assert!(matches!(err, MeshError::Integrity { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_nan_object_twice() {
        let store = store();
        let object = DataObject::from(LeafObject::new("n", "n", "", vec![f64::NAN, 1.0]).seal());

        let first = store.register(object.clone()).await.unwrap();
        let second = store.register(object).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_table_with_forged_column() {
        let store = store();
        let victim = leaf("victim");
        let victim_id = victim.id().unwrap().clone();
        let mut table =
            TableObject::new("t", "t", vec![LeafObject::new("evil", "e", "", vec![6.0])]).seal();
        table.columns[0].id = Some(victim_id.clone());
        table.id = Some(table.compute_id());

        let err = store.register(table.into()).await.unwrap_err();
        assert!(matches!(err, MeshError::Integrity { .. }));
        assert!(!store.has(&victim_id).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_table_makes_columns_resident() {
        let store = store();
        let table = DataObject::from(
            TableObject::new("t", "t", vec![LeafObject::new("a", "a", "", vec![1.0])]).seal(),
        );
        let DataObject::Table(inner) = &table else { unreachable!() };
        let column_id = inner.columns[0].id.clone().unwrap();

        store.register(table).await.unwrap();
        assert!(store.is_resident(&column_id).await);
    }

    #[tokio::test]
    async fn test_lazy_reference_promotion() {
        let dir = TempDir::new().unwrap();
        let object = leaf("lazy");
        let id = object.id().unwrap().clone();
        let path = write_container(&dir, &object).await;

        let store = store();
        store
            .register_lazy(id.clone(), "http://peer/fetch/a.kmc", &path, internal_path(&id))
            .await;
        assert!(store.has(&id).await);
        assert!(!store.is_resident(&id).await);

        let first = store.resolve_local(&id, CachePolicy::Transient).await.unwrap();
        assert_eq!(first.as_deref(), Some(&object));
        assert!(!store.is_resident(&id).await);

        let second = store.resolve_local(&id, CachePolicy::Promote).await.unwrap();
        assert_eq!(second.as_deref(), Some(&object));
        assert!(store.is_resident(&id).await);
    }

    #[tokio::test]
    async fn test_lazy_reference_with_missing_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let object = leaf("gone");
        let id = object.id().unwrap().clone();

        let store = store();
        store
            .register_lazy(id.clone(), "http://peer/x", dir.path().join("missing.kmc"), internal_path(&id))
            .await;

        assert!(store.resolve_local(&id, CachePolicy::Promote).await.unwrap().is_none());
        assert!(!store.has(&id).await);
    }

    #[tokio::test]
    async fn test_lazy_reference_under_wrong_identifier() {
        let dir = TempDir::new().unwrap();
        let object = leaf("real");
        let real_id = object.id().unwrap().clone();
        let path = write_container(&dir, &object).await;

        let claimed: Identifier = "deadbeef:leaf".parse().unwrap();
        let store = store();
        store
            .register_lazy(claimed.clone(), "http://peer/x", &path, internal_path(&real_id))
            .await;

        let err = store.resolve_local(&claimed, CachePolicy::Promote).await.unwrap_err();
        assert!(matches!(err, MeshError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_register_container_lists_all_objects() {
        let dir = TempDir::new().unwrap();
        let table = DataObject::from(
            TableObject::new(
                "t",
                "t",
                vec![
                    LeafObject::new("a", "a", "", vec![1.0]),
                    LeafObject::new("b", "b", "", vec![2.0]),
                ],
            )
            .seal(),
        );
        let path = write_container(&dir, &table).await;

        let store = store();
        let ids = store.register_container("file://local", &path).await.unwrap();
        assert_eq!(ids.len(), 3);

        let root = store
            .resolve_local(table.id().unwrap(), CachePolicy::Promote)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*root, table);
    }
}
