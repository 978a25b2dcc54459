//! Transfer staging area
//!
//! Containers produced to answer a location query are written to a
//! temporary directory that lives as long as the server. Each file is
//! handed out once and deleted; whatever is left is removed on teardown.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{ContainerCodec, CONTAINER_SUFFIX};
use crate::error::{MeshError, Result};
use crate::object::DataObject;

const STAGED_PREFIX: &str = "staged-";

/// Suffixes a staged file may carry
pub const SUFFIX_ALLOW_LIST: &[&str] = &[CONTAINER_SUFFIX];

#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

pub struct StagingArea {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
    staged: Mutex<HashMap<String, StagedFile>>,
}

/// Reject anything that is not a plain file name with an allowed suffix.
pub fn validate_filename(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    let allowed = SUFFIX_ALLOW_LIST.iter().any(|s| name.ends_with(s));
    if plain && allowed && !name.contains("..") {
        Ok(())
    } else {
        Err(MeshError::StagedFileNotFound(name.to_string()))
    }
}

impl StagingArea {
    /// Create a fresh directory named `<prefix>XXXX` under the system temp dir.
    pub fn create(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        info!(path = %path.display(), "Created staging area");
        Ok(Self {
            path,
            dir: Mutex::new(Some(dir)),
            staged: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode `object` into a uniquely named file. Returns the file name.
    pub async fn stage(&self, codec: &dyn ContainerCodec, object: &DataObject) -> Result<String> {
        if self.dir.lock().await.is_none() {
            return Err(MeshError::ServerNotRunning);
        }
        let bytes = codec.encode(object)?;
        let name = format!("{STAGED_PREFIX}{}{CONTAINER_SUFFIX}", uuid::Uuid::new_v4().simple());
        let path = self.path.join(&name);
        tokio::fs::write(&path, bytes).await?;

        self.staged.lock().await.insert(
            name.clone(),
            StagedFile {
                path: path.clone(),
                created_at: Utc::now(),
            },
        );
        debug!(file = %name, "Staged container");
        Ok(name)
    }

    /// Hand out a staged file exactly once.
    ///
    /// The file is claimed before it is read, so a concurrent second request
    /// for the same name is a miss. The file is deleted once read.
    pub async fn consume(&self, name: &str) -> Result<Vec<u8>> {
        validate_filename(name)?;
        let staged = self
            .staged
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| MeshError::StagedFileNotFound(name.to_string()))?;

        if staged.path.parent() != Some(self.path.as_path()) {
            return Err(MeshError::StagedFileNotFound(name.to_string()));
        }

        let bytes = tokio::fs::read(&staged.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MeshError::StagedFileNotFound(name.to_string())
            } else {
                e.into()
            }
        })?;
        if let Err(e) = tokio::fs::remove_file(&staged.path).await {
            warn!(file = %staged.path.display(), error = %e, "Cannot delete staged file");
        }
        debug!(file = %name, bytes = bytes.len(), "Consumed staged container");
        Ok(bytes)
    }

    /// Files staged but not yet downloaded
    pub async fn pending(&self) -> Vec<StagedFile> {
        self.staged.lock().await.values().cloned().collect()
    }

    /// Remove the directory and every file left in it. Failures are logged,
    /// never raised.
    pub async fn teardown(&self) {
        self.staged.lock().await.clear();
        let Some(dir) = self.dir.lock().await.take() else {
            return;
        };
        debug!(path = %self.path.display(), "Deleting staging area");
        if let Err(e) = dir.close() {
            warn!(path = %self.path.display(), error = %e, "Failed to delete staging area");
        }
    }
}
