//! Metadata persistence
//!
//! One file per module revision and one resolver-set file per cache root.
//! Writes go to a temporary sibling, are fsynced and then renamed over the
//! target, so a record is either the old one or the new one, and is on disk
//! by the time the call returns.

use crate::error::{WharfError, WharfResult};
use crate::layout;
use crate::metadata::model::{ModuleRevisionId, ModuleRevisionMetadata, ResolverMetadata};
use crate::metadata::serializer::MetadataSerializer;
use crate::store::sync_dir;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Serializer-agnostic store for module and resolver metadata
#[derive(Clone)]
pub struct MetadataStore {
    root: PathBuf,
    serializer: Arc<dyn MetadataSerializer>,
}

impl MetadataStore {
    /// Create a store rooted at a cache root
    pub fn new(root: impl Into<PathBuf>, serializer: Arc<dyn MetadataSerializer>) -> Self {
        Self {
            root: root.into(),
            serializer,
        }
    }

    /// Path of a module revision's record
    pub fn module_path(&self, id: &ModuleRevisionId) -> PathBuf {
        layout::module_metadata_path(&self.root, id, self.serializer.extension())
    }

    /// Path of the resolver set
    pub fn resolvers_path(&self) -> PathBuf {
        layout::resolvers_path(&self.root, self.serializer.extension())
    }

    /// Load a module revision's record, `None` if it was never saved
    pub async fn get_module_revision_metadata(
        &self,
        id: &ModuleRevisionId,
    ) -> WharfResult<Option<ModuleRevisionMetadata>> {
        let path = self.module_path(id);
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(None);
        };

        let record = self
            .serializer
            .decode_module(&bytes)
            .map_err(|reason| WharfError::MetadataCorrupt {
                path: path.clone(),
                reason,
            })?;

        if &record.module != id {
            return Err(WharfError::MetadataCorrupt {
                path,
                reason: format!("record is for {}, expected {}", record.module, id),
            });
        }

        debug!(module = %id, "loaded module metadata");
        Ok(Some(record))
    }

    /// Overwrite a module revision's record
    pub async fn save_module_revision_metadata(
        &self,
        id: &ModuleRevisionId,
        metadata: &ModuleRevisionMetadata,
    ) -> WharfResult<()> {
        if &metadata.module != id {
            return Err(WharfError::Internal(format!(
                "metadata for {} cannot be saved as {}",
                metadata.module, id
            )));
        }

        let bytes = self.serializer.encode_module(metadata)?;
        write_durable(self.module_path(id), bytes).await?;

        debug!(module = %id, artifacts = metadata.artifacts.len(), "saved module metadata");
        Ok(())
    }

    /// Delete a module revision's record; returns whether one existed
    pub async fn remove_module_revision_metadata(&self, id: &ModuleRevisionId) -> WharfResult<bool> {
        let path = self.module_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(module = %id, "removed module metadata");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WharfError::io(
                format!("removing metadata file {}", path.display()),
                e,
            )),
        }
    }

    /// Load the resolver set, empty if none was saved
    pub async fn get_resolver_metadata(&self) -> WharfResult<HashSet<ResolverMetadata>> {
        let path = self.resolvers_path();
        let Some(bytes) = read_if_exists(&path).await? else {
            return Ok(HashSet::new());
        };

        let resolvers = self
            .serializer
            .decode_resolvers(&bytes)
            .map_err(|reason| WharfError::MetadataCorrupt { path, reason })?;

        Ok(resolvers.into_iter().collect())
    }

    /// Overwrite the resolver set
    pub async fn save_resolver_metadata(
        &self,
        resolvers: &HashSet<ResolverMetadata>,
    ) -> WharfResult<()> {
        // Sorted so identical sets produce identical files
        let mut sorted: Vec<ResolverMetadata> = resolvers.iter().cloned().collect();
        sorted.sort();

        let bytes = self.serializer.encode_resolvers(&sorted)?;
        write_durable(self.resolvers_path(), bytes).await?;

        debug!(resolvers = sorted.len(), "saved resolver metadata");
        Ok(())
    }
}

async fn read_if_exists(path: &Path) -> WharfResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WharfError::io(
            format!("reading metadata file {}", path.display()),
            e,
        )),
    }
}

/// Atomically replace `path` with `bytes`, fsyncing before the rename
pub(crate) async fn write_durable(path: PathBuf, bytes: Vec<u8>) -> WharfResult<()> {
    tokio::task::spawn_blocking(move || -> WharfResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| WharfError::Internal(format!("{} has no parent", path.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| WharfError::io(format!("creating directory {}", parent.display()), e))?;

        let mut temp = tempfile::Builder::new()
            .prefix(".wharfdata-")
            .suffix(".tmp")
            .tempfile_in(parent)
            .map_err(|e| WharfError::io(format!("creating temp file in {}", parent.display()), e))?;
        temp.write_all(&bytes)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| WharfError::io(format!("writing {}", path.display()), e))?;
        temp.persist(&path)
            .map_err(|e| WharfError::io(format!("replacing {}", path.display()), e.error))?;

        sync_dir(parent)
    })
    .await
    .map_err(|e| WharfError::Internal(format!("metadata writer task failed: {}", e)))?
}
