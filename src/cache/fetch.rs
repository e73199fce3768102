//! Remote collaborators
//!
//! The cache never talks to a network itself. Resolvers hand it module
//! resolutions through [`ModuleResolver`] and artifact bytes through
//! [`ArtifactFetcher`]; transport, retries and repository formats are theirs.

use crate::checksum::ChecksumAlgorithm;
use crate::error::{WharfError, WharfResult};
use crate::metadata::{ArtifactId, ArtifactMetadata, ModuleRevisionId};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Source of artifact bytes and their published checksums
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Checksum text published for `location`, or `None` when the repository has none
    async fn fetch_checksum(
        &self,
        location: &str,
        algorithm: ChecksumAlgorithm,
    ) -> WharfResult<Option<String>>;

    /// Write the bytes at `location` to `dest` and return how many were written
    async fn fetch(&self, location: &str, dest: &Path) -> WharfResult<u64>;
}

/// Performs remote resolution of one module revision
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    /// Resolve `id` against the remote repositories
    async fn resolve_module(&self, id: &ModuleRevisionId) -> WharfResult<Vec<ArtifactMetadata>>;
}

/// One artifact to materialize into the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub artifact: ArtifactId,
    /// Remote location understood by the fetcher
    pub location: String,
    /// Declared checksum; fetched from the repository when absent
    pub expected_checksum: Option<String>,
}

impl ArtifactRequest {
    pub fn new(artifact: ArtifactId, location: impl Into<String>) -> Self {
        Self {
            artifact,
            location: location.into(),
            expected_checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }
}

/// Fetcher for a repository laid out on a local or mounted filesystem.
///
/// Locations are paths relative to the repository root; checksums are read
/// from sibling `<file>.<algorithm>` files.
#[derive(Debug, Clone)]
pub struct FileRepositoryFetcher {
    root: PathBuf,
}

impl FileRepositoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> WharfResult<PathBuf> {
        let relative = Path::new(location);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(WharfError::fetch(location, "location escapes the repository root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactFetcher for FileRepositoryFetcher {
    async fn fetch_checksum(
        &self,
        location: &str,
        algorithm: ChecksumAlgorithm,
    ) -> WharfResult<Option<String>> {
        let path = self.resolve(&format!("{}.{}", location, algorithm.file_extension()))?;
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(location, %algorithm, "no checksum file published");
                Ok(None)
            }
            Err(e) => Err(WharfError::fetch(location, e.to_string())),
        }
    }

    async fn fetch(&self, location: &str, dest: &Path) -> WharfResult<u64> {
        let path = self.resolve(location)?;
        fs::copy(&path, dest)
            .await
            .map_err(|e| WharfError::fetch(location, e.to_string()))
    }
}
