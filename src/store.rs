//! Content-addressed blob store
//!
//! A blob lives at a path derived only from its checksum, so identical bytes
//! referenced by different modules are stored once. Blobs are written to a
//! temporary file, verified, then renamed into place: a file visible at a
//! blob's path always hashes to that path's checksum and is never rewritten.

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{WharfError, WharfResult};
use crate::layout;
use crate::lock::{LockKey, LockManager};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, info, warn};

/// Checksum-addressed, write-once blob storage
pub struct ContentStore {
    root: PathBuf,
    tmp_dir: PathBuf,
    algorithm: ChecksumAlgorithm,
    locks: Arc<LockManager>,
    hard_links: bool,
}

impl ContentStore {
    /// Create a store over `root`; in-flight downloads go to `tmp_dir`,
    /// which must be on the same filesystem.
    pub fn new(
        root: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        algorithm: ChecksumAlgorithm,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            root: root.into(),
            tmp_dir: tmp_dir.into(),
            algorithm,
            locks,
            hard_links: true,
        }
    }

    /// Whether `copy_out` may hard-link instead of copying
    pub fn with_hard_links(mut self, enabled: bool) -> Self {
        self.hard_links = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Storage path of a checksum; pure function of the normalized digest
    pub fn locate(&self, checksum: &str) -> PathBuf {
        layout::blob_path(&self.root, &checksum::normalize(checksum))
    }

    /// Whether a blob is stored for `checksum`
    pub async fn contains(&self, checksum: &str) -> WharfResult<bool> {
        let checksum = checksum::normalize(checksum);
        checksum::validate(&checksum)?;
        exists(&layout::blob_path(&self.root, &checksum)).await
    }

    /// Make sure a blob for `checksum` is stored and return its path.
    ///
    /// `producer` is only invoked when the blob is absent. It receives a
    /// temporary path to write the bytes to and returns the number of bytes
    /// written. The bytes are hashed with the algorithm matching the digest
    /// length (the configured one when the length is unknown) and promoted
    /// only if they match. On any failure, including cancellation, the
    /// temporary file is removed.
    pub async fn ensure<F, Fut>(&self, checksum: &str, producer: F) -> WharfResult<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = WharfResult<u64>>,
    {
        let checksum = checksum::normalize(checksum);
        checksum::validate(&checksum)?;
        let target = layout::blob_path(&self.root, &checksum);

        if exists(&target).await? {
            debug!(checksum = %checksum, "content store hit");
            return Ok(target);
        }

        let key = LockKey::blob(&checksum);
        self.locks
            .with_lock(&key, async {
                // Another holder may have promoted it while we waited
                if exists(&target).await? {
                    debug!(checksum = %checksum, "content store hit after wait");
                    return Ok(target.clone());
                }

                debug!(checksum = %checksum, "content store miss, fetching");
                let temp = self.temp_file().await?;
                let written = producer(temp.path().to_path_buf()).await?;

                let algorithm = ChecksumAlgorithm::from_digest(&checksum).unwrap_or(self.algorithm);
                let actual = checksum::compute_file(temp.path(), algorithm).await?;
                if actual != checksum {
                    warn!(
                        expected = %checksum,
                        actual = %actual,
                        algorithm = %algorithm,
                        "checksum mismatch, discarding download"
                    );
                    drop(temp);
                    return Err(WharfError::ChecksumMismatch {
                        expected: checksum.clone(),
                        actual,
                        algorithm: algorithm.to_string(),
                    });
                }

                promote(temp, target.clone()).await?;
                info!(checksum = %checksum, bytes = written, "stored blob");
                Ok(target.clone())
            })
            .await
    }

    /// Place a copy of a stored blob at `dest`, replacing whatever is there.
    ///
    /// Hard-links when enabled and supported; the link then shares the
    /// blob's read-only permissions. Otherwise copies. Either way the new
    /// file is built under a temporary name next to `dest` and renamed over
    /// it, so readers of `dest` see the old file or the new one, never a gap.
    pub async fn copy_out(&self, checksum: &str, dest: &Path) -> WharfResult<()> {
        let checksum = checksum::normalize(checksum);
        checksum::validate(&checksum)?;
        let source = layout::blob_path(&self.root, &checksum);

        if !exists(&source).await? {
            return Err(WharfError::NotFound { checksum });
        }

        let parent = dest
            .parent()
            .ok_or_else(|| WharfError::Internal(format!("{} has no parent", dest.display())))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| WharfError::io(format!("creating directory {}", parent.display()), e))?;

        if self.hard_links && link_via_temp(source.clone(), dest.to_path_buf()).await? {
            debug!(checksum = %checksum, dest = %dest.display(), "linked blob");
            return Ok(());
        }

        copy_via_temp(source, dest.to_path_buf()).await?;
        debug!(checksum = %checksum, dest = %dest.display(), "copied blob");
        Ok(())
    }

    async fn temp_file(&self) -> WharfResult<NamedTempFile> {
        fs::create_dir_all(&self.tmp_dir).await.map_err(|e| {
            WharfError::io(format!("creating directory {}", self.tmp_dir.display()), e)
        })?;
        tempfile::Builder::new()
            .prefix("blob-")
            .suffix(".part")
            .tempfile_in(&self.tmp_dir)
            .map_err(|e| {
                WharfError::io(format!("creating temp file in {}", self.tmp_dir.display()), e)
            })
    }
}

async fn exists(path: &Path) -> WharfResult<bool> {
    fs::try_exists(path)
        .await
        .map_err(|e| WharfError::io(format!("checking {}", path.display()), e))
}

/// Fsync a directory so a rename inside it survives a crash
pub(crate) fn sync_dir(dir: &Path) -> WharfResult<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(|e| WharfError::io(format!("syncing directory {}", dir.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_: &Path, _: &Path) -> bool {
    false
}

/// Hard-link `source` to `dest` through a temporary name, then rename over
/// `dest`. Returns false when the filesystem refuses the link.
async fn link_via_temp(source: PathBuf, dest: PathBuf) -> WharfResult<bool> {
    tokio::task::spawn_blocking(move || -> WharfResult<bool> {
        if same_file(&source, &dest) {
            return Ok(true);
        }

        let parent = dest
            .parent()
            .ok_or_else(|| WharfError::Internal(format!("{} has no parent", dest.display())))?;
        let staging = tempfile::Builder::new()
            .prefix(".wharf-")
            .suffix(".link")
            .tempdir_in(parent)
            .map_err(|e| WharfError::io(format!("creating temp dir in {}", parent.display()), e))?;
        let linked = staging.path().join("blob");

        if let Err(e) = std::fs::hard_link(&source, &linked) {
            debug!(error = %e, "hard link failed, copying instead");
            return Ok(false);
        }
        std::fs::rename(&linked, &dest)
            .map_err(|e| WharfError::io(format!("replacing {}", dest.display()), e))?;
        Ok(true)
    })
    .await
    .map_err(|e| WharfError::Internal(format!("link task failed: {}", e)))?
}

/// Flush, seal and atomically rename a verified download into the store
async fn promote(temp: NamedTempFile, target: PathBuf) -> WharfResult<()> {
    tokio::task::spawn_blocking(move || -> WharfResult<()> {
        let parent = target
            .parent()
            .ok_or_else(|| WharfError::Internal(format!("{} has no parent", target.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| WharfError::io(format!("creating directory {}", parent.display()), e))?;

        temp.as_file()
            .sync_all()
            .map_err(|e| WharfError::io(format!("syncing {}", temp.path().display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o444))
                .map_err(|e| WharfError::io(format!("sealing {}", temp.path().display()), e))?;
        }

        temp.persist(&target)
            .map_err(|e| WharfError::io(format!("promoting {}", target.display()), e.error))?;

        sync_dir(parent)
    })
    .await
    .map_err(|e| WharfError::Internal(format!("blob promotion task failed: {}", e)))?
}

async fn copy_via_temp(source: PathBuf, dest: PathBuf) -> WharfResult<()> {
    tokio::task::spawn_blocking(move || -> WharfResult<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| WharfError::Internal(format!("{} has no parent", dest.display())))?;

        let mut input = std::fs::File::open(&source)
            .map_err(|e| WharfError::io(format!("opening {}", source.display()), e))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".wharf-")
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| WharfError::io(format!("creating temp file in {}", parent.display()), e))?;

        std::io::copy(&mut input, &mut temp)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| WharfError::io(format!("copying to {}", dest.display()), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o644))
                .map_err(|e| WharfError::io(format!("setting mode on {}", temp.path().display()), e))?;
        }

        temp.persist(&dest)
            .map_err(|e| WharfError::io(format!("replacing {}", dest.display()), e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| WharfError::Internal(format!("copy task failed: {}", e)))?
}
