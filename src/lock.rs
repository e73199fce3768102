//! Per-entry locking
//!
//! Cache entries are locked individually, keyed by what is being populated:
//! a module revision's metadata, one artifact, or one blob. Unrelated entries
//! never contend. Three strategies share the same scoped contract:
//!
//! | Strategy | Excludes | Use |
//! |----------|----------|-----|
//! | `none` | nothing | private, single-user caches |
//! | `in-process` | tasks of this process | one process, many tasks |
//! | `exclusive-file` | tasks and other processes | shared caches |
//!
//! [`LockManager::with_lock`] is reentrant: a task already holding a key runs
//! nested sections for that key immediately.

use crate::error::{WharfError, WharfResult};
use crate::metadata::{ArtifactId, ModuleRevisionId};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

tokio::task_local! {
    static HELD_KEYS: HashSet<String>;
}

/// Locking strategy, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LockStrategy {
    /// No exclusion at all
    None,
    /// Keyed async mutexes, visible to this process only
    InProcess,
    /// Keyed mutexes plus advisory file locks under the cache root
    #[default]
    ExclusiveFile,
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::InProcess => write!(f, "in-process"),
            Self::ExclusiveFile => write!(f, "exclusive-file"),
        }
    }
}

impl FromStr for LockStrategy {
    type Err = WharfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "no-lock" => Ok(Self::None),
            "in-process" => Ok(Self::InProcess),
            "exclusive-file" | "artifact-lock" => Ok(Self::ExclusiveFile),
            _ => Err(WharfError::InvalidSetting {
                setting: "lock_strategy",
                value: s.to_string(),
                reason: "expected none, in-process or exclusive-file".to_string(),
            }),
        }
    }
}

impl TryFrom<String> for LockStrategy {
    type Error = WharfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LockStrategy> for String {
    fn from(strategy: LockStrategy) -> Self {
        strategy.to_string()
    }
}

/// Identity of a lockable cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    name: String,
    path: PathBuf,
}

impl LockKey {
    /// A module revision's metadata record
    pub fn module(id: &ModuleRevisionId) -> Self {
        Self {
            name: id.to_string(),
            path: module_dir(id).join("module.lock"),
        }
    }

    /// One artifact of a module revision
    pub fn artifact(artifact: &ArtifactId) -> Self {
        Self {
            name: artifact.to_string(),
            path: module_dir(artifact.module())
                .join(format!("{}.{}.lock", artifact.file_name(), artifact.kind())),
        }
    }

    /// One content-store blob; `checksum` must already be validated
    pub fn blob(checksum: &str) -> Self {
        let shard = checksum.get(..2).unwrap_or(checksum);
        Self {
            name: format!("blob:{}", checksum),
            path: PathBuf::from(".blobs")
                .join(shard)
                .join(format!("{}.lock", checksum)),
        }
    }

    /// A cache-wide resource such as the resolver set
    pub fn cache_wide(resource: &'static str) -> Self {
        Self {
            name: format!("cache:{}", resource),
            path: PathBuf::from(".cache").join(format!("{}.lock", resource)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock file location, relative to the lock directory
    pub fn relative_path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn module_dir(id: &ModuleRevisionId) -> PathBuf {
    PathBuf::from(id.organisation())
        .join(id.module())
        .join(id.revision())
}

/// Async mutexes by key, created on demand and dropped once nobody holds or awaits them
#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockTable {
    fn handle(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key.to_string()).or_default().clone()
    }

    fn prune(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
            entries.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held lock; released on drop, including when the holding future is cancelled
pub struct LockGuard {
    key: String,
    file: Option<File>,
    permit: Option<OwnedMutexGuard<()>>,
    table: Option<Arc<LockTable>>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        drop(self.permit.take());
        if let Some(table) = self.table.take() {
            table.prune(&self.key);
        }
        trace!(key = %self.key, "lock released");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("file", &self.file.is_some())
            .finish()
    }
}

/// Hands out per-entry locks according to the configured strategy
pub struct LockManager {
    strategy: LockStrategy,
    lock_dir: PathBuf,
    timeout: Option<Duration>,
    table: Arc<LockTable>,
}

impl LockManager {
    /// Create a lock manager; `lock_dir` is only touched by `exclusive-file`
    pub fn new(strategy: LockStrategy, lock_dir: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            strategy,
            lock_dir: lock_dir.into(),
            timeout,
            table: Arc::default(),
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.strategy
    }

    /// Whether the current task is inside `with_lock` for this key
    pub fn held_by_current_task(key: &LockKey) -> bool {
        HELD_KEYS
            .try_with(|held| held.contains(key.name()))
            .unwrap_or(false)
    }

    /// Run `operation` while holding `key`.
    ///
    /// The lock is released when `operation` finishes, fails, or is dropped.
    /// Nested calls for a key the task already holds do not re-acquire.
    pub async fn with_lock<F, T>(&self, key: &LockKey, operation: F) -> WharfResult<T>
    where
        F: Future<Output = WharfResult<T>>,
    {
        if Self::held_by_current_task(key) {
            trace!(key = %key, "lock already held by this task");
            return operation.await;
        }

        let guard = self.acquire(key).await?;
        let mut held = HELD_KEYS.try_with(Clone::clone).unwrap_or_default();
        held.insert(key.name().to_string());

        let result = HELD_KEYS.scope(held, operation).await;
        drop(guard);
        result
    }

    /// Acquire `key`, waiting for other holders.
    ///
    /// Not reentrant; use [`with_lock`](Self::with_lock) for nested sections.
    pub async fn acquire(&self, key: &LockKey) -> WharfResult<LockGuard> {
        let started = Instant::now();
        let guard = match self.strategy {
            LockStrategy::None => LockGuard {
                key: key.name().to_string(),
                file: None,
                permit: None,
                table: None,
            },
            LockStrategy::InProcess => {
                let permit = self.acquire_permit(key, started).await?;
                self.guard(key, permit)
            }
            LockStrategy::ExclusiveFile => {
                let permit = self.acquire_permit(key, started).await?;
                // The permit is dropped (and pruned) if the file lock fails
                let mut guard = self.guard(key, permit);
                guard.file = Some(self.acquire_file(key, started).await?);
                guard
            }
        };

        debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
        Ok(guard)
    }

    /// Acquire `key` only if nobody holds it
    pub async fn try_acquire(&self, key: &LockKey) -> WharfResult<Option<LockGuard>> {
        if self.strategy == LockStrategy::None {
            return self.acquire(key).await.map(Some);
        }

        let mutex = self.table.handle(key.name());
        let permit = match mutex.try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.table.prune(key.name());
                return Ok(None);
            }
        };
        let mut guard = self.guard(key, permit);

        if self.strategy == LockStrategy::InProcess {
            return Ok(Some(guard));
        }

        let file = self.open_lock_file(key).await?;
        match try_lock_file(&file) {
            Ok(true) => {
                guard.file = Some(file);
                Ok(Some(guard))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(WharfError::io(format!("locking {}", key), e)),
        }
    }

    fn guard(&self, key: &LockKey, permit: OwnedMutexGuard<()>) -> LockGuard {
        LockGuard {
            key: key.name().to_string(),
            file: None,
            permit: Some(permit),
            table: Some(Arc::clone(&self.table)),
        }
    }

    async fn acquire_permit(&self, key: &LockKey, started: Instant) -> WharfResult<OwnedMutexGuard<()>> {
        let mutex = self.table.handle(key.name());
        match self.timeout {
            None => Ok(mutex.lock_owned().await),
            Some(limit) => match tokio::time::timeout(limit, mutex.lock_owned()).await {
                Ok(permit) => Ok(permit),
                Err(_) => {
                    self.table.prune(key.name());
                    Err(self.timed_out(key, started))
                }
            },
        }
    }

    async fn acquire_file(&self, key: &LockKey, started: Instant) -> WharfResult<File> {
        let file = self.open_lock_file(key).await?;
        let mut delay = POLL_START;

        loop {
            match try_lock_file(&file) {
                Ok(true) => return Ok(file),
                Ok(false) => {}
                Err(e) => return Err(WharfError::io(format!("locking {}", key), e)),
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    return Err(self.timed_out(key, started));
                }
            }

            trace!(key = %key, "lock held by another process, waiting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    async fn open_lock_file(&self, key: &LockKey) -> WharfResult<File> {
        let path = self.lock_dir.join(key.relative_path());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WharfError::io(format!("creating lock directory {}", parent.display()), e)
            })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| WharfError::io(format!("opening lock file {}", path.display()), e))?;

        Ok(file.into_std().await)
    }

    fn timed_out(&self, key: &LockKey, started: Instant) -> WharfError {
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(key = %key, waited_ms, "gave up waiting for lock");
        WharfError::LockTimeout {
            key: key.name().to_string(),
            waited_ms,
        }
    }
}

/// Non-blocking exclusive lock; `Ok(false)` when another handle holds it
fn try_lock_file(file: &File) -> std::io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}
