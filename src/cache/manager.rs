//! Cache manager
//!
//! Composes the metadata store, staleness policy, lock manager and content
//! store into get-or-fetch operations for module resolutions and artifacts.

use crate::cache::fetch::{ArtifactFetcher, ArtifactRequest, ModuleResolver};
use crate::cache::state::{CachedResolution, ResolutionState, ResolverDrift};
use crate::checksum;
use crate::config::CacheConfig;
use crate::error::{WharfError, WharfResult};
use crate::layout;
use crate::lock::{LockKey, LockManager};
use crate::metadata::{
    ArtifactId, ArtifactMetadata, MetadataStore, ModuleRevisionId, ModuleRevisionMetadata,
    ResolverMetadata,
};
use crate::staleness::StalenessPolicy;
use crate::store::ContentStore;
use futures_util::future::try_join_all;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

const RESOLVERS_LOCK: &str = "resolvers";

/// Entry point for resolvers using a shared cache root
pub struct CacheManager {
    root: PathBuf,
    metadata: MetadataStore,
    content: ContentStore,
    locks: Arc<LockManager>,
    policy: StalenessPolicy,
    changing_pattern: String,
}

impl CacheManager {
    /// Open (creating if needed) the cache described by `config`
    pub async fn open(config: &CacheConfig) -> WharfResult<Self> {
        let root = config.root();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| WharfError::io(format!("creating cache root {}", root.display()), e))?;

        let locks = Arc::new(LockManager::new(
            config.lock_strategy,
            layout::locks_dir(&root),
            config.lock_timeout(),
        ));
        let content = ContentStore::new(
            layout::filestore_dir(&root),
            layout::tmp_dir(&root),
            config.checksum_algorithm,
            Arc::clone(&locks),
        )
        .with_hard_links(config.hard_links);
        let metadata = MetadataStore::new(&root, config.serializer.build());

        debug!(
            root = %root.display(),
            locking = %config.lock_strategy,
            policy = %config.snapshot_timeout,
            "opened cache"
        );

        Ok(Self {
            root,
            metadata,
            content,
            locks,
            policy: config.snapshot_timeout,
            changing_pattern: config.changing_pattern.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// Whether the revision matches the configured changing pattern
    pub fn is_changing(&self, id: &ModuleRevisionId) -> bool {
        !self.changing_pattern.is_empty() && id.revision().ends_with(&self.changing_pattern)
    }

    /// Logical location of an artifact under the cache root
    pub fn artifact_path(&self, artifact: &ArtifactId) -> PathBuf {
        layout::artifact_path(&self.root, artifact)
    }

    /// Cached resolution of `id` with its staleness verdict, fresh or not.
    ///
    /// Stable revisions are always fresh; the policy only applies when
    /// `is_changing` is set.
    pub async fn lookup(
        &self,
        id: &ModuleRevisionId,
        is_changing: bool,
    ) -> WharfResult<Option<CachedResolution>> {
        let Some(metadata) = self.metadata.get_module_revision_metadata(id).await? else {
            return Ok(None);
        };

        let state = if is_changing && self.policy.is_stale(metadata.last_resolved_millis()) {
            ResolutionState::ResolvedStale
        } else {
            ResolutionState::ResolvedFresh
        };

        Ok(Some(CachedResolution { metadata, state }))
    }

    /// Cached resolution of `id` if it can be used without a remote check
    pub async fn resolve(
        &self,
        id: &ModuleRevisionId,
        is_changing: bool,
    ) -> WharfResult<Option<CachedResolution>> {
        match self.lookup(id, is_changing).await? {
            Some(hit) if hit.is_fresh() => {
                debug!(module = %id, "metadata cache hit");
                Ok(Some(hit))
            }
            Some(_) => {
                debug!(module = %id, policy = %self.policy, "cached metadata is stale");
                Ok(None)
            }
            None => {
                debug!(module = %id, "metadata cache miss");
                Ok(None)
            }
        }
    }

    /// Persist a fresh resolution of `id`, replacing any previous one
    pub async fn record_resolution(
        &self,
        id: &ModuleRevisionId,
        artifacts: Vec<ArtifactMetadata>,
    ) -> WharfResult<ModuleRevisionMetadata> {
        if let Some(stray) = artifacts.iter().find(|a| a.artifact.module() != id) {
            return Err(WharfError::InvalidModuleId {
                value: stray.artifact.to_string(),
                reason: format!("artifact does not belong to {}", id),
            });
        }

        let metadata = ModuleRevisionMetadata::new(id.clone(), artifacts);
        self.locks
            .with_lock(&LockKey::module(id), async {
                self.metadata.save_module_revision_metadata(id, &metadata).await
            })
            .await?;

        info!(module = %id, artifacts = metadata.artifacts.len(), "recorded resolution");
        Ok(metadata)
    }

    /// Refresh the resolved time of `id` after a remote check found no change.
    ///
    /// Returns false when nothing is cached for `id`.
    pub async fn mark_verified(&self, id: &ModuleRevisionId) -> WharfResult<bool> {
        self.locks
            .with_lock(&LockKey::module(id), async {
                let Some(mut metadata) = self.metadata.get_module_revision_metadata(id).await? else {
                    return Ok(false);
                };
                metadata.touch();
                self.metadata.save_module_revision_metadata(id, &metadata).await?;
                debug!(module = %id, "re-verified cached resolution");
                Ok(true)
            })
            .await
    }

    /// Drop the cached resolution of `id`; stored blobs are kept
    pub async fn evict(&self, id: &ModuleRevisionId) -> WharfResult<bool> {
        self.locks
            .with_lock(&LockKey::module(id), async {
                self.metadata.remove_module_revision_metadata(id).await
            })
            .await
    }

    /// Current state of `id`.
    ///
    /// Reports `ResolvingInProgress` while another holder has the module
    /// lock. With the `none` strategy that is never observed.
    pub async fn state(&self, id: &ModuleRevisionId, is_changing: bool) -> WharfResult<ResolutionState> {
        let Some(_guard) = self.locks.try_acquire(&LockKey::module(id)).await? else {
            return Ok(ResolutionState::ResolvingInProgress);
        };

        Ok(match self.lookup(id, is_changing).await? {
            Some(hit) => hit.state,
            None => ResolutionState::Unresolved,
        })
    }

    /// Serve `id` from cache, or resolve it through `resolver` and record it.
    ///
    /// The fresh path takes no lock. Otherwise the module lock is held for
    /// the remote resolution, and the cache is checked again once it is
    /// acquired in case another holder resolved `id` meanwhile.
    pub async fn resolve_or_fetch(
        &self,
        id: &ModuleRevisionId,
        is_changing: bool,
        resolver: &dyn ModuleResolver,
    ) -> WharfResult<CachedResolution> {
        if let Some(hit) = self.resolve(id, is_changing).await? {
            return Ok(hit);
        }

        self.locks
            .with_lock(&LockKey::module(id), async {
                if let Some(hit) = self.resolve(id, is_changing).await? {
                    debug!(module = %id, "resolved by another holder while waiting");
                    return Ok(hit);
                }

                debug!(module = %id, "resolving remotely");
                let artifacts = resolver.resolve_module(id).await?;
                let metadata = self.record_resolution(id, artifacts).await?;
                Ok(CachedResolution {
                    metadata,
                    state: ResolutionState::ResolvedFresh,
                })
            })
            .await
    }

    /// Make a verified copy of an artifact available at its logical path.
    ///
    /// Without a declared checksum the repository's checksum file is
    /// required; if it is missing the artifact body is never fetched.
    pub async fn materialize_artifact(
        &self,
        request: &ArtifactRequest,
        fetcher: &dyn ArtifactFetcher,
    ) -> WharfResult<PathBuf> {
        let algorithm = self.content.algorithm();
        let declared = match &request.expected_checksum {
            Some(declared) => Some(declared.clone()),
            None => fetcher.fetch_checksum(&request.location, algorithm).await?,
        };
        let expected = declared
            .map(|text| checksum::normalize(&text))
            .filter(|digest| !digest.is_empty())
            .ok_or_else(|| WharfError::MissingChecksum {
                location: request.location.clone(),
                algorithm: algorithm.to_string(),
            })?;

        let dest = self.artifact_path(&request.artifact);
        self.locks
            .with_lock(&LockKey::artifact(&request.artifact), async {
                self.content
                    .ensure(&expected, |temp| async move {
                        fetcher.fetch(&request.location, &temp).await
                    })
                    .await?;
                self.content.copy_out(&expected, &dest).await?;
                debug!(artifact = %request.artifact, checksum = %expected, "materialized artifact");
                Ok(dest.clone())
            })
            .await
    }

    /// Materialize several artifacts concurrently; fails on the first error
    pub async fn materialize_all(
        &self,
        requests: &[ArtifactRequest],
        fetcher: &dyn ArtifactFetcher,
    ) -> WharfResult<Vec<PathBuf>> {
        try_join_all(
            requests
                .iter()
                .map(|request| self.materialize_artifact(request, fetcher)),
        )
        .await
    }

    /// Compare the configured resolvers with those recorded for this cache
    /// root, then record the configured set.
    pub async fn sync_resolvers(
        &self,
        current: &HashSet<ResolverMetadata>,
    ) -> WharfResult<ResolverDrift> {
        self.locks
            .with_lock(&LockKey::cache_wide(RESOLVERS_LOCK), async {
                let previous = self.metadata.get_resolver_metadata().await?;
                let drift = ResolverDrift::between(&previous, current);

                if drift.is_empty() {
                    return Ok(drift);
                }
                if !previous.is_empty() {
                    warn!(
                        added = drift.added.len(),
                        removed = drift.removed.len(),
                        "resolver configuration differs from the one recorded in the cache"
                    );
                }

                self.metadata.save_resolver_metadata(current).await?;
                Ok(drift)
            })
            .await
    }
}
