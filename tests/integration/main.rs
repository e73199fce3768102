//! Integration tests for Wharf

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wharf::cache::{ArtifactFetcher, ArtifactRequest, ModuleResolver, ResolutionState};
use wharf::checksum::{self, ChecksumAlgorithm};
use wharf::config::CacheConfig;
use wharf::lock::LockStrategy;
use wharf::metadata::{
    ArtifactId, ArtifactMetadata, MetadataStore, ModuleRevisionId, ModuleRevisionMetadata,
    ResolverMetadata, SerializerKind,
};
use wharf::staleness::StalenessPolicy;
use wharf::{CacheManager, WharfError, WharfResult};

/// In-memory repository that counts requests and simulates latency
#[derive(Default)]
struct MockRepository {
    bodies: HashMap<String, Vec<u8>>,
    checksums: HashMap<String, String>,
    latency: Duration,
    checksum_requests: AtomicUsize,
    body_fetches: AtomicUsize,
}

impl MockRepository {
    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Publish bytes with their correct sha1
    fn publish(mut self, location: &str, body: &[u8]) -> Self {
        let sha1 = checksum::compute_bytes(body, ChecksumAlgorithm::Sha1);
        self.checksums.insert(location.to_string(), sha1);
        self.bodies.insert(location.to_string(), body.to_vec());
        self
    }

    /// Publish bytes without any checksum file
    fn publish_unsigned(mut self, location: &str, body: &[u8]) -> Self {
        self.bodies.insert(location.to_string(), body.to_vec());
        self
    }

    fn fetches(&self) -> usize {
        self.body_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for MockRepository {
    async fn fetch_checksum(
        &self,
        location: &str,
        _algorithm: ChecksumAlgorithm,
    ) -> WharfResult<Option<String>> {
        self.checksum_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.checksums.get(location).cloned())
    }

    async fn fetch(&self, location: &str, dest: &Path) -> WharfResult<u64> {
        self.body_fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let body = self
            .bodies
            .get(location)
            .ok_or_else(|| WharfError::fetch(location, "404 not found"))?;
        tokio::fs::write(dest, body)
            .await
            .map_err(|e| WharfError::io(format!("writing {}", dest.display()), e))?;
        Ok(body.len() as u64)
    }
}

/// Resolver that takes `latency` and resolves to a jar and a pom
struct SlowResolver {
    latency: Duration,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ModuleResolver for SlowResolver {
    async fn resolve_module(&self, id: &ModuleRevisionId) -> WharfResult<Vec<ArtifactMetadata>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(vec![
            ArtifactMetadata::new(ArtifactId::new(id.clone(), id.module(), "jar")?, 1)
                .with_sha1(&checksum::compute_bytes(b"jar bytes", ChecksumAlgorithm::Sha1)),
            ArtifactMetadata::new(ArtifactId::new(id.clone(), id.module(), "pom")?, 1)
                .with_sha1(&checksum::compute_bytes(b"pom bytes", ChecksumAlgorithm::Sha1)),
        ])
    }
}

fn mod64() -> ModuleRevisionId {
    "org6#mod6.4;3".parse().unwrap()
}

async fn open(root: &Path, strategy: LockStrategy) -> CacheManager {
    let mut config = CacheConfig::at(root);
    config.lock_strategy = strategy;
    config.snapshot_timeout = StalenessPolicy::Never;
    CacheManager::open(&config).await.unwrap()
}

fn blob_count(root: &Path) -> usize {
    let filestore = root.join("filestore");
    let Ok(shards) = std::fs::read_dir(filestore) else {
        return 0;
    };
    shards
        .map(|shard| std::fs::read_dir(shard.unwrap().path()).unwrap().count())
        .sum()
}

mod concurrency_tests {
    use super::*;

    async fn resolve_and_materialize(
        cache: Arc<CacheManager>,
        repo: Arc<MockRepository>,
        latency: Duration,
        calls: Arc<AtomicUsize>,
    ) -> WharfResult<ResolutionState> {
        resolve_module_and_materialize(mod64(), cache, repo, latency, calls).await
    }

    async fn resolve_module_and_materialize(
        id: ModuleRevisionId,
        cache: Arc<CacheManager>,
        repo: Arc<MockRepository>,
        latency: Duration,
        calls: Arc<AtomicUsize>,
    ) -> WharfResult<ResolutionState> {
        let resolver = SlowResolver { latency, calls };
        let resolution = cache.resolve_or_fetch(&id, false, &resolver).await?;

        let requests: Vec<_> = resolution
            .metadata
            .artifacts
            .iter()
            .map(|a| {
                ArtifactRequest::new(a.artifact.clone(), a.artifact.file_name())
                    .with_checksum(a.sha1.clone().unwrap_or_default())
            })
            .collect();
        cache.materialize_all(&requests, repo.as_ref()).await?;

        Ok(resolution.state)
    }

    fn repository(latency: Duration) -> Arc<MockRepository> {
        Arc::new(
            MockRepository::with_latency(latency)
                .publish("mod6.4-3.jar", b"jar bytes")
                .publish("mod6.4-3.pom", b"pom bytes"),
        )
    }

    async fn slow_and_fast(strategy: LockStrategy, separate_managers: bool) {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(open(dir.path(), strategy).await);
        let second = if separate_managers {
            Arc::new(open(dir.path(), strategy).await)
        } else {
            Arc::clone(&first)
        };
        let observer = Arc::clone(&second);
        let calls = Arc::new(AtomicUsize::new(0));
        let slow_repo = repository(Duration::from_millis(100));
        let fast_repo = repository(Duration::from_millis(5));

        let slow = tokio::spawn(resolve_and_materialize(
            first,
            Arc::clone(&slow_repo),
            Duration::from_millis(100),
            Arc::clone(&calls),
        ));
        let fast = tokio::spawn(resolve_and_materialize(
            second,
            Arc::clone(&fast_repo),
            Duration::from_millis(5),
            Arc::clone(&calls),
        ));

        assert_eq!(slow.await.unwrap().unwrap(), ResolutionState::ResolvedFresh);
        assert_eq!(fast.await.unwrap().unwrap(), ResolutionState::ResolvedFresh);
        assert_eq!(
            observer.state(&mod64(), false).await.unwrap(),
            ResolutionState::ResolvedFresh
        );

        // One remote resolution and one download per distinct blob
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow_repo.fetches() + fast_repo.fetches(), 2);
        assert_eq!(blob_count(dir.path()), 2);

        let jar = dir.path().join("org6/mod6.4/jars/mod6.4-3.jar");
        assert_eq!(std::fs::read(jar).unwrap(), b"jar bytes");
        let pom = dir.path().join("org6/mod6.4/poms/mod6.4-3.pom");
        assert_eq!(std::fs::read(pom).unwrap(), b"pom bytes");

        // Nothing left half-written
        let tmp = dir.path().join(".wharf/tmp");
        assert_eq!(std::fs::read_dir(tmp).map(|d| d.count()).unwrap_or(0), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_and_fast_resolution_share_one_manager() {
        slow_and_fast(LockStrategy::ExclusiveFile, false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_and_fast_resolution_across_managers() {
        // Separate managers share nothing in memory, like separate processes
        slow_and_fast(LockStrategy::ExclusiveFile, true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_and_fast_resolution_in_process() {
        slow_and_fast(LockStrategy::InProcess, false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_resolution_keeps_artifacts_readable() {
        use std::sync::atomic::AtomicBool;

        let dir = TempDir::new().unwrap();
        let mod62: ModuleRevisionId = "org6#mod6.2;2.0".parse().unwrap();
        let repo = Arc::new(
            MockRepository::with_latency(Duration::from_millis(5))
                .publish("mod6.4-3.jar", b"jar bytes")
                .publish("mod6.4-3.pom", b"pom bytes")
                .publish("mod6.2-2.0.jar", b"jar bytes")
                .publish("mod6.2-2.0.pom", b"pom bytes"),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let warmup = Arc::new(open(dir.path(), LockStrategy::ExclusiveFile).await);
        resolve_and_materialize(
            Arc::clone(&warmup),
            Arc::clone(&repo),
            Duration::from_millis(5),
            Arc::clone(&calls),
        )
        .await
        .unwrap();

        let logical = vec![
            dir.path().join("org6/mod6.4/jars/mod6.4-3.jar"),
            dir.path().join("org6/mod6.4/poms/mod6.4-3.pom"),
        ];
        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut missing = 0;
                while !done.load(Ordering::SeqCst) {
                    for path in &logical {
                        if std::fs::File::open(path).is_err() {
                            missing += 1;
                        }
                    }
                }
                missing
            })
        };

        // Three workers on the same module, each with its own manager, plus
        // an unrelated module sharing the same blobs
        let mut workers = Vec::new();
        for (id, rounds) in [
            (mod64(), 10),
            (mod64(), 20),
            (mod64(), 50),
            (mod62.clone(), 20),
        ] {
            let cache = Arc::new(open(dir.path(), LockStrategy::ExclusiveFile).await);
            let repo = Arc::clone(&repo);
            let calls = Arc::clone(&calls);
            workers.push(tokio::spawn(async move {
                for _ in 0..rounds {
                    let state = resolve_module_and_materialize(
                        id.clone(),
                        Arc::clone(&cache),
                        Arc::clone(&repo),
                        Duration::from_millis(5),
                        Arc::clone(&calls),
                    )
                    .await?;
                    assert_eq!(state, ResolutionState::ResolvedFresh);
                }
                Ok::<(), WharfError>(())
            }));
        }
        for worker in workers {
            worker.await.unwrap().unwrap();
        }
        done.store(true, Ordering::SeqCst);

        assert_eq!(reader.join().unwrap(), 0);
        // One resolution per module, one download per distinct blob
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(repo.fetches(), 2);
        assert_eq!(blob_count(dir.path()), 2);
        let jar = dir.path().join("org6/mod6.2/jars/mod6.2-2.0.jar");
        assert_eq!(std::fs::read(jar).unwrap(), b"jar bytes");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unrelated_modules_resolve_in_parallel() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open(dir.path(), LockStrategy::ExclusiveFile).await);
        let calls = Arc::new(AtomicUsize::new(0));

        let started = std::time::Instant::now();
        let mut tasks = Vec::new();
        for id in ["org6#mod6.4;3", "org6#mod6.2;2.0", "org6#mod6.3;1"] {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                let id: ModuleRevisionId = id.parse().unwrap();
                let resolver = SlowResolver {
                    latency: Duration::from_millis(300),
                    calls,
                };
                cache.resolve_or_fetch(&id, false, &resolver).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_fresh());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Serialized resolution would take at least 900ms
        assert!(started.elapsed() < Duration::from_millis(850));
    }
}

mod integrity_tests {
    use super::*;

    #[tokio::test]
    async fn mismatched_download_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path(), LockStrategy::ExclusiveFile).await;
        let repo = MockRepository::default().publish_unsigned("mod6.4-3.jar", b"tampered bytes");
        let artifact = ArtifactId::new(mod64(), "mod6.4", "jar").unwrap();
        let request = ArtifactRequest::new(artifact.clone(), "mod6.4-3.jar").with_checksum("abc123");

        let err = cache.materialize_artifact(&request, &repo).await.unwrap_err();

        assert!(matches!(err, WharfError::ChecksumMismatch { .. }));
        assert!(err.is_retryable());
        assert!(!cache.content_store().locate("abc123").exists());
        assert!(!cache.content_store().contains("abc123").await.unwrap());
        assert!(!cache.artifact_path(&artifact).exists());
        assert_eq!(blob_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn missing_remote_checksum_skips_download() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path(), LockStrategy::ExclusiveFile).await;
        let repo = MockRepository::default().publish_unsigned("mod6.4-3.jar", b"jar bytes");
        let artifact = ArtifactId::new(mod64(), "mod6.4", "jar").unwrap();

        let err = cache
            .materialize_artifact(&ArtifactRequest::new(artifact, "mod6.4-3.jar"), &repo)
            .await
            .unwrap_err();

        assert!(matches!(err, WharfError::MissingChecksum { .. }));
        assert!(err.hint().is_some());
        assert_eq!(repo.checksum_requests.load(Ordering::SeqCst), 1);
        assert_eq!(repo.fetches(), 0);
        assert_eq!(blob_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn legacy_md5_checksums_verify() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path(), LockStrategy::ExclusiveFile).await;
        let repo = MockRepository::default().publish_unsigned("legacy-1.0.jar", b"old bytes");
        let md5 = checksum::compute_bytes(b"old bytes", ChecksumAlgorithm::Md5);

        let id: ModuleRevisionId = "legacy#legacy;1.0".parse().unwrap();
        let artifact = ArtifactId::new(id, "legacy", "jar").unwrap();
        let request = ArtifactRequest::new(artifact, "legacy-1.0.jar").with_checksum(md5.to_uppercase());

        let path = cache.materialize_artifact(&request, &repo).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"old bytes");
        assert!(cache.content_store().contains(&md5).await.unwrap());
    }

    #[tokio::test]
    async fn store_round_trip_for_varied_contents() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path(), LockStrategy::None).await;
        let store = cache.content_store();

        let samples: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"\n".to_vec(),
            (0..=255u8).collect(),
            vec![0x5A; 1 << 20],
        ];
        for (i, sample) in samples.into_iter().enumerate() {
            let digest = checksum::compute_bytes(&sample, ChecksumAlgorithm::Sha1);
            let body = sample.clone();
            store
                .ensure(&digest, |temp| async move {
                    tokio::fs::write(&temp, &body)
                        .await
                        .map_err(|e| WharfError::io("writing sample", e))?;
                    Ok::<u64, WharfError>(body.len() as u64)
                })
                .await
                .unwrap();

            let dest = dir.path().join("out").join(format!("sample-{}", i));
            store.copy_out(&digest, &dest).await.unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), sample);
        }
    }
}

mod staleness_tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn snapshot_goes_stale_after_midnight() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::at(dir.path());
        config.snapshot_timeout = StalenessPolicy::daily_utc();
        let cache = CacheManager::open(&config).await.unwrap();

        let id: ModuleRevisionId = "org6#mod6.4;3-SNAPSHOT".parse().unwrap();
        assert!(cache.is_changing(&id));

        let resolved_at = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 0).unwrap();
        let mut metadata = ModuleRevisionMetadata::new(id.clone(), vec![]);
        metadata.set_resolved_at(resolved_at);
        cache
            .metadata_store()
            .save_module_revision_metadata(&id, &metadata)
            .await
            .unwrap();

        let policy = cache.policy();
        let last = metadata.last_resolved_millis();
        assert!(!policy.is_stale_at(last, Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap()));
        assert!(policy.is_stale_at(last, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()));

        // Long past that day now: stale as a snapshot, fresh as a release
        assert!(cache.resolve(&id, true).await.unwrap().is_none());
        assert!(cache.resolve(&id, false).await.unwrap().is_some());
        assert_eq!(cache.state(&id, true).await.unwrap(), ResolutionState::ResolvedStale);
    }

    #[tokio::test]
    async fn interval_policy_boundary() {
        let policy = StalenessPolicy::interval_millis(1000);
        let t = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let last = t.timestamp_millis();
        assert!(!policy.is_stale_at(last, t + chrono::Duration::milliseconds(999)));
        assert!(policy.is_stale_at(last, t + chrono::Duration::milliseconds(1001)));
    }
}

mod metadata_tests {
    use super::*;

    #[tokio::test]
    async fn module_metadata_round_trips_through_every_serializer() {
        for kind in [SerializerKind::Json, SerializerKind::Toml, SerializerKind::Binary] {
            let dir = TempDir::new().unwrap();
            let store = MetadataStore::new(dir.path(), kind.build());
            let id: ModuleRevisionId = "org6#mod6.2;2.0".parse().unwrap();
            let record = ModuleRevisionMetadata::new(
                id.clone(),
                vec![
                    ArtifactMetadata::new(ArtifactId::new(id.clone(), "mod6.2", "jar").unwrap(), 4)
                        .with_md5("5d41402abc4b2a76b9719d911017c592")
                        .with_sha1("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
                    ArtifactMetadata::new(ArtifactId::new(id.clone(), "ivy", "ivy").unwrap(), 4),
                ],
            );

            store.save_module_revision_metadata(&id, &record).await.unwrap();
            let loaded = store.get_module_revision_metadata(&id).await.unwrap();
            assert_eq!(loaded.as_ref(), Some(&record), "{} serializer", kind);
            assert_eq!(
                loaded.unwrap().resolver_id_by_sha1("AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D"),
                4
            );
        }
    }

    #[tokio::test]
    async fn resolver_set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let resolvers: HashSet<_> = [
            ResolverMetadata::new("a", "typeA").with_authentication("auth").with_proxy("proxy"),
            ResolverMetadata::new("b", "typeB").with_authentication("authB").with_proxy("proxyB"),
        ]
        .into_iter()
        .collect();

        {
            let cache = open(dir.path(), LockStrategy::ExclusiveFile).await;
            cache.sync_resolvers(&resolvers).await.unwrap();
        }

        let reopened = open(dir.path(), LockStrategy::ExclusiveFile).await;
        assert_eq!(
            reopened.metadata_store().get_resolver_metadata().await.unwrap(),
            resolvers
        );
        assert!(reopened.sync_resolvers(&resolvers).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_cache_root_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let cache = open(dir.path(), LockStrategy::None).await;
        assert!(cache.metadata_store().get_resolver_metadata().await.unwrap().is_empty());
        assert!(cache.lookup(&mod64(), false).await.unwrap().is_none());
        assert_eq!(cache.state(&mod64(), false).await.unwrap(), ResolutionState::Unresolved);
    }
}
