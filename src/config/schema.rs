//! Configuration schema for Wharf
//!
//! Configuration is stored at `~/.config/wharf/config.toml`

use crate::checksum::ChecksumAlgorithm;
use crate::lock::LockStrategy;
use crate::metadata::SerializerKind;
use crate::staleness::StalenessPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache settings
    pub cache: CacheConfig,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; defaults to the platform cache directory
    pub root: Option<PathBuf>,

    /// When cached changing revisions are re-checked
    pub snapshot_timeout: StalenessPolicy,

    /// How concurrent writers to one entry are excluded
    pub lock_strategy: LockStrategy,

    /// Give up waiting for an entry lock after this many milliseconds
    pub lock_timeout_ms: Option<u64>,

    /// Digest used when a checksum's algorithm cannot be inferred
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Metadata record encoding
    pub serializer: SerializerKind,

    /// Revision suffix that marks a revision as changing
    pub changing_pattern: String,

    /// Try hard links before copying artifacts out of the store
    pub hard_links: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            snapshot_timeout: StalenessPolicy::default(),
            lock_strategy: LockStrategy::default(),
            lock_timeout_ms: None,
            checksum_algorithm: ChecksumAlgorithm::default(),
            serializer: SerializerKind::default(),
            changing_pattern: "-SNAPSHOT".to_string(),
            hard_links: true,
        }
    }
}

impl CacheConfig {
    /// Config rooted at a specific directory, everything else default
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Effective cache root
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("wharf")
        })
    }

    /// Lock wait bound, if any
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}
