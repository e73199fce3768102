//! Error types for Wharf
//!
//! All modules use `WharfResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Wharf operations
pub type WharfResult<T> = Result<T, WharfError>;

/// All errors that can occur in Wharf
#[derive(Error, Debug)]
pub enum WharfError {
    // Integrity errors
    #[error("Checksum mismatch ({algorithm}): expected {expected}, computed {actual}")]
    ChecksumMismatch {
        expected: String,
        actual: String,
        algorithm: String,
    },

    #[error("Remote {algorithm} checksum not found for {location}")]
    MissingChecksum { location: String, algorithm: String },

    #[error("Invalid checksum: {0:?}")]
    InvalidChecksum(String),

    // Content store errors
    #[error("No stored content for checksum {checksum}")]
    NotFound { checksum: String },

    // Lock errors
    #[error("Timed out after {waited_ms}ms waiting for lock on {key}")]
    LockTimeout { key: String, waited_ms: u64 },

    // Identity errors
    #[error("Invalid module identity {value:?}: {reason}")]
    InvalidModuleId { value: String, reason: String },

    // Configuration errors
    #[error("Invalid {setting} value {value:?}: {reason}")]
    InvalidSetting {
        setting: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Metadata errors
    #[error("Corrupt metadata record {path}: {reason}")]
    MetadataCorrupt { path: PathBuf, reason: String },

    // Remote collaborator errors
    #[error("Fetch of {location} failed: {reason}")]
    Fetch { location: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Binary encoding error: {0}")]
    Binary(#[from] bcs::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WharfError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a fetch error for a remote location
    pub fn fetch(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Check if the caller may reasonably retry the failed operation.
    ///
    /// The cache itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::LockTimeout { .. } | Self::Fetch { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ChecksumMismatch { .. } => {
                Some("The download was discarded. Retry the fetch or check the remote repository")
            }
            Self::MissingChecksum { .. } => {
                Some("Publish checksum files next to the artifact; unverified artifacts are never cached")
            }
            Self::LockTimeout { .. } => {
                Some("Another process holds the cache entry. Raise cache.lock_timeout_ms or retry")
            }
            Self::MetadataCorrupt { .. } => {
                Some("Evict the module from the cache to force re-resolution")
            }
            _ => None,
        }
    }
}
