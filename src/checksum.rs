//! Checksum computation and normalization
//!
//! Artifacts are addressed by the hex digest of their bytes. Remote
//! repositories publish these digests as small text files whose format
//! varies from server to server, so everything read from the outside goes
//! through [`normalize`] before it is compared or used as a storage key.

use crate::error::{WharfError, WharfResult};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// 160-bit SHA-1, what Maven and Ivy repositories publish as `.sha1`
    #[default]
    Sha1,
    /// 128-bit MD5, accepted for legacy repositories
    Md5,
    /// 256-bit SHA-256
    Sha256,
}

impl ChecksumAlgorithm {
    /// Length of a hex digest produced by this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }

    /// Extension of the checksum file published next to an artifact
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Guess the algorithm that produced a hex digest from its length
    pub fn from_digest(digest: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|algo| algo.hex_len() == digest.len())
    }

    fn all() -> &'static [Self] {
        &[Self::Sha1, Self::Md5, Self::Sha256]
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Md5 => Hasher::Md5(Md5::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_extension())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = WharfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            _ => Err(WharfError::InvalidSetting {
                setting: "checksum_algorithm",
                value: s.to_string(),
                reason: "expected one of sha1, md5, sha256".to_string(),
            }),
        }
    }
}

enum Hasher {
    Sha1(Sha1),
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(bytes),
            Self::Md5(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash an in-memory byte slice
pub fn compute_bytes(bytes: &[u8], algorithm: ChecksumAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(bytes);
    hasher.finalize_hex()
}

/// Hash a file's contents, streaming it in fixed-size chunks
pub async fn compute_file(path: &Path, algorithm: ChecksumAlgorithm) -> WharfResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| WharfError::io(format!("opening {} for hashing", path.display()), e))?;

    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| WharfError::io(format!("reading {} for hashing", path.display()), e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize_hex())
}

/// Canonicalize checksum text read from a remote checksum file.
///
/// Trims, lowercases and, when the text carries a filename alongside the
/// digest (`<digest>  file.jar`, `file.jar: <digest>`, `SHA1(file.jar)= <digest>`),
/// keeps only the digest token. Best effort: text with no recognizable digest
/// token collapses to its first token.
pub fn normalize(raw: &str) -> String {
    let text = raw.trim().to_ascii_lowercase();
    let mut tokens = text
        .split(|c: char| c.is_whitespace() || matches!(c, '=' | ':' | '(' | ')' | '*'))
        .filter(|t| !t.is_empty());

    let first = match tokens.next() {
        Some(first) => first,
        None => return String::new(),
    };

    if looks_like_digest(first) {
        return first.to_string();
    }

    tokens
        .find(|t| looks_like_digest(t))
        .unwrap_or(first)
        .to_string()
}

/// Compare two digests after normalizing both sides
pub fn matches(left: &str, right: &str) -> bool {
    let left = normalize(left);
    !left.is_empty() && left == normalize(right)
}

/// Check that a normalized digest is usable as a storage key
pub fn validate(digest: &str) -> WharfResult<()> {
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WharfError::InvalidChecksum(digest.to_string()));
    }
    Ok(())
}

fn looks_like_digest(token: &str) -> bool {
    ChecksumAlgorithm::from_digest(token).is_some() && token.chars().all(|c| c.is_ascii_hexdigit())
}
