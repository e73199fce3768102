//! On-disk layout of a cache root
//!
//! ```text
//! <root>/
//!   filestore/<ab>/<abcdef...>              content-addressed blobs
//!   <org>/<module>/wharfdata-<rev>.<ext>    module revision metadata
//!   <org>/<module>/<type>s/<file>           logical artifact copies
//!   .wharf/resolvers.<ext>                  resolver configuration set
//!   .wharf/locks/...                        advisory lock files
//!   .wharf/tmp/                             in-flight downloads
//! ```
//!
//! Every path here is a pure function of its inputs.

use crate::metadata::{ArtifactId, ModuleRevisionId};
use std::path::{Path, PathBuf};

/// Blob subtree, relative to the cache root
pub const FILESTORE_DIR: &str = "filestore";

/// Bookkeeping directory, relative to the cache root
pub const WHARF_DIR: &str = ".wharf";

const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const RESOLVERS_FILE: &str = "resolvers";
const METADATA_PREFIX: &str = "wharfdata";

/// Extension for an artifact that does not declare one
pub fn default_extension(kind: &str, artifact: &str) -> &'static str {
    if kind == "pom" {
        "pom"
    } else if kind == "ivy" || artifact == "ivy" {
        "xml"
    } else {
        "jar"
    }
}

/// Root of the content-addressed blob subtree
pub fn filestore_dir(root: &Path) -> PathBuf {
    root.join(FILESTORE_DIR)
}

/// Location of a blob, sharded by the first two characters of its digest
pub fn blob_path(filestore: &Path, checksum: &str) -> PathBuf {
    let shard = checksum.get(..2).unwrap_or(checksum);
    filestore.join(shard).join(checksum)
}

/// Logical location an artifact is copied out to
pub fn artifact_path(root: &Path, artifact: &ArtifactId) -> PathBuf {
    let module = artifact.module();
    root.join(module.organisation())
        .join(module.module())
        .join(format!("{}s", artifact.kind()))
        .join(artifact.file_name())
}

/// Metadata record of a module revision
pub fn module_metadata_path(root: &Path, id: &ModuleRevisionId, ext: &str) -> PathBuf {
    root.join(id.organisation())
        .join(id.module())
        .join(format!("{}-{}.{}", METADATA_PREFIX, id.revision(), ext))
}

/// The single resolver configuration file of a cache root
pub fn resolvers_path(root: &Path, ext: &str) -> PathBuf {
    root.join(WHARF_DIR).join(format!("{}.{}", RESOLVERS_FILE, ext))
}

/// Directory holding advisory lock files
pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(WHARF_DIR).join(LOCKS_DIR)
}

/// Directory for in-flight downloads; same filesystem as the blobs so promotion is a rename
pub fn tmp_dir(root: &Path) -> PathBuf {
    root.join(WHARF_DIR).join(TMP_DIR)
}
