//! Cached resolution records
//!
//! These are the values persisted by the metadata store: one
//! [`ModuleRevisionMetadata`] per resolved module revision, and a set of
//! [`ResolverMetadata`] describing the repositories that fed the cache.

use crate::checksum::{self, ChecksumAlgorithm};
use crate::error::{WharfError, WharfResult};
use crate::layout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Module revision identity, written `organisation#module;revision`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleRevisionId {
    organisation: String,
    module: String,
    revision: String,
}

impl ModuleRevisionId {
    /// Create an identity, rejecting segments that cannot be used as path components
    pub fn new(
        organisation: impl Into<String>,
        module: impl Into<String>,
        revision: impl Into<String>,
    ) -> WharfResult<Self> {
        let id = Self {
            organisation: organisation.into(),
            module: module.into(),
            revision: revision.into(),
        };

        for (field, value) in [
            ("organisation", &id.organisation),
            ("module", &id.module),
            ("revision", &id.revision),
        ] {
            if let Err(reason) = check_segment(value) {
                return Err(WharfError::InvalidModuleId {
                    value: id.to_string(),
                    reason: format!("{} {}", field, reason),
                });
            }
        }
        if id.organisation.contains(['#', ';']) || id.module.contains(['#', ';']) {
            return Err(WharfError::InvalidModuleId {
                value: id.to_string(),
                reason: "'#' and ';' are reserved separators".to_string(),
            });
        }
        // Module trees live beside the blob subtree at the cache root
        if id.organisation == layout::FILESTORE_DIR {
            return Err(WharfError::InvalidModuleId {
                value: id.to_string(),
                reason: format!("organisation {:?} is reserved", layout::FILESTORE_DIR),
            });
        }

        Ok(id)
    }

    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }
}

impl fmt::Display for ModuleRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{};{}", self.organisation, self.module, self.revision)
    }
}

impl FromStr for ModuleRevisionId {
    type Err = WharfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| WharfError::InvalidModuleId {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (organisation, rest) = s
            .split_once('#')
            .ok_or_else(|| invalid("expected organisation#module;revision"))?;
        let (module, revision) = rest
            .split_once(';')
            .ok_or_else(|| invalid("missing ';revision'"))?;

        Self::new(organisation.trim(), module.trim(), revision.trim())
    }
}

impl TryFrom<String> for ModuleRevisionId {
    type Error = WharfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleRevisionId> for String {
    fn from(id: ModuleRevisionId) -> Self {
        id.to_string()
    }
}

/// Artifact identity within a module revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ArtifactIdRecord")]
pub struct ArtifactId {
    module: ModuleRevisionId,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    ext: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classifier: Option<String>,
}

impl ArtifactId {
    /// Create an artifact identity; the extension is derived from the type
    pub fn new(
        module: ModuleRevisionId,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> WharfResult<Self> {
        let name = name.into();
        let kind = kind.into();
        let ext = layout::default_extension(&kind, &name).to_string();
        Self::build(module, name, kind, ext, None)
    }

    /// Override the derived extension
    pub fn with_ext(self, ext: impl Into<String>) -> WharfResult<Self> {
        Self::build(self.module, self.name, self.kind, ext.into(), self.classifier)
    }

    /// Attach a classifier (e.g. `sources`, `javadoc`)
    pub fn with_classifier(self, classifier: impl Into<String>) -> WharfResult<Self> {
        Self::build(
            self.module,
            self.name,
            self.kind,
            self.ext,
            Some(classifier.into()),
        )
    }

    fn build(
        module: ModuleRevisionId,
        name: String,
        kind: String,
        ext: String,
        classifier: Option<String>,
    ) -> WharfResult<Self> {
        let parts = [("name", Some(&name)), ("type", Some(&kind)), ("ext", Some(&ext))];
        for (field, value) in parts.into_iter().chain([("classifier", classifier.as_ref())]) {
            let Some(value) = value else { continue };
            if let Err(reason) = check_segment(value) {
                return Err(WharfError::InvalidModuleId {
                    value: format!("{}!{}", module, name),
                    reason: format!("artifact {} {}", field, reason),
                });
            }
        }

        Ok(Self {
            module,
            name,
            kind,
            ext,
            classifier,
        })
    }

    pub fn module(&self) -> &ModuleRevisionId {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    pub fn classifier(&self) -> Option<&str> {
        self.classifier.as_deref()
    }

    /// File name in the logical layout: `name-revision[-classifier].ext`
    pub fn file_name(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}-{}-{}.{}",
                self.name,
                self.module.revision(),
                classifier,
                self.ext
            ),
            None => format!("{}-{}.{}", self.name, self.module.revision(), self.ext),
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.module, self.file_name())
    }
}

#[derive(Deserialize)]
struct ArtifactIdRecord {
    module: ModuleRevisionId,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    ext: String,
    #[serde(default)]
    classifier: Option<String>,
}

impl TryFrom<ArtifactIdRecord> for ArtifactId {
    type Error = WharfError;

    fn try_from(record: ArtifactIdRecord) -> Result<Self, Self::Error> {
        Self::build(
            record.module,
            record.name,
            record.kind,
            record.ext,
            record.classifier,
        )
    }
}

/// Per-artifact record: identity, digests and producing resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// Identifier of the resolver that produced the artifact (0 = unknown)
    #[serde(default)]
    pub resolver_id: i32,
    pub artifact: ArtifactId,
}

impl ArtifactMetadata {
    pub fn new(artifact: ArtifactId, resolver_id: i32) -> Self {
        Self {
            md5: None,
            sha1: None,
            resolver_id,
            artifact,
        }
    }

    pub fn with_md5(mut self, md5: &str) -> Self {
        self.md5 = Some(checksum::normalize(md5));
        self
    }

    pub fn with_sha1(mut self, sha1: &str) -> Self {
        self.sha1 = Some(checksum::normalize(sha1));
        self
    }

    /// The recorded digest for an algorithm, if any
    pub fn digest(&self, algorithm: ChecksumAlgorithm) -> Option<&str> {
        match algorithm {
            ChecksumAlgorithm::Md5 => self.md5.as_deref(),
            ChecksumAlgorithm::Sha1 => self.sha1.as_deref(),
            ChecksumAlgorithm::Sha256 => None,
        }
    }
}

/// Cached resolution of one module revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRevisionMetadata {
    pub module: ModuleRevisionId,

    /// Epoch milliseconds of the last resolution or re-verification, kept as text
    pub latest_resolved_time: String,

    /// Resolved artifacts, unique by identity, in resolution order
    #[serde(default)]
    pub artifacts: Vec<ArtifactMetadata>,
}

impl ModuleRevisionMetadata {
    /// Create a record resolved now
    pub fn new(module: ModuleRevisionId, artifacts: Vec<ArtifactMetadata>) -> Self {
        let mut metadata = Self {
            module,
            latest_resolved_time: String::new(),
            artifacts: Vec::new(),
        };
        metadata.replace_artifacts(artifacts);
        metadata.touch();
        metadata
    }

    /// Last resolved time in epoch milliseconds; unparseable text counts as never
    pub fn last_resolved_millis(&self) -> i64 {
        self.latest_resolved_time.trim().parse().unwrap_or(0)
    }

    /// Set the last resolved time
    pub fn set_resolved_at(&mut self, at: DateTime<Utc>) {
        self.latest_resolved_time = at.timestamp_millis().to_string();
    }

    /// Refresh the last resolved time to now
    pub fn touch(&mut self) {
        self.set_resolved_at(Utc::now());
    }

    /// Replace the artifact set, dropping later duplicates of the same identity
    pub fn replace_artifacts(&mut self, artifacts: Vec<ArtifactMetadata>) {
        self.artifacts.clear();
        for artifact in artifacts {
            if self.artifact(&artifact.artifact).is_none() {
                self.artifacts.push(artifact);
            }
        }
    }

    /// Look up the record for an artifact identity
    pub fn artifact(&self, id: &ArtifactId) -> Option<&ArtifactMetadata> {
        self.artifacts.iter().find(|a| &a.artifact == id)
    }

    /// Resolver that produced the artifact with this md5, or 0
    pub fn resolver_id_by_md5(&self, md5: &str) -> i32 {
        let md5 = checksum::normalize(md5);
        self.artifacts
            .iter()
            .find(|a| a.md5.as_deref() == Some(md5.as_str()))
            .map_or(0, |a| a.resolver_id)
    }

    /// Resolver that produced the artifact with this sha1, or 0
    pub fn resolver_id_by_sha1(&self, sha1: &str) -> i32 {
        let sha1 = checksum::normalize(sha1);
        self.artifacts
            .iter()
            .find(|a| a.sha1.as_deref() == Some(sha1.as_str()))
            .map_or(0, |a| a.resolver_id)
    }
}

/// Snapshot of a configured repository resolver
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolverMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl ResolverMetadata {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            authentication: None,
            proxy: None,
        }
    }

    pub fn with_authentication(mut self, authentication: impl Into<String>) -> Self {
        self.authentication = Some(authentication.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Stable, non-zero identifier derived from the resolver's configuration.
    ///
    /// Every process sharing a cache computes the same id for the same
    /// configuration, so ids recorded in module metadata stay meaningful.
    pub fn id(&self) -> i32 {
        let text = format!(
            "{}\n{}\n{}\n{}",
            self.name,
            self.kind,
            self.authentication.as_deref().unwrap_or_default(),
            self.proxy.as_deref().unwrap_or_default()
        );
        let digest = checksum::compute_bytes(text.as_bytes(), ChecksumAlgorithm::Sha1);
        let value = i32::from_str_radix(&digest[..7], 16).unwrap_or(0);
        value.max(1)
    }
}

fn check_segment(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.starts_with('.') {
        return Err("must not start with '.'");
    }
    if value.contains(['/', '\\']) || value.chars().any(char::is_control) {
        return Err("must not contain path separators or control characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> ModuleRevisionId {
        "org6#mod6.4;3".parse().unwrap()
    }

    #[test]
    fn module_id_parse_and_display() {
        let id = module();
        assert_eq!(id.organisation(), "org6");
        assert_eq!(id.module(), "mod6.4");
        assert_eq!(id.revision(), "3");
        assert_eq!(id.to_string(), "org6#mod6.4;3");
    }

    #[test]
    fn module_id_rejects_bad_input() {
        assert!("org6-mod6.4-3".parse::<ModuleRevisionId>().is_err());
        assert!("org6#mod6.4".parse::<ModuleRevisionId>().is_err());
        assert!("org6#;3".parse::<ModuleRevisionId>().is_err());
        assert!("../etc#passwd;1".parse::<ModuleRevisionId>().is_err());
        assert!(ModuleRevisionId::new("org", "a/b", "1").is_err());
    }

    #[test]
    fn module_id_rejects_blob_subtree_organisation() {
        let err = "filestore#mod;1".parse::<ModuleRevisionId>().unwrap_err();
        assert!(matches!(err, WharfError::InvalidModuleId { .. }));
        assert!("org#filestore;1".parse::<ModuleRevisionId>().is_ok());
    }

    #[test]
    fn module_id_serializes_as_text() {
        let json = serde_json::to_string(&module()).unwrap();
        assert_eq!(json, "\"org6#mod6.4;3\"");
        let bad: Result<ModuleRevisionId, _> = serde_json::from_str("\"nonsense\"");
        assert!(bad.is_err());
    }

    #[test]
    fn artifact_extension_derived_from_type() {
        let jar = ArtifactId::new(module(), "mod6.4", "jar").unwrap();
        assert_eq!(jar.ext(), "jar");
        let pom = ArtifactId::new(module(), "mod6.4", "pom").unwrap();
        assert_eq!(pom.ext(), "pom");
        let ivy = ArtifactId::new(module(), "ivy", "ivy").unwrap();
        assert_eq!(ivy.ext(), "xml");
    }

    #[test]
    fn artifact_file_name() {
        let sources = ArtifactId::new(module(), "mod6.4", "source")
            .unwrap()
            .with_classifier("sources")
            .unwrap();
        assert_eq!(sources.file_name(), "mod6.4-3-sources.jar");
        assert_eq!(sources.to_string(), "org6#mod6.4;3!mod6.4-3-sources.jar");
    }

    #[test]
    fn artifact_deserialize_validates() {
        let json = r#"{"module":"org#mod;1","name":"../x","type":"jar","ext":"jar"}"#;
        assert!(serde_json::from_str::<ArtifactId>(json).is_err());
    }

    #[test]
    fn module_metadata_deduplicates_artifacts() {
        let jar = ArtifactId::new(module(), "mod6.4", "jar").unwrap();
        let metadata = ModuleRevisionMetadata::new(
            module(),
            vec![
                ArtifactMetadata::new(jar.clone(), 1).with_sha1("AA"),
                ArtifactMetadata::new(jar, 2).with_sha1("BB"),
            ],
        );
        assert_eq!(metadata.artifacts.len(), 1);
        assert_eq!(metadata.artifacts[0].sha1.as_deref(), Some("aa"));
    }

    #[test]
    fn last_resolved_defaults_to_zero() {
        let mut metadata = ModuleRevisionMetadata::new(module(), vec![]);
        assert!(metadata.last_resolved_millis() > 0);
        metadata.latest_resolved_time = "garbage".to_string();
        assert_eq!(metadata.last_resolved_millis(), 0);
    }

    #[test]
    fn resolver_id_lookup_by_digest() {
        let jar = ArtifactId::new(module(), "mod6.4", "jar").unwrap();
        let pom = ArtifactId::new(module(), "mod6.4", "pom").unwrap();
        let metadata = ModuleRevisionMetadata::new(
            module(),
            vec![
                ArtifactMetadata::new(jar, 7).with_md5("ABCDEF"),
                ArtifactMetadata::new(pom, 9).with_sha1("123456"),
            ],
        );
        assert_eq!(metadata.resolver_id_by_md5("abcdef"), 7);
        assert_eq!(metadata.resolver_id_by_sha1("123456"), 9);
        assert_eq!(metadata.resolver_id_by_sha1("ffffff"), 0);
    }

    #[test]
    fn resolver_id_is_stable_and_value_based() {
        let a = ResolverMetadata::new("central", "ibiblio").with_proxy("proxy:3128");
        let same = ResolverMetadata::new("central", "ibiblio").with_proxy("proxy:3128");
        let other = ResolverMetadata::new("central", "ibiblio");
        assert_eq!(a, same);
        assert_eq!(a.id(), same.id());
        assert_ne!(a.id(), other.id());
        assert!(a.id() > 0);
    }
}
