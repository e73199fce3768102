//! Pluggable encodings for metadata records

use crate::error::{WharfError, WharfResult};
use crate::metadata::model::{
    ArtifactId, ArtifactMetadata, ModuleRevisionId, ModuleRevisionMetadata, ResolverMetadata,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Encoding of metadata records on disk
///
/// Decoding failures are reported as plain reasons; the store attaches the
/// offending path.
pub trait MetadataSerializer: Send + Sync {
    /// File extension of records written by this serializer
    fn extension(&self) -> &'static str;

    fn encode_module(&self, record: &ModuleRevisionMetadata) -> WharfResult<Vec<u8>>;

    fn decode_module(&self, bytes: &[u8]) -> Result<ModuleRevisionMetadata, String>;

    fn encode_resolvers(&self, resolvers: &[ResolverMetadata]) -> WharfResult<Vec<u8>>;

    fn decode_resolvers(&self, bytes: &[u8]) -> Result<Vec<ResolverMetadata>, String>;
}

/// Wrapper so the resolver set encodes as a table in every format
#[derive(Serialize, Deserialize)]
struct ResolverSetRecord {
    #[serde(default)]
    resolvers: Vec<ResolverMetadata>,
}

/// Pretty-printed JSON records
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MetadataSerializer for JsonSerializer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode_module(&self, record: &ModuleRevisionMetadata) -> WharfResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(record)?)
    }

    fn decode_module(&self, bytes: &[u8]) -> Result<ModuleRevisionMetadata, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    fn encode_resolvers(&self, resolvers: &[ResolverMetadata]) -> WharfResult<Vec<u8>> {
        let record = ResolverSetRecord {
            resolvers: resolvers.to_vec(),
        };
        Ok(serde_json::to_vec_pretty(&record)?)
    }

    fn decode_resolvers(&self, bytes: &[u8]) -> Result<Vec<ResolverMetadata>, String> {
        serde_json::from_slice::<ResolverSetRecord>(bytes)
            .map(|record| record.resolvers)
            .map_err(|e| e.to_string())
    }
}

/// TOML records, readable and hand-editable
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlSerializer;

impl TomlSerializer {
    fn text(bytes: &[u8]) -> Result<&str, String> {
        std::str::from_utf8(bytes).map_err(|e| e.to_string())
    }
}

impl MetadataSerializer for TomlSerializer {
    fn extension(&self) -> &'static str {
        "toml"
    }

    fn encode_module(&self, record: &ModuleRevisionMetadata) -> WharfResult<Vec<u8>> {
        Ok(toml::to_string_pretty(record)?.into_bytes())
    }

    fn decode_module(&self, bytes: &[u8]) -> Result<ModuleRevisionMetadata, String> {
        toml::from_str(Self::text(bytes)?).map_err(|e| e.to_string())
    }

    fn encode_resolvers(&self, resolvers: &[ResolverMetadata]) -> WharfResult<Vec<u8>> {
        let record = ResolverSetRecord {
            resolvers: resolvers.to_vec(),
        };
        Ok(toml::to_string_pretty(&record)?.into_bytes())
    }

    fn decode_resolvers(&self, bytes: &[u8]) -> Result<Vec<ResolverMetadata>, String> {
        toml::from_str::<ResolverSetRecord>(Self::text(bytes)?)
            .map(|record| record.resolvers)
            .map_err(|e| e.to_string())
    }
}

/// Compact binary records (BCS)
///
/// BCS is not self-describing, so records go through fixed-shape wire
/// structs where every optional field is always present.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySerializer;

#[derive(Serialize, Deserialize)]
struct BinaryModule {
    module: String,
    latest_resolved_time: String,
    artifacts: Vec<BinaryArtifact>,
}

#[derive(Serialize, Deserialize)]
struct BinaryArtifact {
    name: String,
    kind: String,
    ext: String,
    classifier: Option<String>,
    md5: Option<String>,
    sha1: Option<String>,
    resolver_id: i32,
}

#[derive(Serialize, Deserialize)]
struct BinaryResolver {
    name: String,
    kind: String,
    authentication: Option<String>,
    proxy: Option<String>,
}

impl BinaryArtifact {
    fn from_metadata(artifact: &ArtifactMetadata) -> Self {
        let id = &artifact.artifact;
        Self {
            name: id.name().to_string(),
            kind: id.kind().to_string(),
            ext: id.ext().to_string(),
            classifier: id.classifier().map(str::to_string),
            md5: artifact.md5.clone(),
            sha1: artifact.sha1.clone(),
            resolver_id: artifact.resolver_id,
        }
    }

    fn into_metadata(self, module: &ModuleRevisionId) -> WharfResult<ArtifactMetadata> {
        let mut id = ArtifactId::new(module.clone(), self.name, self.kind)?.with_ext(self.ext)?;
        if let Some(classifier) = self.classifier {
            id = id.with_classifier(classifier)?;
        }
        Ok(ArtifactMetadata {
            md5: self.md5,
            sha1: self.sha1,
            resolver_id: self.resolver_id,
            artifact: id,
        })
    }
}

impl MetadataSerializer for BinarySerializer {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn encode_module(&self, record: &ModuleRevisionMetadata) -> WharfResult<Vec<u8>> {
        let wire = BinaryModule {
            module: record.module.to_string(),
            latest_resolved_time: record.latest_resolved_time.clone(),
            artifacts: record
                .artifacts
                .iter()
                .map(BinaryArtifact::from_metadata)
                .collect(),
        };
        Ok(bcs::to_bytes(&wire)?)
    }

    fn decode_module(&self, bytes: &[u8]) -> Result<ModuleRevisionMetadata, String> {
        let wire: BinaryModule = bcs::from_bytes(bytes).map_err(|e| e.to_string())?;
        let module: ModuleRevisionId = wire.module.parse().map_err(|e: WharfError| e.to_string())?;
        let artifacts = wire
            .artifacts
            .into_iter()
            .map(|artifact| artifact.into_metadata(&module))
            .collect::<WharfResult<Vec<_>>>()
            .map_err(|e| e.to_string())?;

        Ok(ModuleRevisionMetadata {
            module,
            latest_resolved_time: wire.latest_resolved_time,
            artifacts,
        })
    }

    fn encode_resolvers(&self, resolvers: &[ResolverMetadata]) -> WharfResult<Vec<u8>> {
        let wire: Vec<BinaryResolver> = resolvers
            .iter()
            .map(|r| BinaryResolver {
                name: r.name.clone(),
                kind: r.kind.clone(),
                authentication: r.authentication.clone(),
                proxy: r.proxy.clone(),
            })
            .collect();
        Ok(bcs::to_bytes(&wire)?)
    }

    fn decode_resolvers(&self, bytes: &[u8]) -> Result<Vec<ResolverMetadata>, String> {
        let wire: Vec<BinaryResolver> = bcs::from_bytes(bytes).map_err(|e| e.to_string())?;
        Ok(wire
            .into_iter()
            .map(|r| ResolverMetadata {
                name: r.name,
                kind: r.kind,
                authentication: r.authentication,
                proxy: r.proxy,
            })
            .collect())
    }
}

/// Serializer selection, as named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Json,
    Toml,
    Binary,
}

impl SerializerKind {
    /// Instantiate the selected serializer
    pub fn build(&self) -> Arc<dyn MetadataSerializer> {
        match self {
            Self::Json => Arc::new(JsonSerializer),
            Self::Toml => Arc::new(TomlSerializer),
            Self::Binary => Arc::new(BinarySerializer),
        }
    }
}

impl fmt::Display for SerializerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Toml => write!(f, "toml"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

impl FromStr for SerializerKind {
    type Err = WharfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "toml" => Ok(Self::Toml),
            "binary" | "bcs" => Ok(Self::Binary),
            _ => Err(WharfError::InvalidSetting {
                setting: "serializer",
                value: s.to_string(),
                reason: "expected json, toml or binary".to_string(),
            }),
        }
    }
}
