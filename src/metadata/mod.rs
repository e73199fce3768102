//! Resolved module metadata
//!
//! Records what a module revision resolved to (artifacts, digests, producing
//! resolver, when) and which repository resolvers fed the cache. The store is
//! independent of the encoding; see [`serializer`].

pub mod model;
pub mod serializer;
pub mod store;

pub use model::{ArtifactId, ArtifactMetadata, ModuleRevisionId, ModuleRevisionMetadata, ResolverMetadata};
pub use serializer::{JsonSerializer, MetadataSerializer, SerializerKind, TomlSerializer};
pub use store::MetadataStore;
