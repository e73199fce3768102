//! Module resolution cache
//!
//! Serves resolvers from a shared on-disk cache root. Module metadata is
//! trusted or re-checked according to the staleness policy; artifact bytes
//! are verified once, stored by checksum and copied out to their logical
//! location.
//!
//! # Resolution States
//!
//! | State | Served from cache | Description |
//! |-------|-------------------|-------------|
//! | Unresolved | no | No metadata recorded |
//! | ResolvedFresh | yes | Stable revision, or changing revision within policy |
//! | ResolvedStale | no | Changing revision the policy wants re-checked |
//! | ResolvingInProgress | no | Module lock held by another task or process |
//!
//! Stale and unresolved entries move to in-progress when a caller takes the
//! module lock, and to fresh once a resolution is recorded or re-verified.

pub mod fetch;
pub mod manager;
pub mod state;

pub use fetch::{ArtifactFetcher, ArtifactRequest, FileRepositoryFetcher, ModuleResolver};
pub use manager::CacheManager;
pub use state::{CachedResolution, ResolutionState, ResolverDrift};
